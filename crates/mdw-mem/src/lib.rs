//! # MDW Memory Management
//!
//! Memory objects, the handle registry, and the command buffer pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MDW Memory System                       │
//! │                                                             │
//! │  ┌──────────────────────┐      ┌─────────────────────────┐  │
//! │  │     MemRegistry      │      │       CmdbufPool        │  │
//! │  │ (handle → object,    │      │ (per-session duplicate  │  │
//! │  │  refcounts, stats)   │      │  buffer arena)          │  │
//! │  └──────────────────────┘      └─────────────────────────┘  │
//! │             │                              │                │
//! │  ┌──────────┴──────────────────────────────┴─────────────┐  │
//! │  │              Caller-visible memory objects            │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Caller command buffers are never handed to the device directly: the
//! command engine duplicates them into pool chunks, validates the copies,
//! and flushes the chunk before dispatch.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod object;
pub mod pool;

// Re-exports
pub use object::{MemFlags, MemObject, MemRegistry, MemStats};
pub use pool::{CmdbufPool, PoolChunk, PoolConfig, PoolStats};
