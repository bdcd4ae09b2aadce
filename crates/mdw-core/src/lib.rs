//! # MDW Core
//!
//! Foundational traits, types, and abstractions for the APU midware.
//!
//! This crate provides the type-system foundations shared by the whole
//! dispatch stack: strongly typed addresses and sizes, the unified error
//! type, completion fences, and the seam traits the upper layers plug
//! hardware-specific behavior into.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       mdw-core                              │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │     Error           │  │
//! │  │ (Transport, │  │ (DeviceAddr,│  │   Handling          │  │
//! │  │  Validator) │  │  ByteSize)  │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │        Fences (contexts, seqnos, completion)          │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{Error, RemoteStatus, Result};
pub use sync::{Fence, FenceContextPool, FenceHandle};
pub use traits::*;
pub use types::*;
