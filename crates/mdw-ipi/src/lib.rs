//! # MDW IPI Protocol
//!
//! Wire protocol and messaging to the RV co-processor.
//!
//! ## Architecture
//!
//! The accelerator's command executor runs on an RV-controlled
//! co-processor. The host talks to it over a mailbox transport with
//! fixed-size frames; replies arrive asynchronously and are matched back
//! to their request by sync id.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      IPI Message Flow                        │
//! │                                                              │
//! │  ┌────────────────┐    IpiFrame (64 B)   ┌────────────────┐  │
//! │  │   Host (MDW)   │ ───────────────────▶ │   RV executor  │  │
//! │  │                │ ◀─────────────────── │                │  │
//! │  └───────┬────────┘      reply frame     └────────────────┘  │
//! │          │                                                   │
//! │  ┌───────▼────────┐                                          │
//! │  │  PendingTable  │  sync_id → completion callback           │
//! │  └────────────────┘                                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reply Matching
//!
//! 1. Host allocates a fresh sync id and inserts a pending entry
//! 2. Frame is sent, retrying on transport congestion per policy
//! 3. The reply carries the same sync id back
//! 4. The pending entry is removed exactly once: by the reply, or by
//!    the synchronous-send timeout path
//! 5. Replies with no pending entry are logged and dropped
//!
//! Sync ids are generational sequence numbers, never recycled object
//! addresses, so a late reply can never match a newer request.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod dev;
pub mod msg;
pub mod pending;

// Re-exports
pub use dev::{HandshakeInfo, IpiTimeouts, RetryPolicy, RvDevice, RvStats};
pub use msg::{CmdPayload, HandshakePayload, IpiFrame, IpiHeader, MsgId, ParamPayload};
pub use pending::PendingTable;
