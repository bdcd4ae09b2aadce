//! # MDW Command Engine
//!
//! Command submission and dispatch for the APU midware. Clients open a
//! [`Session`] against the [`MdwDevice`], describe a command as a DAG of
//! subcommands over registered memory, and get back a completion fence.
//! The engine duplicates command buffers into pooled device memory,
//! validates them, and drives the RV co-processor over the IPI link.
//!
//! ```text
//!   +---------+   Run/RunStale/Del   +-----------+
//!   | Session |--------------------->| MdwDevice |
//!   |  cmds   |                      |  dispatch |
//!   |  mems   |<---------------------|  complete |
//!   +---------+    copy-out, fence   +-----+-----+
//!                                          |
//!                                          v IPI
//!                                    +-----------+
//!                                    |  RV co-   |
//!                                    | processor |
//!                                    +-----------+
//! ```
//!
//! Submission is lock-light: the session lock is never held across an IPI
//! send, so a transport that completes inline cannot deadlock the run
//! path against its own completion.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod cmd;
pub mod device;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use cmd::{
    AdjMatrix, Cmd, CmdLink, CmdParams, CmdState, CmdbufDir, Layout, Subcmd, SubcmdDesc,
    EXEC_INFO_SIZE, MAX_SUBCMDS,
};
pub use device::{MdwDevice, PARAM_KLOG, PARAM_ULOG};
pub use session::{CmdOp, CmdReply, Session};
