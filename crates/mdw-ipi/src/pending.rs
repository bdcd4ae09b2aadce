//! # Pending Reply Table
//!
//! In-flight IPI requests awaiting a reply from the RV co-processor.
//!
//! Entries are keyed by sync id and removed exactly once: either the
//! matching reply takes them out, or the synchronous-send timeout path
//! removes them defensively. Whichever side gets the entry owns the
//! completion callback.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::msg::IpiFrame;

// =============================================================================
// PENDING ENTRY
// =============================================================================

/// Completion callback invoked with the reply frame
pub type ReplyFn = Box<dyn FnOnce(&IpiFrame) + Send>;

/// One in-flight request
struct PendingEntry {
    sync_id: u64,
    msg_id: u32,
    on_reply: ReplyFn,
}

// =============================================================================
// PENDING TABLE
// =============================================================================

/// Table of in-flight requests
///
/// Sync ids are generational: a global counter that never recycles, so a
/// stale reply cannot alias a newer request even if their storage was
/// reused.
pub struct PendingTable {
    entries: Mutex<Vec<PendingEntry>>,
    next_sync_id: AtomicU64,
}

impl PendingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_sync_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh sync id
    pub fn alloc_sync_id(&self) -> u64 {
        self.next_sync_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert an in-flight request
    pub fn insert(&self, sync_id: u64, msg_id: u32, on_reply: ReplyFn) {
        self.entries.lock().push(PendingEntry {
            sync_id,
            msg_id,
            on_reply,
        });
    }

    /// Remove an entry by sync id, surrendering its callback
    ///
    /// Returns `None` when the other side (reply vs timeout) already took
    /// it; callers treat that as "not mine to complete".
    pub fn remove(&self, sync_id: u64) -> Option<ReplyFn> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.sync_id == sync_id)?;
        let entry = entries.swap_remove(pos);
        // Exact-match invariant: position() found it by the same key
        if entry.sync_id != sync_id {
            log::warn!(
                "pending entry mismatch: removed {} while looking for {}",
                entry.sync_id,
                sync_id
            );
        }
        Some(entry.on_reply)
    }

    /// Number of in-flight requests
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no requests are in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Message id of a pending entry, for diagnostics
    pub fn msg_id_of(&self, sync_id: u64) -> Option<u32> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.sync_id == sync_id)
            .map(|e| e.msg_id)
    }
}

impl fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("in_flight", &self.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
