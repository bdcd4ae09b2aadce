//! # Completion Fences
//!
//! Split completion objects: the submitter keeps the signaling [`Fence`],
//! the caller gets a cloneable [`FenceHandle`] to poll or wait on.
//!
//! Fence identities are `(context, seqno)` pairs. Contexts come from a
//! fixed-size bitmap pool; when the pool is exhausted a fresh out-of-pool
//! context is minted instead, with a warning, so submission never blocks
//! on fence bookkeeping.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{Error, Result};
use crate::traits::Clock;

// =============================================================================
// FENCE CONTEXT POOL
// =============================================================================

/// Number of pooled fence contexts
pub const FENCE_CTX_POOL_SIZE: u32 = 64;

/// A fence context taken from (or minted outside) the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceContext {
    id: u64,
    pooled: bool,
}

impl FenceContext {
    /// Context id
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Whether this context returns to the bitmap on release
    #[inline]
    pub const fn is_pooled(self) -> bool {
        self.pooled
    }
}

/// Fixed-size bitmap pool of fence contexts
pub struct FenceContextPool {
    /// Occupancy bitmap, bit i = context i in use
    bits: Mutex<u64>,
    /// Next out-of-pool context id
    next_unpooled: AtomicU64,
}

impl FenceContextPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(0),
            next_unpooled: AtomicU64::new(FENCE_CTX_POOL_SIZE as u64),
        }
    }

    /// Acquire a context
    ///
    /// Falls back to a fresh out-of-pool context when the bitmap is full.
    pub fn acquire(&self) -> FenceContext {
        let mut bits = self.bits.lock();
        let free = (!*bits).trailing_zeros();
        if free < FENCE_CTX_POOL_SIZE {
            *bits |= 1u64 << free;
            return FenceContext {
                id: free as u64,
                pooled: true,
            };
        }
        drop(bits);

        let id = self.next_unpooled.fetch_add(1, Ordering::Relaxed);
        log::warn!("fence context pool exhausted, minting context {}", id);
        FenceContext { id, pooled: false }
    }

    /// Release a previously acquired context
    pub fn release(&self, ctx: FenceContext) {
        if !ctx.pooled {
            return;
        }
        let mut bits = self.bits.lock();
        let mask = 1u64 << ctx.id;
        if *bits & mask == 0 {
            log::warn!("fence context {} released twice", ctx.id);
            return;
        }
        *bits &= !mask;
    }

    /// Number of pooled contexts currently in use
    pub fn in_use(&self) -> u32 {
        self.bits.lock().count_ones()
    }

    /// Number of pooled contexts still free
    pub fn free_count(&self) -> u32 {
        FENCE_CTX_POOL_SIZE - self.in_use()
    }
}

impl fmt::Debug for FenceContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceContextPool")
            .field("in_use", &self.in_use())
            .finish()
    }
}

// =============================================================================
// FENCE
// =============================================================================

const FENCE_PENDING: u32 = 0;
const FENCE_SIGNALED: u32 = 1;

/// Shared state between the signal and wait sides
struct FenceInner {
    context: FenceContext,
    seqno: u64,
    /// Fast-path signaled flag
    state: AtomicU32,
    /// Completion result, written exactly once
    result: Mutex<Option<Result<()>>>,
    pool: Arc<FenceContextPool>,
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        // Last reference gone (signal side and every handle): return the
        // context to the bitmap.
        self.pool.release(self.context);
    }
}

/// Signal side of a completion fence
///
/// Held by the dispatch path; signaled exactly once when the command
/// completes or fails.
pub struct Fence {
    inner: Arc<FenceInner>,
}

/// Wait side of a completion fence
///
/// Cloneable; dropping the last handle together with the fence releases
/// the underlying pooled context.
#[derive(Clone)]
pub struct FenceHandle {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Create a fence on a context acquired from `pool`
    pub fn new(pool: &Arc<FenceContextPool>, seqno: u64) -> (Fence, FenceHandle) {
        let inner = Arc::new(FenceInner {
            context: pool.acquire(),
            seqno,
            state: AtomicU32::new(FENCE_PENDING),
            result: Mutex::new(None),
            pool: Arc::clone(pool),
        });
        (
            Fence {
                inner: Arc::clone(&inner),
            },
            FenceHandle { inner },
        )
    }

    /// Fence context id
    pub fn context(&self) -> u64 {
        self.inner.context.id()
    }

    /// Fence sequence number
    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    /// Signal the fence with a completion result
    ///
    /// Only the first signal takes effect; later ones are dropped.
    pub fn signal(&self, result: Result<()>) {
        let mut slot = self.inner.result.lock();
        if slot.is_some() {
            log::debug!(
                "fence {}:{} already signaled",
                self.inner.context.id(),
                self.inner.seqno
            );
            return;
        }
        *slot = Some(result);
        self.inner.state.store(FENCE_SIGNALED, Ordering::Release);
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fence({}:{}, signaled={})",
            self.inner.context.id(),
            self.inner.seqno,
            self.inner.state.load(Ordering::Acquire) == FENCE_SIGNALED
        )
    }
}

impl FenceHandle {
    /// Fence context id
    pub fn context(&self) -> u64 {
        self.inner.context.id()
    }

    /// Fence sequence number
    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    /// Check completion without blocking
    pub fn is_signaled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FENCE_SIGNALED
    }

    /// Completion result, if signaled
    pub fn result(&self) -> Option<Result<()>> {
        if !self.is_signaled() {
            return None;
        }
        *self.inner.result.lock()
    }

    /// Completion errno, if signaled (0 = success)
    pub fn errno(&self) -> Option<i32> {
        self.result().map(|r| match r {
            Ok(()) => 0,
            Err(e) => e.errno(),
        })
    }

    /// Poll until signaled or `timeout_us` elapses
    pub fn wait(&self, clock: &dyn Clock, timeout_us: u64) -> Result<()> {
        let deadline = clock.now_us().saturating_add(timeout_us);
        while !self.is_signaled() {
            if clock.now_us() >= deadline {
                return Err(Error::Timeout);
            }
            core::hint::spin_loop();
        }
        // Signaled implies the result slot is populated
        self.inner.result.lock().unwrap_or(Ok(()))
    }
}

impl fmt::Debug for FenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FenceHandle({}:{}, signaled={})",
            self.inner.context.id(),
            self.inner.seqno,
            self.is_signaled()
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct StepClock(AtomicU64);

    impl StepClock {
        fn new() -> Self {
            Self(AtomicU64::new(0))
        }
    }

    impl Clock for StepClock {
        fn now_us(&self) -> u64 {
            // Each observation advances time so timeout loops terminate
            self.0.fetch_add(100, Ordering::Relaxed)
        }
    }

    #[test]
    fn test_pool_acquire_release() {
        let pool = FenceContextPool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(a.is_pooled() && b.is_pooled());
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.in_use(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pool_exhaustion_falls_back() {
        let pool = FenceContextPool::new();
        let all: Vec<_> = (0..FENCE_CTX_POOL_SIZE).map(|_| pool.acquire()).collect();
        assert_eq!(pool.free_count(), 0);

        let extra = pool.acquire();
        assert!(!extra.is_pooled());
        assert!(extra.id() >= FENCE_CTX_POOL_SIZE as u64);

        // Releasing an out-of-pool context is a no-op
        pool.release(extra);
        assert_eq!(pool.free_count(), 0);

        for ctx in all {
            pool.release(ctx);
        }
        assert_eq!(pool.free_count(), FENCE_CTX_POOL_SIZE);
    }

    #[test]
    fn test_fence_signal_once() {
        let pool = Arc::new(FenceContextPool::new());
        let (fence, handle) = Fence::new(&pool, 1);

        assert!(!handle.is_signaled());
        assert_eq!(handle.result(), None);

        fence.signal(Ok(()));
        assert!(handle.is_signaled());
        assert_eq!(handle.result(), Some(Ok(())));

        // Second signal is dropped
        fence.signal(Err(Error::RemoteIo));
        assert_eq!(handle.result(), Some(Ok(())));
        assert_eq!(handle.errno(), Some(0));
    }

    #[test]
    fn test_fence_error_propagates() {
        let pool = Arc::new(FenceContextPool::new());
        let (fence, handle) = Fence::new(&pool, 7);

        fence.signal(Err(Error::Timeout));
        assert_eq!(handle.result(), Some(Err(Error::Timeout)));
        assert_eq!(handle.errno(), Some(crate::error::errno::ETIME));
    }

    #[test]
    fn test_fence_drop_releases_context() {
        let pool = Arc::new(FenceContextPool::new());
        let (fence, handle) = Fence::new(&pool, 1);
        assert_eq!(pool.in_use(), 1);

        let handle2 = handle.clone();
        drop(fence);
        drop(handle);
        // A clone still pins the context
        assert_eq!(pool.in_use(), 1);

        drop(handle2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_wait_timeout() {
        let pool = Arc::new(FenceContextPool::new());
        let (_fence, handle) = Fence::new(&pool, 1);

        let clock = StepClock::new();
        assert_eq!(handle.wait(&clock, 1_000), Err(Error::Timeout));
    }

    #[test]
    fn test_wait_signaled() {
        let pool = Arc::new(FenceContextPool::new());
        let (fence, handle) = Fence::new(&pool, 1);
        fence.signal(Ok(()));

        let clock = StepClock::new();
        assert_eq!(handle.wait(&clock, 1_000), Ok(()));
    }
}
