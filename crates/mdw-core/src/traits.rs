//! # MDW Core Traits
//!
//! Seam traits the dispatch stack is assembled around.
//!
//! The midware core is transport- and hardware-agnostic: the mailbox link
//! to the RV co-processor, the per-device-type command inspection, and the
//! time source are all injected through these traits.

use crate::error::Result;
use crate::types::*;

// =============================================================================
// TRANSPORT TRAIT
// =============================================================================

/// Mailbox transport to the RV co-processor
///
/// `send` transfers one wire frame. A transport may refuse a frame with
/// [`Error::Busy`](crate::Error::Busy) when the channel is congested; the
/// IPI layer retries those per its policy. Replies arrive out of band and
/// are fed back through the IPI layer's reply entry point.
pub trait Transport: Send + Sync {
    /// Send one frame to the remote processor
    fn send(&self, frame: &[u8]) -> Result<()>;
}

// =============================================================================
// DEVICE VALIDATOR TRAIT
// =============================================================================

/// Per-device-type inspection of duplicated command buffers
///
/// Runs synchronously in the submitter's context after duplication and
/// before dispatch. A rejection aborts command creation entirely; no
/// partially validated command is ever dispatched.
pub trait DeviceValidator: Send + Sync {
    /// Device type this validator covers
    fn device_type(&self) -> DeviceType;

    /// Inspect one subcommand's duplicated buffer
    fn validate(&self, subcmd_index: usize, cmdbuf: &[u8]) -> Result<()>;
}

/// Validator that accepts every command buffer
///
/// Stands in for device types that defer all checking to firmware.
#[derive(Debug, Clone, Copy)]
pub struct AcceptAll(pub DeviceType);

impl DeviceValidator for AcceptAll {
    fn device_type(&self) -> DeviceType {
        self.0
    }

    fn validate(&self, _subcmd_index: usize, _cmdbuf: &[u8]) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// CLOCK TRAIT
// =============================================================================

/// Monotonic time source
///
/// Timeout waits poll `now_us` rather than blocking on an OS primitive so
/// the stack stays hostable in freestanding environments.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary fixed origin
    fn now_us(&self) -> u64;

    /// Delay for `us` microseconds
    ///
    /// The default implementation busy-waits against `now_us`.
    fn sleep_us(&self, us: u64) {
        let deadline = self.now_us().saturating_add(us);
        while self.now_us() < deadline {
            core::hint::spin_loop();
        }
    }
}

/// Clock backed by `std::time::Instant`
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Create a clock with its origin at construction time
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn sleep_us(&self, us: u64) {
        std::thread::sleep(std::time::Duration::from_micros(us));
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

// Ensure key types are Send + Sync
static_assertions::assert_impl_all!(DeviceAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(DeviceType: Send, Sync, Copy);
static_assertions::assert_impl_all!(CmdId: Send, Sync, Copy);

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all_validator() {
        let v = AcceptAll(DeviceType::Dla);
        assert_eq!(v.device_type(), DeviceType::Dla);
        assert!(v.validate(0, &[0u8; 16]).is_ok());
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_std_clock_monotonic() {
        let clock = StdClock::new();
        let a = clock.now_us();
        clock.sleep_us(1_000);
        let b = clock.now_us();
        assert!(b >= a + 500);
    }
}
