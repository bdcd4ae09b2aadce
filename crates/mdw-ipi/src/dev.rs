//! # RV Device
//!
//! The host endpoint of the IPI link: serializes sends to the RV
//! co-processor, retries on transport congestion, and matches replies
//! back to their requests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use mdw_core::{Clock, Error, RemoteStatus, Result, Transport};

use crate::msg::{
    CmdPayload, HandshakePayload, IpiFrame, MsgId, ParamPayload, HANDSHAKE_MAGIC,
    PROTOCOL_VERSION,
};
use crate::pending::{PendingTable, ReplyFn};

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Backoff policy for congested sends
///
/// The transport reports congestion as [`Error::Busy`]. Early retries
/// back off briefly on the assumption the mailbox drains fast; persistent
/// congestion moves to the longer tiers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Give up after this many retries
    pub max_retries: u32,
    /// Attempts below this use the short backoff
    pub short_retries: u32,
    /// Attempts below this (and above `short_retries`) use the mid backoff
    pub mid_retries: u32,
    /// Short backoff, microseconds
    pub short_us: u64,
    /// Mid backoff, microseconds
    pub mid_us: u64,
    /// Long backoff, microseconds
    pub long_us: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 100,
            short_retries: 10,
            mid_retries: 50,
            short_us: 200,
            mid_us: 1_000,
            long_us: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt`
    pub fn backoff_us(&self, attempt: u32) -> u64 {
        if attempt < self.short_retries {
            self.short_us
        } else if attempt < self.mid_retries {
            self.mid_us
        } else {
            self.long_us
        }
    }
}

// =============================================================================
// TIMEOUTS
// =============================================================================

/// IPI deadline configuration
#[derive(Debug, Clone)]
pub struct IpiTimeouts {
    /// Synchronous send: how long to wait for the reply, microseconds
    pub sync_reply_us: u64,
}

impl Default for IpiTimeouts {
    fn default() -> Self {
        Self {
            // Covers remote-side power transitions; beyond this the
            // co-processor is considered unresponsive
            sync_reply_us: 10_000_000,
        }
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Link accounting snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct RvStats {
    /// Frames accepted by the transport
    pub sends: u64,
    /// Busy retries performed
    pub retries: u64,
    /// Replies matched to a pending entry
    pub replies: u64,
    /// Replies with no pending entry, dropped
    pub stale_replies: u64,
    /// Synchronous sends that hit their deadline
    pub timeouts: u64,
}

#[derive(Default)]
struct RvCounters {
    sends: AtomicU64,
    retries: AtomicU64,
    replies: AtomicU64,
    stale_replies: AtomicU64,
    timeouts: AtomicU64,
}

// =============================================================================
// HANDSHAKE INFO
// =============================================================================

/// Result of the version/feature exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Protocol version the remote side speaks
    pub version: u32,
    /// Feature bits the remote side supports
    pub features: u64,
}

// =============================================================================
// RV DEVICE
// =============================================================================

/// Host endpoint of the IPI link to the RV co-processor
pub struct RvDevice {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    pending: PendingTable,
    retry: RetryPolicy,
    timeouts: IpiTimeouts,
    /// Serializes frames onto the transport
    send_mtx: Mutex<()>,
    counters: RvCounters,
}

impl RvDevice {
    /// Create a device with default policy
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(transport, clock, RetryPolicy::default(), IpiTimeouts::default())
    }

    /// Create a device with explicit retry/timeout configuration
    pub fn with_config(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        timeouts: IpiTimeouts,
    ) -> Self {
        Self {
            transport,
            clock,
            pending: PendingTable::new(),
            retry,
            timeouts,
            send_mtx: Mutex::new(()),
            counters: RvCounters::default(),
        }
    }

    /// Number of requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Link accounting snapshot
    pub fn stats(&self) -> RvStats {
        RvStats {
            sends: self.counters.sends.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            replies: self.counters.replies.load(Ordering::Relaxed),
            stale_replies: self.counters.stale_replies.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Push one frame through the transport, retrying on congestion
    fn send_frame(&self, frame: &IpiFrame) -> Result<()> {
        let _guard = self.send_mtx.lock();

        let mut attempt = 0u32;
        loop {
            match self.transport.send(frame.as_bytes()) {
                Ok(()) => {
                    self.counters.sends.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(Error::Busy) if attempt < self.retry.max_retries => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.clock.sleep_us(self.retry.backoff_us(attempt));
                    attempt += 1;
                }
                Err(Error::Busy) => {
                    log::warn!(
                        "ipi send still busy after {} retries, giving up",
                        self.retry.max_retries
                    );
                    return Err(Error::Busy);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a request, invoking `on_reply` when the reply arrives
    ///
    /// Returns the sync id the request went out under. The pending entry
    /// is inserted before the frame is sent so a fast reply cannot miss it.
    pub fn send_async(&self, mut frame: IpiFrame, on_reply: ReplyFn) -> Result<u64> {
        let sync_id = self.pending.alloc_sync_id();
        frame.header.sync_id = sync_id;

        self.pending.insert(sync_id, frame.header.id, on_reply);

        if let Err(e) = self.send_frame(&frame) {
            // Unwind: the request never reached the wire
            self.pending.remove(sync_id);
            return Err(e);
        }
        Ok(sync_id)
    }

    /// Send a request and wait for its reply
    ///
    /// On deadline expiry the pending entry is removed defensively in case
    /// a late reply still arrives; if the reply won the race instead, it
    /// is honored.
    pub fn send_sync(&self, frame: IpiFrame) -> Result<IpiFrame> {
        let slot: Arc<Mutex<Option<IpiFrame>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);

        let sync_id = self.send_async(
            frame,
            Box::new(move |reply| {
                *slot2.lock() = Some(*reply);
            }),
        )?;

        let deadline = self.clock.now_us().saturating_add(self.timeouts.sync_reply_us);
        loop {
            if let Some(reply) = *slot.lock() {
                return match RemoteStatus::from_raw(reply.header.status) {
                    None => Ok(reply),
                    Some(status) => Err(status.into()),
                };
            }

            if self.clock.now_us() >= deadline {
                if self.pending.remove(sync_id).is_some() {
                    // Entry was still ours: a genuine timeout
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    log::warn!("ipi sync_id {} timed out", sync_id);
                    return Err(Error::Timeout);
                }
                // The reply is being delivered right now; pick it up on
                // the next pass
            }
            core::hint::spin_loop();
        }
    }

    /// Feed a received frame back into the matcher
    ///
    /// Called by whoever pumps the transport's receive side.
    pub fn handle_reply(&self, bytes: &[u8]) -> Result<()> {
        let frame = IpiFrame::from_bytes(bytes)?;
        let sync_id = frame.header.sync_id;

        match self.pending.remove(sync_id) {
            Some(on_reply) => {
                self.counters.replies.fetch_add(1, Ordering::Relaxed);
                on_reply(&frame);
                Ok(())
            }
            None => {
                self.counters.stale_replies.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping reply with unknown sync_id {}", sync_id);
                Err(Error::NotFound)
            }
        }
    }

    // =========================================================================
    // Protocol operations
    // =========================================================================

    /// Version and feature exchange with the remote side
    pub fn handshake(&self) -> Result<HandshakeInfo> {
        let mut frame = IpiFrame::new(0, MsgId::Handshake);
        frame.set_payload(&HandshakePayload {
            magic: HANDSHAKE_MAGIC,
            version: PROTOCOL_VERSION,
            _pad: 0,
            features: 0,
        })?;

        let reply = self.send_sync(frame)?;
        let payload: HandshakePayload = reply.payload_as()?;
        if payload.magic != HANDSHAKE_MAGIC {
            log::warn!("handshake magic mismatch: 0x{:x}", payload.magic);
            return Err(Error::RemoteIo);
        }
        Ok(HandshakeInfo {
            version: payload.version,
            features: payload.features,
        })
    }

    /// Read a remote runtime parameter
    pub fn param_get(&self, param: u32) -> Result<u64> {
        let mut frame = IpiFrame::new(0, MsgId::ParamGet);
        frame.set_payload(&ParamPayload {
            param,
            _pad: 0,
            value: 0,
        })?;

        let reply = self.send_sync(frame)?;
        let payload: ParamPayload = reply.payload_as()?;
        Ok(payload.value)
    }

    /// Write a remote runtime parameter
    pub fn param_set(&self, param: u32, value: u64) -> Result<()> {
        let mut frame = IpiFrame::new(0, MsgId::ParamSet);
        frame.set_payload(&ParamPayload {
            param,
            _pad: 0,
            value,
        })?;

        self.send_sync(frame).map(|_| ())
    }

    /// Dispatch a command buffer for execution
    pub fn send_cmd(&self, payload: &CmdPayload, on_reply: ReplyFn) -> Result<u64> {
        let mut frame = IpiFrame::new(0, MsgId::CmdRun);
        frame.set_payload(payload)?;
        self.send_async(frame, on_reply)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicU32;
    use std::thread;

    struct StepClock(AtomicU64);

    impl StepClock {
        fn new() -> Self {
            Self(AtomicU64::new(0))
        }
    }

    impl Clock for StepClock {
        fn now_us(&self) -> u64 {
            self.0.fetch_add(50, Ordering::Relaxed)
        }

        fn sleep_us(&self, us: u64) {
            self.0.fetch_add(us, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        /// Refuse this many sends with Busy first
        busy_left: AtomicU32,
    }

    impl FakeTransport {
        fn busy(n: u32) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                busy_left: AtomicU32::new(n),
            }
        }

        fn sent_frames(&self) -> usize {
            self.sent.lock().len()
        }

        fn last_frame(&self) -> IpiFrame {
            IpiFrame::from_bytes(self.sent.lock().last().expect("a frame was sent")).unwrap()
        }
    }

    impl Transport for FakeTransport {
        fn send(&self, frame: &[u8]) -> Result<()> {
            if self
                .busy_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    v.checked_sub(1)
                })
                .is_ok()
            {
                return Err(Error::Busy);
            }
            self.sent.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn device(transport: Arc<FakeTransport>) -> RvDevice {
        RvDevice::new(transport, Arc::new(StepClock::new()))
    }

    fn reply_to(dev: &RvDevice, request: IpiFrame, status: u32) {
        let mut reply = request;
        reply.header.status = status;
        dev.handle_reply(reply.as_bytes()).unwrap();
    }

    #[test]
    fn test_send_async_tracks_pending() {
        let transport = Arc::new(FakeTransport::default());
        let dev = device(Arc::clone(&transport));

        let sync_id = dev
            .send_async(IpiFrame::new(0, MsgId::CmdRun), Box::new(|_| {}))
            .unwrap();

        assert_eq!(transport.sent_frames(), 1);
        assert_eq!(dev.pending_count(), 1);
        assert_eq!(transport.last_frame().header.sync_id, sync_id);
    }

    #[test]
    fn test_retry_on_busy() {
        let transport = Arc::new(FakeTransport::busy(3));
        let dev = device(Arc::clone(&transport));

        dev.send_async(IpiFrame::new(0, MsgId::ParamSet), Box::new(|_| {}))
            .unwrap();

        assert_eq!(transport.sent_frames(), 1);
        assert_eq!(dev.stats().retries, 3);
    }

    #[test]
    fn test_retry_exhaustion_unwinds_pending() {
        let transport = Arc::new(FakeTransport::busy(u32::MAX));
        let dev = device(Arc::clone(&transport));

        let err = dev
            .send_async(IpiFrame::new(0, MsgId::CmdRun), Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, Error::Busy);
        assert_eq!(dev.pending_count(), 0);
        assert_eq!(dev.stats().retries, 100);
    }

    #[test]
    fn test_backoff_tiers() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_us(0), 200);
        assert_eq!(p.backoff_us(9), 200);
        assert_eq!(p.backoff_us(10), 1_000);
        assert_eq!(p.backoff_us(49), 1_000);
        assert_eq!(p.backoff_us(50), 10_000);
        assert_eq!(p.backoff_us(99), 10_000);
    }

    #[test]
    fn test_reply_matching() {
        let transport = Arc::new(FakeTransport::default());
        let dev = device(Arc::clone(&transport));

        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        dev.send_async(
            IpiFrame::new(0, MsgId::CmdRun),
            Box::new(move |_| {
                fired2.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

        reply_to(&dev, transport.last_frame(), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(dev.pending_count(), 0);
        assert_eq!(dev.stats().replies, 1);

        // A duplicate of the same reply is stale and must not re-fire
        let mut dup = transport.last_frame();
        dup.header.status = 0;
        assert_eq!(dev.handle_reply(dup.as_bytes()), Err(Error::NotFound));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(dev.stats().stale_replies, 1);
    }

    #[test]
    fn test_send_sync_timeout_removes_pending() {
        let transport = Arc::new(FakeTransport::default());
        let dev = RvDevice::with_config(
            transport.clone(),
            Arc::new(StepClock::new()),
            RetryPolicy::default(),
            IpiTimeouts { sync_reply_us: 1_000 },
        );

        assert_eq!(
            dev.send_sync(IpiFrame::new(0, MsgId::ParamGet)),
            Err(Error::Timeout)
        );
        assert_eq!(dev.pending_count(), 0);
        assert_eq!(dev.stats().timeouts, 1);

        // A late reply after the timeout is dropped as stale
        assert_eq!(
            dev.handle_reply(transport.last_frame().as_bytes()),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_send_sync_roundtrip() {
        let transport = Arc::new(FakeTransport::default());
        let dev = Arc::new(device(Arc::clone(&transport)));

        let dev2 = Arc::clone(&dev);
        let transport2 = Arc::clone(&transport);
        let responder = thread::spawn(move || {
            while transport2.sent_frames() == 0 {
                thread::yield_now();
            }
            let mut reply = transport2.last_frame();
            reply.header.status = 0;
            reply
                .set_payload(&ParamPayload {
                    param: 3,
                    _pad: 0,
                    value: 42,
                })
                .unwrap();
            dev2.handle_reply(reply.as_bytes()).unwrap();
        });

        assert_eq!(dev.param_get(3), Ok(42));
        responder.join().unwrap();
    }

    #[test]
    fn test_send_sync_remote_status_maps() {
        let transport = Arc::new(FakeTransport::default());
        let dev = Arc::new(device(Arc::clone(&transport)));

        let dev2 = Arc::clone(&dev);
        let transport2 = Arc::clone(&transport);
        let responder = thread::spawn(move || {
            while transport2.sent_frames() == 0 {
                thread::yield_now();
            }
            // status 2 = remote-side execution failure
            let mut reply = transport2.last_frame();
            reply.header.status = 2;
            dev2.handle_reply(reply.as_bytes()).unwrap();
        });

        let err = dev.param_set(1, 9).unwrap_err();
        assert_eq!(err, Error::Remote(RemoteStatus::Error));
        assert_eq!(err.errno(), mdw_core::error::errno::EREMOTEIO);
        responder.join().unwrap();
    }

    #[test]
    fn test_handshake() {
        let transport = Arc::new(FakeTransport::default());
        let dev = Arc::new(device(Arc::clone(&transport)));

        let dev2 = Arc::clone(&dev);
        let transport2 = Arc::clone(&transport);
        let responder = thread::spawn(move || {
            while transport2.sent_frames() == 0 {
                thread::yield_now();
            }
            let mut reply = transport2.last_frame();
            reply
                .set_payload(&HandshakePayload {
                    magic: HANDSHAKE_MAGIC,
                    version: PROTOCOL_VERSION,
                    _pad: 0,
                    features: 0b101,
                })
                .unwrap();
            dev2.handle_reply(reply.as_bytes()).unwrap();
        });

        let info = dev.handshake().unwrap();
        assert_eq!(info.version, PROTOCOL_VERSION);
        assert_eq!(info.features, 0b101);
        responder.join().unwrap();
    }
}
