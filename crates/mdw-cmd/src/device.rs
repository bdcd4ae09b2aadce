//! # Midware Device
//!
//! The device-global half of the dispatch engine: fence bookkeeping,
//! per-engine validators, the trigger list for fence-gated commands, and
//! the dispatch/completion paths that talk to the RV co-processor through
//! the IPI layer.
//!
//! Locking order is session inner before trigger list, and neither lock
//! is held across an IPI send.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use mdw_core::{
    Clock, DeviceAddr, DeviceType, DeviceValidator, Error, Fence, FenceContextPool, FenceHandle,
    RemoteStatus, Result, Transport,
};
use mdw_ipi::{CmdPayload, HandshakeInfo, IpiFrame, IpiTimeouts, RetryPolicy, RvDevice, RvStats};
use mdw_mem::PoolConfig;

use crate::cmd::{Cmd, CmdState};
use crate::session::{Session, SessionInner};

// =============================================================================
// FIRMWARE PARAMETERS
// =============================================================================

/// Firmware-side (micro) log level parameter
pub const PARAM_ULOG: u32 = 1;
/// Host-side (kernel) log level parameter, mirrored to firmware
pub const PARAM_KLOG: u32 = 2;

/// Device address where per-session duplicate regions start
const POOL_REGION_BASE: u64 = 0x4000_0000;

// =============================================================================
// TRIGGER LIST
// =============================================================================

/// A command parked until its wait fence signals
struct Trigger {
    session: Arc<Mutex<SessionInner>>,
    cmd: Arc<Cmd>,
    wait: FenceHandle,
}

// =============================================================================
// DEVICE
// =============================================================================

/// The midware device
///
/// One per RV co-processor. Sessions are opened against it and every
/// dispatch and completion funnels through here.
pub struct MdwDevice {
    rv: RvDevice,
    clock: Arc<dyn Clock>,
    fence_ctxs: Arc<FenceContextPool>,
    next_seqno: AtomicU64,
    validators: Mutex<BTreeMap<u32, Box<dyn DeviceValidator>>>,
    triggers: Mutex<Vec<Trigger>>,
    /// In-flight subcommand count per engine queue
    queues: [AtomicU32; DeviceType::COUNT],
    next_session: AtomicU64,
    next_pool_base: AtomicU64,
    ulog: AtomicU32,
    klog: AtomicU32,
}

impl MdwDevice {
    /// Create a device with default IPI policy
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_config(
            transport,
            clock,
            RetryPolicy::default(),
            IpiTimeouts::default(),
        )
    }

    /// Create a device with explicit IPI retry/timeout configuration
    pub fn with_config(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        timeouts: IpiTimeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            rv: RvDevice::with_config(transport, Arc::clone(&clock), retry, timeouts),
            clock,
            fence_ctxs: Arc::new(FenceContextPool::new()),
            next_seqno: AtomicU64::new(1),
            validators: Mutex::new(BTreeMap::new()),
            triggers: Mutex::new(Vec::new()),
            queues: core::array::from_fn(|_| AtomicU32::new(0)),
            next_session: AtomicU64::new(1),
            next_pool_base: AtomicU64::new(POOL_REGION_BASE),
            ulog: AtomicU32::new(0),
            klog: AtomicU32::new(0),
        })
    }

    /// Probe the remote side
    pub fn handshake(&self) -> Result<HandshakeInfo> {
        self.rv.handshake()
    }

    /// Entry point for reply frames arriving from the transport
    pub fn handle_reply(&self, bytes: &[u8]) -> Result<()> {
        self.rv.handle_reply(bytes)
    }

    /// Install the validator for its device type, replacing any previous one
    pub fn register_validator(&self, validator: Box<dyn DeviceValidator>) {
        let dt = validator.device_type();
        self.validators.lock().insert(dt as u32, validator);
    }

    /// Open a session
    pub fn open_session(self: &Arc<Self>, pool_config: PoolConfig) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let base = self
            .next_pool_base
            .fetch_add(pool_config.total_size().as_bytes(), Ordering::Relaxed);
        Session::new(Arc::clone(self), id, DeviceAddr::new(base), pool_config)
    }

    /// Fence context pool, shared by every session's commands
    pub fn fence_contexts(&self) -> &Arc<FenceContextPool> {
        &self.fence_ctxs
    }

    /// In-flight subcommands on one engine queue
    pub fn queue_task_num(&self, device: DeviceType) -> u32 {
        self.queues[device.queue_index()].load(Ordering::Acquire)
    }

    /// Commands parked on a wait fence
    pub fn trigger_count(&self) -> usize {
        self.triggers.lock().len()
    }

    /// IPI link counters
    pub fn ipi_stats(&self) -> RvStats {
        self.rv.stats()
    }

    /// Set the firmware log level and push it to the remote side
    pub fn set_fw_log_level(&self, level: u32) -> Result<()> {
        self.rv.param_set(PARAM_ULOG, level as u64)?;
        self.ulog.store(level, Ordering::Release);
        Ok(())
    }

    /// Cached firmware log level
    pub fn fw_log_level(&self) -> u32 {
        self.ulog.load(Ordering::Acquire)
    }

    /// Set the host log level and mirror it to the remote side
    pub fn set_host_log_level(&self, level: u32) -> Result<()> {
        self.rv.param_set(PARAM_KLOG, level as u64)?;
        self.klog.store(level, Ordering::Release);
        Ok(())
    }

    /// Cached host log level
    pub fn host_log_level(&self) -> u32 {
        self.klog.load(Ordering::Acquire)
    }

    // =========================================================================
    // SUBMISSION
    // =========================================================================

    /// Validate, bind a fence, and dispatch or park a built command
    ///
    /// Returns the wait handle for the command's completion fence.
    pub(crate) fn submit(
        self: &Arc<Self>,
        session: &Arc<Mutex<SessionInner>>,
        cmd: &Arc<Cmd>,
        wait: Option<FenceHandle>,
    ) -> Result<FenceHandle> {
        {
            let mut inner = session.lock();
            self.validate_cmd(cmd, &inner)?;
            let pool = &mut inner.pool;
            cmd.with_chunk(|chunk| pool.flush(chunk));
        }
        cmd.set_state(CmdState::Validated);

        let seqno = self.next_seqno.fetch_add(1, Ordering::Relaxed);
        let (fence, handle) = Fence::new(&self.fence_ctxs, seqno);
        cmd.set_fence(fence);
        cmd.set_state(CmdState::Queued);

        match wait {
            Some(wait) if !wait.is_signaled() => {
                cmd.set_state(CmdState::Waiting);
                self.triggers.lock().push(Trigger {
                    session: Arc::clone(session),
                    cmd: Arc::clone(cmd),
                    wait,
                });
                log::debug!("{:?}: parked on wait fence", cmd.id());
                Ok(handle)
            }
            _ => {
                self.dispatch(session, cmd)?;
                Ok(handle)
            }
        }
    }

    /// Run every installed validator over the duplicated buffers
    fn validate_cmd(&self, cmd: &Arc<Cmd>, inner: &SessionInner) -> Result<()> {
        let validators = self.validators.lock();
        cmd.with_chunk(|chunk| {
            let region = inner.pool.chunk_slice(chunk);
            for (idx, sc) in cmd.subcmds().iter().enumerate() {
                let Some(validator) = validators.get(&(sc.desc.device as u32)) else {
                    continue;
                };
                let start = sc.offset as usize;
                let end = start + sc.desc.size.as_bytes() as usize;
                validator.validate(idx, &region[start..end])?;
            }
            Ok(())
        })
        .ok_or(Error::InvalidState)?
    }

    /// Send the command to the remote side
    fn dispatch(self: &Arc<Self>, session: &Arc<Mutex<SessionInner>>, cmd: &Arc<Cmd>) -> Result<()> {
        let payload = {
            let inner = session.lock();
            let iova = cmd.region_addr(&inner.pool).ok_or(Error::InvalidState)?;
            CmdPayload {
                iova: iova.raw(),
                size: cmd.layout().total.as_bytes() as u32,
                _pad: 0,
                start_ts: self.clock.now_us(),
                sc_rets: 0,
            }
        };

        // Execution hold keeps the command alive past deletion until the
        // completion path retires it.
        cmd.exec_get();
        session.lock().active += 1;
        for sc in cmd.subcmds() {
            self.queues[sc.desc.device.queue_index()].fetch_add(1, Ordering::AcqRel);
        }
        cmd.set_state(CmdState::Dispatched);

        let dev = Arc::clone(self);
        let sess = Arc::clone(session);
        let c = Arc::clone(cmd);
        let sent = self.rv.send_cmd(
            &payload,
            Box::new(move |frame| dev.complete(&sess, &c, frame)),
        );

        if let Err(e) = sent {
            log::warn!("{:?}: dispatch failed: {}", cmd.id(), e);
            cmd.set_state(CmdState::Queued);
            for sc in cmd.subcmds() {
                self.queues[sc.desc.device.queue_index()].fetch_sub(1, Ordering::AcqRel);
            }
            session.lock().active -= 1;
            cmd.exec_put();
            return Err(e);
        }

        log::debug!(
            "{:?}: dispatched, iova {:#x}, {} subcmds",
            cmd.id(),
            payload.iova,
            cmd.subcmds().len()
        );
        Ok(())
    }

    // =========================================================================
    // COMPLETION
    // =========================================================================

    /// Retire one command off a reply frame
    ///
    /// Runs from the reply path. Copies outputs back, writes the
    /// execution-info record, releases queue accounting, and signals the
    /// fence last.
    fn complete(&self, session: &Arc<Mutex<SessionInner>>, cmd: &Arc<Cmd>, frame: &IpiFrame) {
        if !cmd.try_complete() {
            log::warn!("{:?}: duplicate completion dropped", cmd.id());
            return;
        }

        let sc_rets = match frame.payload_as::<CmdPayload>() {
            Ok(p) => p.sc_rets,
            Err(_) => {
                log::warn!("{:?}: malformed completion payload", cmd.id());
                0
            }
        };

        let result: Result<()> = match RemoteStatus::from_raw(frame.header.status) {
            Some(status) => Err(status.into()),
            None if sc_rets != 0 => {
                for (idx, _) in cmd.subcmds().iter().enumerate() {
                    if sc_rets & (1u64 << idx) != 0 {
                        log::warn!("{:?}: subcmd {} failed", cmd.id(), idx);
                    }
                }
                Err(Error::RemoteIo)
            }
            None => Ok(()),
        };

        let end_ts = self.clock.now_us();
        let ret = match &result {
            Ok(()) => 0,
            Err(e) => -e.errno(),
        };

        {
            let mut inner = session.lock();
            let SessionInner { registry, pool, .. } = &mut *inner;
            // Outputs come back whether the run succeeded or not; partial
            // results are the caller's to interpret via exec-info.
            if let Err(e) = cmd.copy_out(registry, pool) {
                log::warn!("{:?}: copy-out failed: {}", cmd.id(), e);
            }
            cmd.write_exec_info(registry, ret, sc_rets, end_ts);
        }

        for sc in cmd.subcmds() {
            self.queues[sc.desc.device.queue_index()].fetch_sub(1, Ordering::AcqRel);
        }
        cmd.exec_put();

        {
            let mut inner = session.lock();
            inner.active -= 1;
            let SessionInner {
                registry,
                pool,
                cmds,
                active,
                closed,
                ..
            } = &mut *inner;
            if *closed && *active == 0 {
                // Last completion on a closed session sweeps the stale table
                for (_, stale) in core::mem::take(cmds) {
                    if stale.running() == 0 {
                        stale.reap(registry, pool);
                    }
                }
            } else if !cmds.contains_key(&cmd.id().kid) {
                // Deleted while running; retire it now
                cmd.reap(registry, pool);
            }
        }

        cmd.signal_fence(result);
    }

    // =========================================================================
    // TRIGGER PROCESSING
    // =========================================================================

    /// Dispatch every parked command whose wait fence has signaled
    ///
    /// Returns the number of commands released. Callers run this off their
    /// completion/bottom-half context.
    pub fn process_triggers(self: &Arc<Self>) -> usize {
        let ready = {
            let mut triggers = self.triggers.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < triggers.len() {
                if triggers[i].wait.is_signaled() {
                    ready.push(triggers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            ready
        };

        let mut released = 0;
        for trigger in ready {
            // The command may have left the park (deleted or otherwise
            // retired) since the entry was filed; the entry is then stale.
            if !trigger.cmd.try_unpark() {
                log::debug!("{:?}: stale trigger dropped", trigger.cmd.id());
                continue;
            }
            released += 1;
            if let Some(Err(e)) = trigger.wait.result() {
                log::warn!(
                    "{:?}: wait fence completed with {}, dispatching anyway",
                    trigger.cmd.id(),
                    e
                );
            }
            if let Err(e) = self.dispatch(&trigger.session, &trigger.cmd) {
                log::warn!("{:?}: deferred dispatch failed: {}", trigger.cmd.id(), e);
                // Leave the command reclaimable by a later RunStale
                trigger.cmd.set_state(CmdState::Completed);
                trigger.cmd.signal_fence(Err(e));
            }
        }
        released
    }
}

impl core::fmt::Debug for MdwDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MdwDevice")
            .field("pending", &self.rv.pending_count())
            .field("triggers", &self.trigger_count())
            .finish()
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(MdwDevice: Send, Sync);

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{run_one, setup, FakeTransport, ManualClock};
    use mdw_ipi::MsgId;

    #[test]
    fn test_log_level_params_reach_firmware() {
        let transport = Arc::new(FakeTransport::new());
        let clock = Arc::new(ManualClock::new());
        let dev = MdwDevice::new(transport.clone(), clock);

        // param_set is synchronous; answer from a thread
        let t = transport.clone();
        let d = Arc::clone(&dev);
        let responder = std::thread::spawn(move || {
            let mut reply = t.wait_for_frame();
            reply.header.status = 0;
            d.handle_reply(reply.as_bytes())
        });

        dev.set_fw_log_level(3).unwrap();
        responder.join().unwrap().unwrap();
        assert_eq!(dev.fw_log_level(), 3);

        let sent = transport.first_frame();
        assert_eq!(sent.msg_id(), Some(MsgId::ParamSet));
    }

    #[test]
    fn test_queue_accounting_over_one_run() {
        let (dev, transport, session) = setup();
        let (_, fence) = run_one(&session, &transport, 2);

        assert!(fence.is_signaled());
        assert_eq!(dev.queue_task_num(DeviceType::Dla), 0);
        assert_eq!(dev.queue_task_num(DeviceType::Dsp), 0);
        assert_eq!(dev.ipi_stats().sends, 1);
        assert_eq!(dev.ipi_stats().replies, 1);
    }
}
