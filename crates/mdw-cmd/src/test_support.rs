//! Shared fixtures for the crate's tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use mdw_core::{ByteSize, Clock, CmdId, DeviceType, FenceHandle, Result, Transport};
use mdw_ipi::IpiFrame;
use mdw_mem::{MemFlags, PoolConfig};

use crate::cmd::{CmdParams, CmdbufDir, SubcmdDesc};
use crate::device::MdwDevice;
use crate::session::Session;

/// Clock that ticks forward on every read
pub(crate) struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.fetch_add(1, Ordering::Relaxed)
    }

    fn sleep_us(&self, us: u64) {
        self.now.fetch_add(us, Ordering::Relaxed);
    }
}

/// Transport that records every frame instead of sending it
pub(crate) struct FakeTransport {
    sent: Mutex<Vec<IpiFrame>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub(crate) fn first_frame(&self) -> IpiFrame {
        self.sent.lock()[0]
    }

    pub(crate) fn last_frame(&self) -> IpiFrame {
        *self.sent.lock().last().expect("no frame sent")
    }

    /// Spin until another thread has sent a frame
    pub(crate) fn wait_for_frame(&self) -> IpiFrame {
        loop {
            if let Some(frame) = self.sent.lock().first().copied() {
                return frame;
            }
            std::thread::yield_now();
        }
    }
}

impl Transport for FakeTransport {
    fn send(&self, frame: &[u8]) -> Result<()> {
        self.sent.lock().push(IpiFrame::from_bytes(frame)?);
        Ok(())
    }
}

/// Device plus one open session over a recording transport
pub(crate) fn setup() -> (Arc<MdwDevice>, Arc<FakeTransport>, Session) {
    let transport = Arc::new(FakeTransport::new());
    let clock = Arc::new(ManualClock::new());
    let dev = MdwDevice::new(transport.clone(), clock);
    let session = dev.open_session(PoolConfig::small(64));
    (dev, transport, session)
}

/// Register a fresh cmdbuf object and describe a subcommand over it
pub(crate) fn subcmd(session: &Session, size: u64, dir: CmdbufDir) -> SubcmdDesc {
    let cmdbuf = session
        .mem_register(ByteSize::from_bytes(size), MemFlags::CMDBUF)
        .unwrap();
    SubcmdDesc {
        device: DeviceType::Dla,
        cmdbuf,
        size: ByteSize::from_bytes(size),
        dir,
        align: 16,
    }
}

/// Echo the most recent request back as a success reply
pub(crate) fn reply_ok(session: &Session, transport: &FakeTransport) {
    let mut reply = transport.last_frame();
    reply.header.status = 0;
    session.device().handle_reply(reply.as_bytes()).unwrap();
}

/// Run one command to completion
pub(crate) fn run_one(
    session: &Session,
    transport: &FakeTransport,
    num_subcmds: usize,
) -> (CmdId, FenceHandle) {
    let subcmds: Vec<SubcmdDesc> = (0..num_subcmds)
        .map(|i| {
            let mut desc = subcmd(session, 32, CmdbufDir::DUAL);
            desc.device = if i % 2 == 0 {
                DeviceType::Dla
            } else {
                DeviceType::Dsp
            };
            desc
        })
        .collect();
    let params = CmdParams {
        uid: 7,
        priority: 0,
        power_hint: 0,
        subcmds,
        adj: None,
        links: Vec::new(),
        exec_info: None,
    };
    let (id, fence) = session.run(params, None).unwrap();
    reply_ok(session, transport);
    (id, fence)
}
