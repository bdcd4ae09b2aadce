//! # Session
//!
//! Per-client state: the memory registry, the duplicate-region pool, and
//! the table of submitted commands. The [`CmdOp`] surface mirrors the
//! primitive command controls a client issues:
//!
//! - `Run`: validate, duplicate, and dispatch a new command
//! - `RunStale`: re-dispatch a previously run command kept in the table
//! - `Del`: drop a command from the table, deferred while it executes
//!
//! Commands stay in the table after completion ("stale") precisely so
//! `RunStale` can fire them again without re-validation.

use alloc::sync::Arc;
use alloc::collections::BTreeMap;

use spin::Mutex;

use mdw_core::{
    ByteSize, CmdId, DeviceAddr, Error, FenceHandle, MemHandle, Result, SessionHandle,
};
use mdw_mem::{CmdbufPool, MemFlags, MemRegistry, MemStats, PoolConfig};

use crate::cmd::{Cmd, CmdParams, CmdState};
use crate::device::MdwDevice;

// =============================================================================
// COMMAND OPS
// =============================================================================

/// Command controls accepted by [`Session::cmd_ioctl`]
#[derive(Debug)]
pub enum CmdOp {
    /// Submit a new command
    Run {
        /// Command description
        params: CmdParams,
        /// Optional fence to wait on before dispatch
        wait: Option<FenceHandle>,
    },
    /// Re-dispatch a stale command by its kernel id
    RunStale(u64),
    /// Delete a command by its kernel id
    Del(u64),
}

/// Reply to a command control
#[derive(Debug)]
pub enum CmdReply {
    /// A dispatch was started
    Run {
        /// Identity of the (re-)dispatched command
        id: CmdId,
        /// Completion fence for this execution
        fence: FenceHandle,
    },
    /// The operation completed with nothing to return
    Done,
}

// =============================================================================
// SESSION STATE
// =============================================================================

/// State behind the session lock
pub(crate) struct SessionInner {
    pub(crate) registry: MemRegistry,
    pub(crate) pool: CmdbufPool,
    /// Submitted commands, keyed by kernel id
    pub(crate) cmds: BTreeMap<u64, Arc<Cmd>>,
    /// Kernel ids are monotonic and never reused
    pub(crate) next_kid: u64,
    /// Commands with an execution in flight
    pub(crate) active: u32,
    pub(crate) closed: bool,
}

/// One client's view of the device
pub struct Session {
    handle: SessionHandle,
    device: Arc<MdwDevice>,
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    /// Called through [`MdwDevice::open_session`]
    pub(crate) fn new(
        device: Arc<MdwDevice>,
        id: u64,
        pool_base: DeviceAddr,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            handle: SessionHandle::new(id),
            device,
            inner: Arc::new(Mutex::new(SessionInner {
                registry: MemRegistry::new(),
                pool: CmdbufPool::new(pool_base, pool_config),
                cmds: BTreeMap::new(),
                next_kid: 1,
                active: 0,
                closed: false,
            })),
        }
    }

    /// Session identity
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Owning device
    pub fn device(&self) -> &Arc<MdwDevice> {
        &self.device
    }

    // =========================================================================
    // MEMORY SURFACE
    // =========================================================================

    /// Register a zero-filled memory object
    pub fn mem_register(&self, size: ByteSize, flags: MemFlags) -> Result<MemHandle> {
        self.inner
            .lock()
            .registry
            .register(size, DeviceAddr::null(), flags)
    }

    /// Register a memory object with initial contents
    pub fn mem_register_with_data(&self, data: &[u8], flags: MemFlags) -> Result<MemHandle> {
        self.inner
            .lock()
            .registry
            .register_with_data(data, DeviceAddr::null(), flags)
    }

    /// Read back a memory object's contents
    pub fn mem_read(&self, handle: MemHandle) -> Result<alloc::vec::Vec<u8>> {
        Ok(self.inner.lock().registry.peek(handle)?.as_slice().to_vec())
    }

    /// Overwrite a memory object's contents
    pub fn mem_write(&self, handle: MemHandle, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let obj = inner.registry.peek_mut(handle)?;
        if obj.size().as_bytes() < data.len() as u64 {
            return Err(Error::InvalidParameter);
        }
        obj.as_mut_slice()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Unregister a memory object
    ///
    /// Fails with [`Error::Busy`] while a command still references it.
    pub fn mem_unregister(&self, handle: MemHandle) -> Result<()> {
        self.inner.lock().registry.unregister(handle)
    }

    /// Registry accounting snapshot
    pub fn mem_stats(&self) -> MemStats {
        self.inner.lock().registry.stats()
    }

    // =========================================================================
    // COMMAND SURFACE
    // =========================================================================

    /// Dispatch one command control
    pub fn cmd_ioctl(&self, op: CmdOp) -> Result<CmdReply> {
        match op {
            CmdOp::Run { params, wait } => {
                let (id, fence) = self.run(params, wait)?;
                Ok(CmdReply::Run { id, fence })
            }
            CmdOp::RunStale(kid) => {
                let (id, fence) = self.run_stale(kid)?;
                Ok(CmdReply::Run { id, fence })
            }
            CmdOp::Del(kid) => {
                self.del(kid)?;
                Ok(CmdReply::Done)
            }
        }
    }

    /// Build and dispatch a new command
    ///
    /// Returns the command's identity and its completion fence. The
    /// command stays in the table afterwards for `RunStale` and `Del`.
    pub fn run(
        &self,
        params: CmdParams,
        wait: Option<FenceHandle>,
    ) -> Result<(CmdId, FenceHandle)> {
        let cmd = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::InvalidState);
            }
            let kid = inner.next_kid;
            inner.next_kid += 1;

            let SessionInner { registry, pool, .. } = &mut *inner;
            let cmd = Cmd::build(kid, params, registry, pool)?;
            inner.cmds.insert(kid, Arc::clone(&cmd));
            cmd
        };

        // The session lock is dropped here: the completion path takes it,
        // and a loopback transport completes inside submit.
        match self.device.submit(&self.inner, &cmd, wait) {
            Ok(fence) => Ok((cmd.id(), fence)),
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.cmds.remove(&cmd.id().kid);
                let SessionInner { registry, pool, .. } = &mut *inner;
                cmd.reap(registry, pool);
                Err(e)
            }
        }
    }

    /// Re-dispatch a stale command with a fresh fence
    ///
    /// Inputs are re-duplicated from their source objects first. Fails
    /// with [`Error::CmdRunning`] unless the previous execution has fully
    /// completed; a command parked on its wait fence still belongs to the
    /// first submission and cannot be reclaimed.
    pub fn run_stale(&self, kid: u64) -> Result<(CmdId, FenceHandle)> {
        let cmd = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(Error::InvalidState);
            }
            let cmd = inner.cmds.get(&kid).ok_or(Error::NotFound)?;
            // Exclusive reclaim: only one caller may take a completed
            // command, and never out from under a parked or in-flight one.
            if !cmd.try_reclaim() {
                return Err(Error::CmdRunning);
            }
            Arc::clone(cmd)
        };

        let refreshed = {
            let mut inner = self.inner.lock();
            let SessionInner { registry, pool, .. } = &mut *inner;
            cmd.copy_in(registry, pool)
        };

        match refreshed.and_then(|()| self.device.submit(&self.inner, &cmd, None)) {
            Ok(fence) => Ok((cmd.id(), fence)),
            Err(e) => {
                // Hand the command back so a later RunStale can retry
                cmd.set_state(CmdState::Completed);
                Err(e)
            }
        }
    }

    /// Delete a command from the table
    ///
    /// A running command is only unlinked; the completion path frees its
    /// resources once the execution retires.
    pub fn del(&self, kid: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let cmd = inner.cmds.remove(&kid).ok_or(Error::NotFound)?;
        if cmd.running() > 0 {
            log::debug!("{:?}: delete deferred, still running", cmd.id());
            return Ok(());
        }
        let SessionInner { registry, pool, .. } = &mut *inner;
        cmd.reap(registry, pool);
        Ok(())
    }

    /// Stale commands currently held in the table
    pub fn cmd_count(&self) -> usize {
        self.inner.lock().cmds.len()
    }

    /// Commands with an execution in flight
    pub fn active_count(&self) -> u32 {
        self.inner.lock().active
    }

    /// Close the session
    ///
    /// Stale commands are swept immediately; commands still executing are
    /// swept by their completion.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        if inner.active == 0 {
            let SessionInner { registry, pool, cmds, .. } = &mut *inner;
            for (_, cmd) in core::mem::take(cmds) {
                cmd.reap(registry, pool);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("cmds", &self.cmd_count())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
