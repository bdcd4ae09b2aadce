//! # Command Model
//!
//! The command object, its subcommands, and the validation and
//! duplication steps that turn caller input into something safe to hand
//! to the device.
//!
//! Creation is all-or-nothing: any validation or resource failure unwinds
//! everything acquired so far and no partial command ever reaches the
//! dispatch path.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use mdw_core::{ByteSize, CmdId, DeviceAddr, DeviceType, Error, Fence, MemHandle, Result};
use mdw_mem::{CmdbufPool, MemRegistry, PoolChunk};

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum subcommands per command
pub const MAX_SUBCMDS: usize = 64;

/// Size of the execution-info record written back after completion
pub const EXEC_INFO_SIZE: usize = 24;

// =============================================================================
// CMDBUF DIRECTION
// =============================================================================

bitflags::bitflags! {
    /// Data direction of a subcommand's buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdbufDir: u32 {
        /// Host-written input, duplicated into the pool before dispatch
        const IN = 1 << 0;
        /// Device-written output, copied back after completion
        const OUT = 1 << 1;
        /// Both directions
        const DUAL = Self::IN.bits() | Self::OUT.bits();
    }
}

// =============================================================================
// CALLER INPUT
// =============================================================================

/// One subcommand as described by the caller
#[derive(Debug, Clone)]
pub struct SubcmdDesc {
    /// Engine this subcommand targets
    pub device: DeviceType,
    /// Source command buffer
    pub cmdbuf: MemHandle,
    /// Bytes of the buffer that are live
    pub size: ByteSize,
    /// Data direction
    pub dir: CmdbufDir,
    /// Placement alignment within the duplicate region (power of two)
    pub align: u32,
}

/// A producer/consumer data link between two subcommands
#[derive(Debug, Clone, Copy)]
pub struct CmdLink {
    /// Producing subcommand index
    pub producer: u32,
    /// Consuming subcommand index
    pub consumer: u32,
    /// Bytes flowing across the link; zero is malformed
    pub size: u32,
}

/// Caller-supplied command description (the RUN input)
#[derive(Debug)]
pub struct CmdParams {
    /// Caller's opaque command id
    pub uid: u64,
    /// Scheduling priority hint
    pub priority: u32,
    /// Power/boost hint forwarded to the executor
    pub power_hint: u32,
    /// Subcommands, at most [`MAX_SUBCMDS`]
    pub subcmds: Vec<SubcmdDesc>,
    /// Dependency matrix; `None` means fully independent
    pub adj: Option<AdjMatrix>,
    /// Data links between subcommands
    pub links: Vec<CmdLink>,
    /// Where to write the execution-info record, if anywhere
    pub exec_info: Option<MemHandle>,
}

// =============================================================================
// ADJACENCY MATRIX
// =============================================================================

/// Subcommand dependency matrix
///
/// Entry (i, j) nonzero means subcommand j depends on subcommand i.
#[derive(Debug, Clone)]
pub struct AdjMatrix {
    n: usize,
    entries: Vec<u8>,
}

impl AdjMatrix {
    /// Create an all-zero (dependency-free) matrix
    pub fn new(n: usize) -> Self {
        Self {
            n,
            entries: alloc::vec![0u8; n * n],
        }
    }

    /// Build from row-major wire bytes
    pub fn from_raw(n: usize, entries: Vec<u8>) -> Result<Self> {
        if entries.len() != n * n {
            return Err(Error::InvalidParameter);
        }
        Ok(Self { n, entries })
    }

    /// Matrix dimension
    pub fn dim(&self) -> usize {
        self.n
    }

    /// Mark j as depending on i
    pub fn set(&mut self, i: usize, j: usize) {
        self.entries[i * self.n + j] = 1;
    }

    /// Whether j depends on i
    pub fn get(&self, i: usize, j: usize) -> bool {
        self.entries[i * self.n + j] != 0
    }
}

/// Reject malformed dependency matrices
///
/// A matrix is accepted when it matches the subcommand count, has an
/// empty diagonal, no symmetric conflict (both A\[i\]\[j\] and A\[j\]\[i\]
/// set), and no cycle.
pub fn check_adjacency(num_subcmds: usize, adj: &AdjMatrix) -> Result<()> {
    if adj.dim() != num_subcmds {
        return Err(Error::InvalidParameter);
    }

    for i in 0..num_subcmds {
        if adj.get(i, i) {
            return Err(Error::AdjacencyConflict);
        }
        for j in (i + 1)..num_subcmds {
            if adj.get(i, j) && adj.get(j, i) {
                return Err(Error::AdjacencyConflict);
            }
        }
    }

    // Kahn's algorithm: anti-symmetry alone does not rule out longer cycles
    let mut indegree = alloc::vec![0u32; num_subcmds];
    for i in 0..num_subcmds {
        for j in 0..num_subcmds {
            if adj.get(i, j) {
                indegree[j] += 1;
            }
        }
    }

    let mut ready: Vec<usize> = (0..num_subcmds).filter(|&j| indegree[j] == 0).collect();
    let mut visited = 0usize;
    while let Some(i) = ready.pop() {
        visited += 1;
        for j in 0..num_subcmds {
            if adj.get(i, j) {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push(j);
                }
            }
        }
    }

    if visited != num_subcmds {
        return Err(Error::AdjacencyConflict);
    }
    Ok(())
}

/// Reject malformed link tables
pub fn check_links(num_subcmds: usize, links: &[CmdLink]) -> Result<()> {
    if links.len() > num_subcmds {
        return Err(Error::InvalidParameter);
    }
    for link in links {
        if link.producer as usize >= num_subcmds
            || link.consumer as usize >= num_subcmds
            || link.producer == link.consumer
            || link.size == 0
        {
            return Err(Error::LinkOutOfRange);
        }
    }
    Ok(())
}

// =============================================================================
// LAYOUT
// =============================================================================

/// Placement of every subcommand within the duplicate region
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    /// Byte offset of each subcommand's duplicate
    pub offsets: ArrayVec<u64, MAX_SUBCMDS>,
    /// Total region size
    pub total: ByteSize,
}

/// Compute the duplicate-region layout
///
/// The running total goes through checked arithmetic only: a descriptor
/// that would wrap the accumulator is rejected instead of truncated.
pub fn compute_layout(subcmds: &[SubcmdDesc]) -> Result<Layout> {
    if subcmds.len() > MAX_SUBCMDS {
        return Err(Error::TooManySubcmds);
    }
    let mut offsets = ArrayVec::new();
    let mut total = ByteSize::ZERO;

    for desc in subcmds {
        if desc.size.is_zero() {
            return Err(Error::InvalidParameter);
        }
        if desc.align == 0 || !desc.align.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }

        let aligned = total
            .checked_align_up(desc.align as u64)
            .ok_or(Error::SizeOverflow)?;
        offsets.push(aligned.as_bytes());
        total = aligned.checked_add(desc.size).ok_or(Error::SizeOverflow)?;
    }

    // The dispatch payload carries the size as u32
    if total.as_bytes() > u32::MAX as u64 {
        return Err(Error::SizeOverflow);
    }

    Ok(Layout { offsets, total })
}

// =============================================================================
// COMMAND STATE
// =============================================================================

/// Lifecycle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmdState {
    /// Built but not yet validated against the device
    Created = 0,
    /// Passed device validation
    Validated = 1,
    /// Fence bound, ready for dispatch
    Queued = 2,
    /// Parked until its wait fence signals
    Waiting = 3,
    /// IPI sent, executing remotely
    Dispatched = 4,
    /// Completion processed, fence signaled
    Completed = 5,
}

impl CmdState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Validated,
            2 => Self::Queued,
            3 => Self::Waiting,
            4 => Self::Dispatched,
            _ => Self::Completed,
        }
    }
}

// =============================================================================
// COMMAND
// =============================================================================

/// Duplicated-buffer bookkeeping for one subcommand
#[derive(Debug)]
pub struct Subcmd {
    /// Caller's descriptor
    pub desc: SubcmdDesc,
    /// Offset of the duplicate within the region
    pub offset: u64,
    /// Device-visible address of the duplicate
    pub device_addr: DeviceAddr,
}

/// A submitted command
///
/// Shared between the session table and the in-flight dispatch path via
/// `Arc`; `is_running` counts execution holds so a running command can
/// never be reaped out from under the device.
pub struct Cmd {
    id: CmdId,
    priority: u32,
    power_hint: u32,
    subcmds: Vec<Subcmd>,
    layout: Layout,
    exec_info: Option<MemHandle>,
    state: AtomicU32,
    is_running: AtomicU32,
    fence: Mutex<Option<Fence>>,
    chunk: Mutex<Option<PoolChunk>>,
}

impl core::fmt::Debug for Cmd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cmd")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("running", &self.running())
            .field("subcmds", &self.subcmds.len())
            .finish()
    }
}

impl Cmd {
    /// Validate caller input and build the command
    ///
    /// Acquires the duplicate-region chunk and a reference on every source
    /// memory object; both are released by [`reap`](Self::reap). Inputs
    /// are copied in; outputs only reserve their slot.
    pub fn build(
        kid: u64,
        params: CmdParams,
        registry: &mut MemRegistry,
        pool: &mut CmdbufPool,
    ) -> Result<Arc<Cmd>> {
        let n = params.subcmds.len();
        if n == 0 {
            return Err(Error::InvalidParameter);
        }
        if n > MAX_SUBCMDS {
            return Err(Error::TooManySubcmds);
        }

        let adj = match params.adj {
            Some(adj) => adj,
            None => AdjMatrix::new(n),
        };
        check_adjacency(n, &adj)?;
        check_links(n, &params.links)?;
        let layout = compute_layout(&params.subcmds)?;

        let chunk = pool.allocate(layout.total)?;

        // Reference every source object; unwind completely on any failure
        let mut acquired: Vec<MemHandle> = Vec::with_capacity(n + 1);
        let fail = |registry: &mut MemRegistry, pool: &mut CmdbufPool,
                        acquired: &[MemHandle], chunk: PoolChunk, e: Error| {
            for &h in acquired {
                registry.put(h);
            }
            let _ = pool.free(chunk);
            Err(e)
        };

        for desc in &params.subcmds {
            match registry.get(desc.cmdbuf) {
                Ok(obj) if obj.size() >= desc.size => acquired.push(desc.cmdbuf),
                Ok(_) => {
                    acquired.push(desc.cmdbuf);
                    return fail(registry, pool, &acquired, chunk, Error::InvalidParameter);
                }
                Err(e) => return fail(registry, pool, &acquired, chunk, e),
            }
        }

        if let Some(h) = params.exec_info {
            match registry.get(h) {
                Ok(obj) if obj.size().as_bytes() >= EXEC_INFO_SIZE as u64 => acquired.push(h),
                Ok(_) => {
                    acquired.push(h);
                    return fail(registry, pool, &acquired, chunk, Error::InvalidParameter);
                }
                Err(e) => return fail(registry, pool, &acquired, chunk, e),
            }
        }

        let base = pool.device_addr(&chunk);
        let subcmds: Vec<Subcmd> = params
            .subcmds
            .into_iter()
            .zip(layout.offsets.iter())
            .map(|(desc, &offset)| Subcmd {
                device_addr: base.offset(offset),
                offset,
                desc,
            })
            .collect();

        let cmd = Arc::new(Cmd {
            id: CmdId::new(kid, params.uid),
            priority: params.priority,
            power_hint: params.power_hint,
            subcmds,
            layout,
            exec_info: params.exec_info,
            state: AtomicU32::new(CmdState::Created as u32),
            is_running: AtomicU32::new(0),
            fence: Mutex::new(None),
            chunk: Mutex::new(Some(chunk)),
        });

        // Same all-or-nothing contract as the acquisition loop above
        if let Err(e) = cmd.copy_in(registry, pool) {
            cmd.reap(registry, pool);
            return Err(e);
        }
        Ok(cmd)
    }

    /// Command identity
    pub fn id(&self) -> CmdId {
        self.id
    }

    /// Scheduling priority hint
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Power hint
    pub fn power_hint(&self) -> u32 {
        self.power_hint
    }

    /// Subcommand bookkeeping
    pub fn subcmds(&self) -> &[Subcmd] {
        &self.subcmds
    }

    /// Duplicate-region layout
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Current lifecycle state
    pub fn state(&self) -> CmdState {
        CmdState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Set the lifecycle state
    pub(crate) fn set_state(&self, state: CmdState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Move Dispatched → Completed, exactly once
    pub(crate) fn try_complete(&self) -> bool {
        self.state
            .compare_exchange(
                CmdState::Dispatched as u32,
                CmdState::Completed as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Take a completed command back for another execution, exactly once
    ///
    /// Fails for any command still in flight, including one parked on its
    /// wait fence. The winner owns the command until the next completion.
    pub(crate) fn try_reclaim(&self) -> bool {
        self.state
            .compare_exchange(
                CmdState::Completed as u32,
                CmdState::Created as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move Waiting → Queued when the wait fence releases the park
    ///
    /// Fails if the command is no longer parked; stale trigger entries use
    /// this to bow out instead of dispatching twice.
    pub(crate) fn try_unpark(&self) -> bool {
        self.state
            .compare_exchange(
                CmdState::Waiting as u32,
                CmdState::Queued as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Outstanding execution holds
    pub fn running(&self) -> u32 {
        self.is_running.load(Ordering::Acquire)
    }

    /// Take an execution hold
    pub(crate) fn exec_get(&self) {
        self.is_running.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop an execution hold
    pub(crate) fn exec_put(&self) {
        let prev = self.is_running.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Bind the completion fence for the next execution
    pub(crate) fn set_fence(&self, fence: Fence) {
        *self.fence.lock() = Some(fence);
    }

    /// Signal the bound fence
    pub(crate) fn signal_fence(&self, result: Result<()>) {
        match &*self.fence.lock() {
            Some(fence) => fence.signal(result),
            None => log::warn!("{:?}: completion with no fence bound", self.id),
        }
    }

    /// Device-visible address of the duplicate region
    ///
    /// `None` once the command has been reaped.
    pub fn region_addr(&self, pool: &CmdbufPool) -> Option<DeviceAddr> {
        self.chunk.lock().as_ref().map(|c| pool.device_addr(c))
    }

    /// Run `f` against the live chunk, if the command still owns one
    pub(crate) fn with_chunk<R>(&self, f: impl FnOnce(&PoolChunk) -> R) -> Option<R> {
        self.chunk.lock().as_ref().map(f)
    }

    /// Copy every input-marked buffer into the duplicate region
    ///
    /// Also used to refresh inputs when a stale command is re-run.
    pub(crate) fn copy_in(&self, registry: &MemRegistry, pool: &mut CmdbufPool) -> Result<()> {
        let chunk_guard = self.chunk.lock();
        let chunk = chunk_guard.as_ref().ok_or(Error::InvalidState)?;

        for sc in &self.subcmds {
            if !sc.desc.dir.contains(CmdbufDir::IN) {
                continue;
            }
            let src = registry.peek(sc.desc.cmdbuf)?;
            let size = sc.desc.size.as_bytes() as usize;
            let start = sc.offset as usize;
            pool.chunk_mut(chunk)[start..start + size]
                .copy_from_slice(&src.as_slice()[..size]);
        }
        Ok(())
    }

    /// Copy every output-marked buffer back to its source object
    ///
    /// Input-only buffers are skipped. Runs once per completion, after
    /// which the caller signals the fence.
    pub(crate) fn copy_out(&self, registry: &mut MemRegistry, pool: &CmdbufPool) -> Result<()> {
        let chunk_guard = self.chunk.lock();
        let chunk = chunk_guard.as_ref().ok_or(Error::InvalidState)?;

        for sc in &self.subcmds {
            if !sc.desc.dir.contains(CmdbufDir::OUT) {
                continue;
            }
            let size = sc.desc.size.as_bytes() as usize;
            let start = sc.offset as usize;
            let data = &pool.chunk_slice(chunk)[start..start + size];
            let dst = registry.peek_mut(sc.desc.cmdbuf)?;
            dst.as_mut_slice()[..size].copy_from_slice(data);
        }
        Ok(())
    }

    /// Write the execution-info record, if the caller asked for one
    pub(crate) fn write_exec_info(
        &self,
        registry: &mut MemRegistry,
        ret: i32,
        sc_rets: u64,
        end_ts: u64,
    ) {
        let Some(handle) = self.exec_info else {
            return;
        };
        let Ok(obj) = registry.peek_mut(handle) else {
            log::warn!("{:?}: exec-info object vanished", self.id);
            return;
        };
        let out = obj.as_mut_slice();
        out[0..4].copy_from_slice(&ret.to_le_bytes());
        out[4..8].copy_from_slice(&0u32.to_le_bytes());
        out[8..16].copy_from_slice(&sc_rets.to_le_bytes());
        out[16..24].copy_from_slice(&end_ts.to_le_bytes());
    }

    /// Release the chunk and every memory reference
    ///
    /// Idempotent: the chunk doubles as the "already reaped" marker.
    /// Must not be called while executions are in flight.
    pub(crate) fn reap(&self, registry: &mut MemRegistry, pool: &mut CmdbufPool) {
        debug_assert_eq!(self.running(), 0);
        let Some(chunk) = self.chunk.lock().take() else {
            return;
        };
        if let Err(e) = pool.free(chunk) {
            log::warn!("{:?}: chunk free failed: {}", self.id, e);
        }
        for sc in &self.subcmds {
            registry.put(sc.desc.cmdbuf);
        }
        if let Some(h) = self.exec_info {
            registry.put(h);
        }
    }

    /// Whether the command has been reaped
    pub fn is_reaped(&self) -> bool {
        self.chunk.lock().is_none()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mdw_mem::{MemFlags, PoolConfig};

    fn setup() -> (MemRegistry, CmdbufPool) {
        (
            MemRegistry::new(),
            CmdbufPool::new(DeviceAddr::new(0x8000_0000), PoolConfig::small(64)),
        )
    }

    fn desc(registry: &mut MemRegistry, size: u64, dir: CmdbufDir) -> SubcmdDesc {
        let cmdbuf = registry
            .register(
                ByteSize::from_bytes(size),
                DeviceAddr::null(),
                MemFlags::CMDBUF,
            )
            .unwrap();
        SubcmdDesc {
            device: DeviceType::Dla,
            cmdbuf,
            size: ByteSize::from_bytes(size),
            dir,
            align: 16,
        }
    }

    fn params(subcmds: Vec<SubcmdDesc>) -> CmdParams {
        CmdParams {
            uid: 0xaa,
            priority: 0,
            power_hint: 0,
            subcmds,
            adj: None,
            links: Vec::new(),
            exec_info: None,
        }
    }

    #[test]
    fn test_adjacency_rejects_symmetric_conflict() {
        let mut adj = AdjMatrix::new(3);
        adj.set(0, 1);
        adj.set(1, 0);
        assert_eq!(check_adjacency(3, &adj), Err(Error::AdjacencyConflict));
    }

    #[test]
    fn test_adjacency_rejects_self_edge() {
        let mut adj = AdjMatrix::new(2);
        adj.set(1, 1);
        assert_eq!(check_adjacency(2, &adj), Err(Error::AdjacencyConflict));
    }

    #[test]
    fn test_adjacency_rejects_cycle() {
        // 0 -> 1 -> 2 -> 0: anti-symmetric but cyclic
        let mut adj = AdjMatrix::new(3);
        adj.set(0, 1);
        adj.set(1, 2);
        adj.set(2, 0);
        assert_eq!(check_adjacency(3, &adj), Err(Error::AdjacencyConflict));
    }

    #[test]
    fn test_adjacency_accepts_dag() {
        let mut adj = AdjMatrix::new(3);
        adj.set(0, 1);
        adj.set(0, 2);
        adj.set(1, 2);
        assert_eq!(check_adjacency(3, &adj), Ok(()));
        assert_eq!(check_adjacency(3, &AdjMatrix::new(3)), Ok(()));
    }

    #[test]
    fn test_adjacency_dimension_mismatch() {
        assert_eq!(
            check_adjacency(3, &AdjMatrix::new(2)),
            Err(Error::InvalidParameter)
        );
        assert!(AdjMatrix::from_raw(2, alloc::vec![0u8; 3]).is_err());
    }

    #[test]
    fn test_link_validation() {
        let ok = [CmdLink {
            producer: 0,
            consumer: 1,
            size: 64,
        }];
        assert_eq!(check_links(2, &ok), Ok(()));

        let out_of_range = [CmdLink {
            producer: 0,
            consumer: 5,
            size: 64,
        }];
        assert_eq!(check_links(2, &out_of_range), Err(Error::LinkOutOfRange));

        let zero_size = [CmdLink {
            producer: 0,
            consumer: 1,
            size: 0,
        }];
        assert_eq!(check_links(2, &zero_size), Err(Error::LinkOutOfRange));

        let self_link = [CmdLink {
            producer: 1,
            consumer: 1,
            size: 4,
        }];
        assert_eq!(check_links(2, &self_link), Err(Error::LinkOutOfRange));

        // More links than subcommands
        let three = [ok[0], ok[0], ok[0]];
        assert_eq!(check_links(2, &three), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_layout_alignment() {
        let mut registry = MemRegistry::new();
        let subcmds = alloc::vec![
            desc(&mut registry, 100, CmdbufDir::IN),
            desc(&mut registry, 50, CmdbufDir::IN),
        ];
        let layout = compute_layout(&subcmds).unwrap();
        assert_eq!(&layout.offsets[..], &[0, 112]);
        assert_eq!(layout.total.as_bytes(), 162);
    }

    #[test]
    fn test_layout_overflow_rejected() {
        let mut registry = MemRegistry::new();
        let mut big = desc(&mut registry, 64, CmdbufDir::IN);
        big.size = ByteSize::from_bytes(u64::MAX - 8);
        let small = desc(&mut registry, 64, CmdbufDir::IN);
        assert_eq!(
            compute_layout(&alloc::vec![big, small]),
            Err(Error::SizeOverflow)
        );
    }

    #[test]
    fn test_layout_rejects_bad_align() {
        let mut registry = MemRegistry::new();
        let mut d = desc(&mut registry, 64, CmdbufDir::IN);
        d.align = 3;
        assert_eq!(
            compute_layout(core::slice::from_ref(&d)),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_build_copies_inputs_only() {
        let (mut registry, mut pool) = setup();
        let d_in = desc(&mut registry, 8, CmdbufDir::IN);
        let d_out = desc(&mut registry, 8, CmdbufDir::OUT);
        registry
            .peek_mut(d_in.cmdbuf)
            .unwrap()
            .as_mut_slice()
            .copy_from_slice(&[1u8; 8]);
        registry
            .peek_mut(d_out.cmdbuf)
            .unwrap()
            .as_mut_slice()
            .copy_from_slice(&[2u8; 8]);

        let cmd = Cmd::build(
            1,
            params(alloc::vec![d_in, d_out]),
            &mut registry,
            &mut pool,
        )
        .unwrap();

        let chunk_guard = cmd.chunk.lock();
        let chunk = chunk_guard.as_ref().unwrap();
        let region = pool.chunk_slice(chunk);
        assert_eq!(&region[0..8], &[1u8; 8]);
        // Output-only slot was reserved but not filled
        assert_eq!(&region[16..24], &[0u8; 8]);
    }

    #[test]
    fn test_copy_out_skips_input_only() {
        let (mut registry, mut pool) = setup();
        let d_in = desc(&mut registry, 8, CmdbufDir::IN);
        let d_out = desc(&mut registry, 8, CmdbufDir::OUT);
        let in_handle = d_in.cmdbuf;
        let out_handle = d_out.cmdbuf;

        let cmd = Cmd::build(
            1,
            params(alloc::vec![d_in, d_out]),
            &mut registry,
            &mut pool,
        )
        .unwrap();

        // Simulate device writes across the whole region
        {
            let chunk_guard = cmd.chunk.lock();
            let chunk = chunk_guard.as_ref().unwrap();
            pool.chunk_mut(chunk).fill(7);
        }

        cmd.copy_out(&mut registry, &pool).unwrap();
        assert_eq!(registry.peek(out_handle).unwrap().as_slice(), &[7u8; 8]);
        // IN-only source must be untouched
        assert_eq!(registry.peek(in_handle).unwrap().as_slice(), &[0u8; 8]);
    }

    #[test]
    fn test_build_unwinds_on_bad_handle() {
        let (mut registry, mut pool) = setup();
        let good = desc(&mut registry, 8, CmdbufDir::IN);
        let good_handle = good.cmdbuf;
        let bad = SubcmdDesc {
            cmdbuf: MemHandle::new(0x999),
            ..good.clone()
        };

        let err = Cmd::build(1, params(alloc::vec![good, bad]), &mut registry, &mut pool)
            .unwrap_err();
        assert_eq!(err, Error::NotFound);

        // Everything unwound: pool empty, refcount back to zero
        assert_eq!(pool.used_blocks(), 0);
        assert_eq!(registry.peek(good_handle).unwrap().refs(), 0);
    }

    #[test]
    fn test_build_rejects_undersized_source() {
        let (mut registry, mut pool) = setup();
        let mut d = desc(&mut registry, 8, CmdbufDir::IN);
        d.size = ByteSize::from_bytes(64); // larger than the 8-byte object
        assert_eq!(
            Cmd::build(1, params(alloc::vec![d]), &mut registry, &mut pool).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(pool.used_blocks(), 0);
    }

    #[test]
    fn test_build_rejects_too_many_subcmds() {
        let (mut registry, mut pool) = setup();
        let d = desc(&mut registry, 8, CmdbufDir::IN);
        let many: Vec<_> = (0..MAX_SUBCMDS + 1).map(|_| d.clone()).collect();
        assert_eq!(
            Cmd::build(1, params(many), &mut registry, &mut pool).unwrap_err(),
            Error::TooManySubcmds
        );
        assert_eq!(
            Cmd::build(1, params(Vec::new()), &mut registry, &mut pool).unwrap_err(),
            Error::InvalidParameter
        );
    }

    #[test]
    fn test_reap_is_idempotent() {
        let (mut registry, mut pool) = setup();
        let d = desc(&mut registry, 8, CmdbufDir::IN);
        let handle = d.cmdbuf;
        let cmd = Cmd::build(1, params(alloc::vec![d]), &mut registry, &mut pool).unwrap();

        assert_eq!(registry.peek(handle).unwrap().refs(), 1);
        cmd.reap(&mut registry, &mut pool);
        assert!(cmd.is_reaped());
        assert_eq!(registry.peek(handle).unwrap().refs(), 0);
        assert_eq!(pool.used_blocks(), 0);

        // Second reap is a no-op
        cmd.reap(&mut registry, &mut pool);
        assert_eq!(registry.peek(handle).unwrap().refs(), 0);
    }

    #[test]
    fn test_exec_info_writeback() {
        let (mut registry, mut pool) = setup();
        let d = desc(&mut registry, 8, CmdbufDir::IN);
        let info = registry
            .register(
                ByteSize::from_bytes(EXEC_INFO_SIZE as u64),
                DeviceAddr::null(),
                MemFlags::EXEC_INFO,
            )
            .unwrap();

        let mut p = params(alloc::vec![d]);
        p.exec_info = Some(info);
        let cmd = Cmd::build(1, p, &mut registry, &mut pool).unwrap();

        cmd.write_exec_info(&mut registry, -121, 0b1, 500);
        let bytes = registry.peek(info).unwrap().as_slice().to_vec();
        assert_eq!(i32::from_le_bytes(bytes[0..4].try_into().unwrap()), -121);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0b1);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 500);
    }

    #[test]
    fn test_state_transitions() {
        let (mut registry, mut pool) = setup();
        let d = desc(&mut registry, 8, CmdbufDir::IN);
        let cmd = Cmd::build(1, params(alloc::vec![d]), &mut registry, &mut pool).unwrap();

        assert_eq!(cmd.state(), CmdState::Created);
        cmd.set_state(CmdState::Dispatched);
        assert!(cmd.try_complete());
        assert_eq!(cmd.state(), CmdState::Completed);
        // Completion is exactly-once
        assert!(!cmd.try_complete());
    }
}
