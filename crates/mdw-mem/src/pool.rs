//! # Command Buffer Pool
//!
//! Per-session arena the duplicated command buffers live in.
//!
//! Allocation is block-grained: a chunk occupies a contiguous run of
//! fixed-size blocks found by first-fit scan. Chunks are freed back by
//! token, so a double free or foreign free is detectable.

use alloc::vec;
use alloc::vec::Vec;

use mdw_core::{ByteSize, DeviceAddr, Error, Result};

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// Command buffer pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Block size (allocation granularity)
    pub block_size: ByteSize,
    /// Number of blocks
    pub num_blocks: u32,
    /// Pool name for debugging
    pub name: &'static str,
}

impl PoolConfig {
    /// Default per-session cmdbuf pool: 256 blocks of 4 KiB
    pub const fn cmdbuf() -> Self {
        Self {
            block_size: ByteSize::from_kib(4),
            num_blocks: 256,
            name: "cmdbuf_pool",
        }
    }

    /// Pool sized for tests and small sessions
    pub const fn small(num_blocks: u32) -> Self {
        Self {
            block_size: ByteSize::from_bytes(64),
            num_blocks,
            name: "small_pool",
        }
    }

    /// Total backing size
    pub const fn total_size(&self) -> ByteSize {
        ByteSize::from_bytes(self.block_size.as_bytes() * self.num_blocks as u64)
    }
}

// =============================================================================
// POOL CHUNK
// =============================================================================

/// An allocation out of the pool
///
/// Not cloneable: the chunk is the ownership token passed back to
/// [`CmdbufPool::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct PoolChunk {
    first_block: u32,
    num_blocks: u32,
    /// Requested (unpadded) size
    size: ByteSize,
}

impl PoolChunk {
    /// Requested size
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Byte offset of the chunk within the pool backing
    pub fn offset(&self, block_size: ByteSize) -> u64 {
        self.first_block as u64 * block_size.as_bytes()
    }
}

// =============================================================================
// POOL STATISTICS
// =============================================================================

/// Pool accounting
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total allocations
    pub allocs: u64,
    /// Total frees
    pub frees: u64,
    /// Device flushes issued
    pub flushes: u64,
    /// High water mark in blocks
    pub peak_blocks: u32,
}

// =============================================================================
// COMMAND BUFFER POOL
// =============================================================================

/// Block-grained arena for duplicated command buffers
#[derive(Debug)]
pub struct CmdbufPool {
    config: PoolConfig,
    /// Backing storage, device-mapped at `device_base`
    backing: Vec<u8>,
    /// Per-block occupancy
    in_use: Vec<bool>,
    device_base: DeviceAddr,
    stats: PoolStats,
}

impl CmdbufPool {
    /// Create a pool mapped at `device_base`
    pub fn new(device_base: DeviceAddr, config: PoolConfig) -> Self {
        let total = config.total_size().as_bytes() as usize;
        Self {
            backing: vec![0u8; total],
            in_use: vec![false; config.num_blocks as usize],
            config,
            device_base,
            stats: PoolStats::default(),
        }
    }

    /// Blocks needed to hold `size` bytes
    fn blocks_for(&self, size: ByteSize) -> u32 {
        let bs = self.config.block_size.as_bytes();
        size.as_bytes().div_ceil(bs) as u32
    }

    /// Allocate a contiguous chunk holding `size` bytes
    pub fn allocate(&mut self, size: ByteSize) -> Result<PoolChunk> {
        if size.is_zero() {
            return Err(Error::InvalidParameter);
        }
        let needed = self.blocks_for(size);
        if needed > self.config.num_blocks {
            return Err(Error::PoolExhausted);
        }

        // First-fit scan for a free run
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for (i, used) in self.in_use.iter().enumerate() {
            if *used {
                run_len = 0;
                run_start = i as u32 + 1;
            } else {
                run_len += 1;
                if run_len == needed {
                    for b in run_start..run_start + needed {
                        self.in_use[b as usize] = true;
                    }
                    self.stats.allocs += 1;
                    let used_now = self.used_blocks();
                    self.stats.peak_blocks = self.stats.peak_blocks.max(used_now);
                    return Ok(PoolChunk {
                        first_block: run_start,
                        num_blocks: needed,
                        size,
                    });
                }
            }
        }

        log::warn!(
            "{}: no run of {} blocks ({} free)",
            self.config.name,
            needed,
            self.free_blocks()
        );
        Err(Error::PoolExhausted)
    }

    /// Free a chunk back to the pool
    pub fn free(&mut self, chunk: PoolChunk) -> Result<()> {
        let end = chunk.first_block + chunk.num_blocks;
        if end > self.config.num_blocks {
            return Err(Error::InvalidParameter);
        }
        for b in chunk.first_block..end {
            if !self.in_use[b as usize] {
                return Err(Error::InvalidParameter);
            }
        }
        for b in chunk.first_block..end {
            self.in_use[b as usize] = false;
        }
        self.stats.frees += 1;
        Ok(())
    }

    /// Read access to a chunk's bytes
    pub fn chunk_slice(&self, chunk: &PoolChunk) -> &[u8] {
        let start = chunk.offset(self.config.block_size) as usize;
        &self.backing[start..start + chunk.size.as_bytes() as usize]
    }

    /// Write access to a chunk's bytes
    pub fn chunk_mut(&mut self, chunk: &PoolChunk) -> &mut [u8] {
        let start = chunk.offset(self.config.block_size) as usize;
        &mut self.backing[start..start + chunk.size.as_bytes() as usize]
    }

    /// Device-visible address of a chunk
    pub fn device_addr(&self, chunk: &PoolChunk) -> DeviceAddr {
        self.device_base.offset(chunk.offset(self.config.block_size))
    }

    /// Flush a chunk for device coherency
    ///
    /// The portable pool has nothing to write back; the call marks the
    /// coherency point and is counted in the stats.
    pub fn flush(&mut self, chunk: &PoolChunk) {
        let _ = chunk;
        self.stats.flushes += 1;
    }

    /// Number of free blocks
    pub fn free_blocks(&self) -> u32 {
        self.in_use.iter().filter(|u| !**u).count() as u32
    }

    /// Number of used blocks
    pub fn used_blocks(&self) -> u32 {
        self.config.num_blocks - self.free_blocks()
    }

    /// Pool accounting snapshot
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Pool name
    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Free every block
    pub fn reset(&mut self) {
        self.in_use.iter_mut().for_each(|u| *u = false);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(blocks: u32) -> CmdbufPool {
        CmdbufPool::new(DeviceAddr::new(0x10_0000), PoolConfig::small(blocks))
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut p = pool(8);
        let c = p.allocate(ByteSize::from_bytes(100)).unwrap();
        // 100 bytes over 64-byte blocks -> 2 blocks
        assert_eq!(p.used_blocks(), 2);

        p.free(c).unwrap();
        assert_eq!(p.used_blocks(), 0);
        assert_eq!(p.stats().allocs, 1);
        assert_eq!(p.stats().frees, 1);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut p = pool(8);
        assert_eq!(p.allocate(ByteSize::ZERO), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_exhaustion() {
        let mut p = pool(4);
        let _a = p.allocate(ByteSize::from_bytes(64 * 3)).unwrap();
        assert_eq!(
            p.allocate(ByteSize::from_bytes(64 * 2)),
            Err(Error::PoolExhausted)
        );
        // A single block still fits
        assert!(p.allocate(ByteSize::from_bytes(64)).is_ok());
    }

    #[test]
    fn test_first_fit_reuses_gap() {
        let mut p = pool(8);
        let a = p.allocate(ByteSize::from_bytes(64 * 2)).unwrap();
        let _b = p.allocate(ByteSize::from_bytes(64 * 2)).unwrap();
        p.free(a).unwrap();

        // The freed front gap is reused
        let c = p.allocate(ByteSize::from_bytes(64)).unwrap();
        assert_eq!(c.offset(ByteSize::from_bytes(64)), 0);
    }

    #[test]
    fn test_double_free_detected() {
        let mut p = pool(4);
        let c = p.allocate(ByteSize::from_bytes(64)).unwrap();
        let forged = PoolChunk {
            first_block: c.first_block,
            num_blocks: c.num_blocks,
            size: c.size,
        };
        p.free(c).unwrap();
        assert_eq!(p.free(forged), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_chunk_io_and_device_addr() {
        let mut p = pool(4);
        let c = p.allocate(ByteSize::from_bytes(8)).unwrap();
        p.chunk_mut(&c).copy_from_slice(&[9u8; 8]);
        assert_eq!(p.chunk_slice(&c), &[9u8; 8]);
        assert_eq!(p.device_addr(&c), DeviceAddr::new(0x10_0000));

        p.flush(&c);
        assert_eq!(p.stats().flushes, 1);
    }

    #[test]
    fn test_oversized_request() {
        let mut p = pool(2);
        assert_eq!(
            p.allocate(ByteSize::from_bytes(64 * 3)),
            Err(Error::PoolExhausted)
        );
    }
}
