//! # Memory Objects
//!
//! Registered caller memory and the handle registry the command engine
//! resolves cmdbuf handles through.

use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;

use mdw_core::{ByteSize, DeviceAddr, Error, MemHandle, Result};

// =============================================================================
// MEMORY FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Properties of a registered memory object
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// CPU-cacheable mapping, needs explicit flush for the device
        const CACHEABLE = 1 << 0;
        /// Mapped into the device address space
        const DEVICE_MAPPED = 1 << 1;
        /// Holds command descriptors (eligible as a cmdbuf source)
        const CMDBUF = 1 << 2;
        /// Holds execution-info records written back after completion
        const EXEC_INFO = 1 << 3;
    }
}

// =============================================================================
// MEMORY OBJECT
// =============================================================================

/// A registered memory object
///
/// Owns its backing bytes. The device-visible address is assigned at
/// registration time by whoever owns the device address space.
#[derive(Debug)]
pub struct MemObject {
    handle: MemHandle,
    data: Vec<u8>,
    device_addr: DeviceAddr,
    flags: MemFlags,
    /// Outstanding get() references
    refs: u32,
}

impl MemObject {
    /// Handle this object is registered under
    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    /// Size of the backing buffer
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.data.len() as u64)
    }

    /// Device-visible address
    pub fn device_addr(&self) -> DeviceAddr {
        self.device_addr
    }

    /// Object flags
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Outstanding references
    pub fn refs(&self) -> u32 {
        self.refs
    }

    /// Read access to the backing bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the backing bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

// =============================================================================
// REGISTRY STATISTICS
// =============================================================================

/// Registry-wide accounting
#[derive(Debug, Clone, Copy, Default)]
pub struct MemStats {
    /// Currently registered objects
    pub registered: u64,
    /// Currently registered bytes
    pub total_bytes: u64,
    /// High water mark of registered bytes
    pub peak_bytes: u64,
}

// =============================================================================
// MEMORY REGISTRY
// =============================================================================

/// Handle → memory object lookup table
///
/// Handle ids are allocated monotonically and never reused, so a stale
/// handle can never alias a newer object.
#[derive(Debug)]
pub struct MemRegistry {
    objects: HashMap<u64, MemObject>,
    next_id: u64,
    stats: MemStats,
}

impl MemRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_id: 1,
            stats: MemStats::default(),
        }
    }

    /// Register a zero-filled object of `size` bytes
    pub fn register(
        &mut self,
        size: ByteSize,
        device_addr: DeviceAddr,
        flags: MemFlags,
    ) -> Result<MemHandle> {
        if size.is_zero() {
            return Err(Error::InvalidParameter);
        }

        let handle = MemHandle::new(self.next_id);
        self.next_id += 1;

        self.objects.insert(
            handle.id(),
            MemObject {
                handle,
                data: vec![0u8; size.as_bytes() as usize],
                device_addr,
                flags,
                refs: 0,
            },
        );

        self.stats.registered += 1;
        self.stats.total_bytes += size.as_bytes();
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.total_bytes);

        Ok(handle)
    }

    /// Register an object with initial contents
    pub fn register_with_data(
        &mut self,
        data: &[u8],
        device_addr: DeviceAddr,
        flags: MemFlags,
    ) -> Result<MemHandle> {
        let handle = self.register(
            ByteSize::from_bytes(data.len() as u64),
            device_addr,
            flags,
        )?;
        // Registered above, lookup cannot fail
        if let Some(obj) = self.objects.get_mut(&handle.id()) {
            obj.data.copy_from_slice(data);
        }
        Ok(handle)
    }

    /// Look up an object, taking a reference on it
    ///
    /// Every successful `get` must be paired with a [`put`](Self::put).
    pub fn get(&mut self, handle: MemHandle) -> Result<&MemObject> {
        let obj = self
            .objects
            .get_mut(&handle.id())
            .ok_or(Error::NotFound)?;
        obj.refs += 1;
        Ok(obj)
    }

    /// Drop a reference taken with [`get`](Self::get)
    pub fn put(&mut self, handle: MemHandle) {
        match self.objects.get_mut(&handle.id()) {
            Some(obj) if obj.refs > 0 => obj.refs -= 1,
            Some(_) => log::warn!("unbalanced put on {:?}", handle),
            None => log::warn!("put on unknown {:?}", handle),
        }
    }

    /// Borrow an object without touching its refcount
    pub fn peek(&self, handle: MemHandle) -> Result<&MemObject> {
        self.objects.get(&handle.id()).ok_or(Error::NotFound)
    }

    /// Mutably borrow an object without touching its refcount
    pub fn peek_mut(&mut self, handle: MemHandle) -> Result<&mut MemObject> {
        self.objects.get_mut(&handle.id()).ok_or(Error::NotFound)
    }

    /// Unregister an object
    ///
    /// Fails with [`Error::Busy`] while references are outstanding.
    pub fn unregister(&mut self, handle: MemHandle) -> Result<()> {
        let obj = self.objects.get(&handle.id()).ok_or(Error::NotFound)?;
        if obj.refs > 0 {
            return Err(Error::Busy);
        }

        if let Some(obj) = self.objects.remove(&handle.id()) {
            self.stats.registered -= 1;
            self.stats.total_bytes -= obj.data.len() as u64;
        }
        Ok(())
    }

    /// Registry accounting snapshot
    pub fn stats(&self) -> MemStats {
        self.stats
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut reg = MemRegistry::new();
        let h = reg
            .register(ByteSize::from_bytes(64), DeviceAddr::new(0x4000), MemFlags::CMDBUF)
            .unwrap();

        let obj = reg.peek(h).unwrap();
        assert_eq!(obj.size().as_bytes(), 64);
        assert_eq!(obj.device_addr(), DeviceAddr::new(0x4000));
        assert!(obj.flags().contains(MemFlags::CMDBUF));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut reg = MemRegistry::new();
        assert_eq!(
            reg.register(ByteSize::ZERO, DeviceAddr::null(), MemFlags::empty()),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_unknown_handle() {
        let mut reg = MemRegistry::new();
        assert!(matches!(reg.get(MemHandle::new(99)), Err(Error::NotFound)));
        assert_eq!(reg.unregister(MemHandle::new(99)), Err(Error::NotFound));
    }

    #[test]
    fn test_refcount_blocks_unregister() {
        let mut reg = MemRegistry::new();
        let h = reg
            .register(ByteSize::from_bytes(16), DeviceAddr::null(), MemFlags::empty())
            .unwrap();

        reg.get(h).unwrap();
        assert_eq!(reg.unregister(h), Err(Error::Busy));

        reg.put(h);
        assert_eq!(reg.unregister(h), Ok(()));
        assert_eq!(reg.stats().registered, 0);
    }

    #[test]
    fn test_register_with_data() {
        let mut reg = MemRegistry::new();
        let h = reg
            .register_with_data(&[1, 2, 3, 4], DeviceAddr::null(), MemFlags::CMDBUF)
            .unwrap();
        assert_eq!(reg.peek(h).unwrap().as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_handles_never_reused() {
        let mut reg = MemRegistry::new();
        let a = reg
            .register(ByteSize::from_bytes(8), DeviceAddr::null(), MemFlags::empty())
            .unwrap();
        reg.unregister(a).unwrap();
        let b = reg
            .register(ByteSize::from_bytes(8), DeviceAddr::null(), MemFlags::empty())
            .unwrap();
        assert_ne!(a.id(), b.id());
        assert!(matches!(reg.peek(a), Err(Error::NotFound)));
    }

    #[test]
    fn test_stats_track_peak() {
        let mut reg = MemRegistry::new();
        let a = reg
            .register(ByteSize::from_bytes(100), DeviceAddr::null(), MemFlags::empty())
            .unwrap();
        let _b = reg
            .register(ByteSize::from_bytes(50), DeviceAddr::null(), MemFlags::empty())
            .unwrap();
        assert_eq!(reg.stats().peak_bytes, 150);

        reg.unregister(a).unwrap();
        assert_eq!(reg.stats().total_bytes, 50);
        assert_eq!(reg.stats().peak_bytes, 150);
    }
}
