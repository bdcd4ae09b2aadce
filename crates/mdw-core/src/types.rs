//! # MDW Core Types
//!
//! Fundamental type definitions used across the entire midware stack.
//!
//! These types provide:
//! - Strong typing for device-visible addresses (never CPU pointers)
//! - Overflow-checked size arithmetic for command buffer layout
//! - Type-safe opaque handles

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// DEVICE ADDRESS
// =============================================================================

/// Device Virtual Address (iova)
///
/// This is an address in the accelerator's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceAddr(pub(crate) u64);

impl DeviceAddr {
    /// Create a new device address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null device address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    ///
    /// `alignment` must be a power of two.
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for DeviceAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<DeviceAddr> for DeviceAddr {
    type Output = u64;

    fn sub(self, rhs: DeviceAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPE
// =============================================================================

/// Size in bytes
///
/// Command buffer layout arithmetic goes through the `checked_*` methods so
/// an adversarial descriptor can never wrap the running total.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB
    pub const KIB_4: Self = Self(4 * 1024);
    /// 64 KiB
    pub const KIB_64: Self = Self(64 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Check if zero
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Align up to boundary, failing on wrap
    ///
    /// `alignment` must be a power of two. Returns `None` if the aligned
    /// value would exceed `u64::MAX`.
    #[inline]
    pub const fn checked_align_up(self, alignment: u64) -> Option<Self> {
        let mask = alignment - 1;
        match self.0.checked_add(mask) {
            Some(v) => Some(Self(v & !mask)),
            None => None,
        }
    }

    /// Add sizes, failing on wrap
    #[inline]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 && self.0 % (1024 * 1024) == 0 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// DEVICE TYPE
// =============================================================================

/// Accelerator engine the midware dispatches to
///
/// Each device type has its own validation callback and queue accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum DeviceType {
    /// Signal processor cores
    Dsp = 0,
    /// Deep-learning accelerator cores
    Dla = 1,
    /// Data-mover engine
    Dma = 2,
}

impl DeviceType {
    /// Number of device types
    pub const COUNT: usize = 3;

    /// All device types, in queue order
    pub const ALL: [DeviceType; Self::COUNT] =
        [DeviceType::Dsp, DeviceType::Dla, DeviceType::Dma];

    /// Queue index for per-type accounting
    #[inline]
    pub const fn queue_index(self) -> usize {
        self as usize
    }

    /// Decode from a raw descriptor field
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Dsp),
            1 => Some(Self::Dla),
            2 => Some(Self::Dma),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dsp => write!(f, "dsp"),
            Self::Dla => write!(f, "dla"),
            Self::Dma => write!(f, "dma"),
        }
    }
}

// =============================================================================
// COMMAND ID
// =============================================================================

/// Identity of a submitted command
///
/// `kid` is allocated by the midware and unique within a session for the
/// lifetime of the command; `uid` is whatever opaque value the caller
/// supplied and is only used for logging.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdId {
    /// Midware-assigned id, never reused while the command is live
    pub kid: u64,
    /// Caller-supplied id
    pub uid: u64,
}

impl CmdId {
    /// Create a command id
    #[inline]
    pub const fn new(kid: u64, uid: u64) -> Self {
        Self { kid, uid }
    }
}

impl fmt::Debug for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CmdId(kid=0x{:x}, uid=0x{:x})", self.kid, self.uid)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a midware resource
///
/// Handles are type-safe wrappers that prevent mixing different resource
/// kinds at compile time.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: core::marker::PhantomData<T>,
}

// Manual impls so markers need not carry the traits themselves
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: core::marker::PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>(0x{:x})", core::any::type_name::<T>(), self.id)
    }
}

/// Marker for memory object handles
pub struct MemMarker;
/// Marker for session handles
pub struct SessionMarker;

/// Handle to a registered memory object
pub type MemHandle = Handle<MemMarker>;
/// Handle to an open session
pub type SessionHandle = Handle<SessionMarker>;

// =============================================================================
// TESTS
// =============================================================================
