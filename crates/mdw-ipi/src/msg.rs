//! # IPI Wire Format
//!
//! Fixed-size frames exchanged with the RV co-processor.
//!
//! Every frame is [`IPI_MSG_SIZE`] bytes: a header carrying the sync id,
//! message id, and status word, followed by a message-specific payload.
//! Payload structs are plain-old-data and encoded in place.

use bytemuck::{Pod, Zeroable};

use mdw_core::{Error, Result};

// =============================================================================
// FRAME GEOMETRY
// =============================================================================

/// Total frame size on the wire
pub const IPI_MSG_SIZE: usize = 64;
/// Header size
pub const IPI_HEADER_SIZE: usize = 16;
/// Payload area size
pub const IPI_PAYLOAD_SIZE: usize = IPI_MSG_SIZE - IPI_HEADER_SIZE;

/// Handshake magic the host opens with
pub const HANDSHAKE_MAGIC: u64 = 0x4d44_575f_4950_4931; // "MDW_IPI1"

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u32 = 2;

// =============================================================================
// MESSAGE ID
// =============================================================================

/// IPI message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgId {
    /// Version and feature exchange
    Handshake = 1,
    /// Read a runtime parameter
    ParamGet = 2,
    /// Write a runtime parameter
    ParamSet = 3,
    /// Dispatch a command for execution
    CmdRun = 4,
}

impl MsgId {
    /// Decode from the wire id field
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Handshake),
            2 => Some(Self::ParamGet),
            3 => Some(Self::ParamSet),
            4 => Some(Self::CmdRun),
            _ => None,
        }
    }
}

// =============================================================================
// HEADER
// =============================================================================

/// Frame header, common to every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IpiHeader {
    /// Correlation id, generational, allocated by the host
    pub sync_id: u64,
    /// Message id ([`MsgId`] on the wire)
    pub id: u32,
    /// Status word, 0 = success (reply direction only)
    pub status: u32,
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Handshake request/reply payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct HandshakePayload {
    /// [`HANDSHAKE_MAGIC`] in the request, echoed in the reply
    pub magic: u64,
    /// Protocol version
    pub version: u32,
    /// Reserved
    pub _pad: u32,
    /// Feature bits supported by the remote side
    pub features: u64,
}

/// Parameter get/set payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ParamPayload {
    /// Parameter index
    pub param: u32,
    /// Reserved
    pub _pad: u32,
    /// Parameter value (reply for get, request for set)
    pub value: u64,
}

/// Command dispatch payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CmdPayload {
    /// Device address of the duplicated command buffer
    pub iova: u64,
    /// Size of the command buffer region
    pub size: u32,
    /// Reserved
    pub _pad: u32,
    /// Host timestamp at dispatch, microseconds
    pub start_ts: u64,
    /// Per-subcommand error bitmap (reply direction), bit i = subcmd i failed
    pub sc_rets: u64,
}

// =============================================================================
// FRAME
// =============================================================================

/// One wire frame: header plus payload area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IpiFrame {
    /// Common header
    pub header: IpiHeader,
    /// Message-specific payload bytes
    pub payload: [u8; IPI_PAYLOAD_SIZE],
}

impl IpiFrame {
    /// Create a zero-payload frame
    pub fn new(sync_id: u64, id: MsgId) -> Self {
        Self {
            header: IpiHeader {
                sync_id,
                id: id as u32,
                status: 0,
            },
            payload: [0u8; IPI_PAYLOAD_SIZE],
        }
    }

    /// Message id, if recognized
    pub fn msg_id(&self) -> Option<MsgId> {
        MsgId::from_raw(self.header.id)
    }

    /// Store a payload struct into the frame
    pub fn set_payload<P: Pod>(&mut self, payload: &P) -> Result<()> {
        let bytes = bytemuck::bytes_of(payload);
        if bytes.len() > IPI_PAYLOAD_SIZE {
            return Err(Error::InvalidParameter);
        }
        self.payload[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a payload struct out of the frame
    pub fn payload_as<P: Pod>(&self) -> Result<P> {
        let size = core::mem::size_of::<P>();
        if size > IPI_PAYLOAD_SIZE {
            return Err(Error::InvalidParameter);
        }
        Ok(bytemuck::pod_read_unaligned(&self.payload[..size]))
    }

    /// Frame as wire bytes
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode a frame from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != IPI_MSG_SIZE {
            return Err(Error::InvalidParameter);
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::const_assert_eq!(core::mem::size_of::<IpiHeader>(), IPI_HEADER_SIZE);
static_assertions::const_assert_eq!(core::mem::size_of::<IpiFrame>(), IPI_MSG_SIZE);
static_assertions::const_assert!(core::mem::size_of::<HandshakePayload>() <= IPI_PAYLOAD_SIZE);
static_assertions::const_assert!(core::mem::size_of::<ParamPayload>() <= IPI_PAYLOAD_SIZE);
static_assertions::const_assert!(core::mem::size_of::<CmdPayload>() <= IPI_PAYLOAD_SIZE);

// =============================================================================
// TESTS
// =============================================================================
