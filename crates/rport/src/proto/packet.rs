//! Decoded packet bodies and attribute bits.
//!
//! The codec turns raw bytes into a [`Packet`]: a [`Header`] plus one [`Body`]
//! variant per command. Variable-length trailing data (bus payload, byte
//! enables) is not copied into the body; it stays in the packet buffer and is
//! reached through offsets validated by [`DynPacket`](crate::buffer::DynPacket).

use crate::common::constants::{BUSACCESS_SIZE, VERSION_MAJOR, VERSION_MINOR};

use super::header::Header;

/// Bus access attribute bits.
pub mod attr {
    /// End of packet marker for streaming accesses.
    pub const EOP: u64 = 1 << 0;
    /// Secure-world access.
    pub const SECURE: u64 = 1 << 1;
    /// Extended busaccess header present.
    pub const EXT_BASE: u64 = 1 << 2;
    /// Address is already translated (see ATS).
    pub const PHYS_ADDR: u64 = 1 << 3;
    /// First bit of the response code field.
    pub const RESP_SHIFT: u32 = 8;
    /// Response code field.
    pub const RESP_MASK: u64 = 0xF << RESP_SHIFT;
}

/// ATS attribute bits.
pub mod ats_attr {
    /// Execute permission.
    pub const EXEC: u64 = 1 << 0;
    /// Read permission.
    pub const READ: u64 = 1 << 1;
    /// Write permission.
    pub const WRITE: u64 = 1 << 2;
}

/// ATS result: translation succeeded.
pub const ATS_RESULT_OK: u32 = 0;
/// ATS result: translation failed.
pub const ATS_RESULT_ERROR: u32 = 1;

/// Bus response code carried in attribute bits 8..11.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespCode {
    /// Access completed.
    #[default]
    Ok,
    /// Target reported a failure.
    BusGenericError,
    /// Nothing decodes at the address.
    AddrError,
}

impl RespCode {
    /// Extracts the response code from busaccess attributes.
    ///
    /// Codes outside the defined set read as [`RespCode::BusGenericError`].
    pub const fn from_attributes(attributes: u64) -> Self {
        match (attributes & attr::RESP_MASK) >> attr::RESP_SHIFT {
            0 => Self::Ok,
            2 => Self::AddrError,
            _ => Self::BusGenericError,
        }
    }

    /// Returns the attribute bits encoding this code.
    pub const fn to_attributes(self) -> u64 {
        let code: u64 = match self {
            Self::Ok => 0,
            Self::BusGenericError => 1,
            Self::AddrError => 2,
        };
        code << attr::RESP_SHIFT
    }

    /// True for [`RespCode::Ok`].
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Protocol version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version; must match between peers.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl Version {
    /// The version this crate speaks.
    pub const CURRENT: Self = Self { major: VERSION_MAJOR, minor: VERSION_MINOR };
}

impl Default for Version {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Hello body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hello {
    /// Sender's protocol version.
    pub version: Version,
    /// Raw capability codes, unknown codes included.
    pub caps: Vec<u32>,
}

/// Cfg body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cfg {
    /// Option selector.
    pub opt: u32,
    /// Option value.
    pub set: u8,
}

/// Busaccess body (read and write), legacy or extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusAccess {
    /// Sender's normalized virtual time.
    pub timestamp: u64,
    /// Attribute bits, see [`attr`].
    pub attributes: u64,
    /// Target address.
    pub addr: u64,
    /// Access size in bytes.
    pub len: u32,
    /// Bus width in bytes; zero for plain memory accesses.
    pub width: u32,
    /// Streaming width; equals `len` for non-streaming accesses.
    pub stream_width: u32,
    /// Requester id, assembled from up to three wire fields.
    pub master_id: u64,
    /// Payload offset from packet start (extended layout only).
    pub data_offset: u32,
    /// Offset of a chained packet, unused.
    pub next_offset: u32,
    /// Byte-enable mask offset from packet start (extended layout only).
    pub byte_enable_offset: u32,
    /// Byte-enable mask length (extended layout only).
    pub byte_enable_len: u32,
}

impl BusAccess {
    /// True if the extended header is present.
    pub const fn is_extended(&self) -> bool {
        self.attributes & attr::EXT_BASE != 0
    }

    /// Response code held in the attributes.
    pub const fn resp(&self) -> RespCode {
        RespCode::from_attributes(self.attributes)
    }

    /// Offset of the payload from packet start for this layout.
    pub const fn payload_offset(&self) -> usize {
        if self.is_extended() { self.data_offset as usize } else { BUSACCESS_SIZE }
    }
}

/// Interrupt body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interrupt {
    /// Sender's normalized virtual time.
    pub timestamp: u64,
    /// Interrupt vector.
    pub vector: u64,
    /// Line number.
    pub line: u32,
    /// Line level.
    pub val: u8,
}

/// Sync body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSync {
    /// Sender's normalized virtual time.
    pub timestamp: u64,
}

/// ATS request / invalidation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ats {
    /// Sender's normalized virtual time.
    pub timestamp: u64,
    /// Permission bits, see [`ats_attr`].
    pub attributes: u64,
    /// Untranslated address in requests, translated address in responses.
    pub addr: u64,
    /// Range length in bytes.
    pub len: u64,
    /// [`ATS_RESULT_OK`] or [`ATS_RESULT_ERROR`].
    pub result: u32,
}

/// Command-specific body of a decoded packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    /// Nop, or any packet with no body.
    #[default]
    Empty,
    /// Hello.
    Hello(Hello),
    /// Cfg.
    Cfg(Cfg),
    /// Read or write.
    BusAccess(BusAccess),
    /// Interrupt.
    Interrupt(Interrupt),
    /// Sync.
    Sync(TimeSync),
    /// ATS request or invalidation.
    Ats(Ats),
    /// Unknown command; the bytes are left undecoded.
    Unknown,
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Common header.
    pub header: Header,
    /// Command body.
    pub body: Body,
}

impl Packet {
    /// Returns the busaccess body if this is a read or write.
    pub fn bus_access(&self) -> Option<&BusAccess> {
        match &self.body {
            Body::BusAccess(b) => Some(b),
            _ => None,
        }
    }
}
