//! Packet header and command codes.
//!
//! Every packet starts with the same 20-byte big-endian header:
//!
//! ```text
//!   0        4        8        12       16       20
//!   +--------+--------+--------+--------+--------+
//!   |  cmd   |  len   |   id   | flags  |  dev   |
//!   +--------+--------+--------+--------+--------+
//! ```
//!
//! `len` counts body bytes only. `flags` holds the optional, response and
//! posted bits.

use std::fmt;

use crate::common::constants::HEADER_SIZE;

/// Packet may be ignored by a peer that does not understand it.
pub const FLAG_OPTIONAL: u32 = 1 << 0;
/// Packet is a response to a request with the same id.
pub const FLAG_RESPONSE: u32 = 1 << 1;
/// Request does not expect a response.
pub const FLAG_POSTED: u32 = 1 << 2;

/// Remote-Port command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Command {
    /// No operation.
    Nop = 0,
    /// Version and capability announcement.
    Hello = 1,
    /// Session configuration option.
    Cfg = 2,
    /// Bus read.
    Read = 3,
    /// Bus write.
    Write = 4,
    /// Interrupt / GPIO line update.
    Interrupt = 5,
    /// Virtual-time synchronization.
    Sync = 6,
    /// Address translation request.
    AtsReq = 7,
    /// Address translation invalidation.
    AtsInv = 8,
}

impl Command {
    /// All commands in code order.
    pub const ALL: [Self; 9] = [
        Self::Nop,
        Self::Hello,
        Self::Cfg,
        Self::Read,
        Self::Write,
        Self::Interrupt,
        Self::Sync,
        Self::AtsReq,
        Self::AtsInv,
    ];

    /// Returns the wire code.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Returns the display name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Hello => "hello",
            Self::Cfg => "cfg",
            Self::Read => "read",
            Self::Write => "write",
            Self::Interrupt => "interrupt",
            Self::Sync => "sync",
            Self::AtsReq => "ats_request",
            Self::AtsInv => "ats_invalidation",
        }
    }

    /// Returns the display name for a raw code, `"unknown"` if unassigned.
    pub fn name_of(code: u32) -> &'static str {
        Self::try_from(code).map_or("unknown", Self::name)
    }
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::ALL.get(code as usize).copied().ok_or(code)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Raw command code. Kept raw so unknown commands survive decoding.
    pub cmd: u32,
    /// Body length in bytes.
    pub len: u32,
    /// Request id chosen by the sender.
    pub id: u32,
    /// Flag bits.
    pub flags: u32,
    /// Logical device index.
    pub dev: u32,
}

impl Header {
    /// Returns the command, or `None` for an unknown code.
    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.cmd).ok()
    }

    /// True if this packet answers an earlier request.
    pub const fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// True if the sender does not expect a response.
    pub const fn is_posted(&self) -> bool {
        self.flags & FLAG_POSTED != 0
    }

    /// True if the packet may be ignored.
    pub const fn is_optional(&self) -> bool {
        self.flags & FLAG_OPTIONAL != 0
    }

    /// Total on-wire size: header plus body.
    pub const fn packet_size(&self) -> usize {
        HEADER_SIZE + self.len as usize
    }
}
