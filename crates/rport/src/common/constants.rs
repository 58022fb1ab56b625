//! Wire protocol constants.
//!
//! This module collects the fixed numbers of the Remote-Port wire format. It provides:
//! 1. **Version:** The protocol version advertised in every Hello.
//! 2. **Layout sizes:** Total on-wire size of each fixed packet layout, header included.
//! 3. **Limits:** Upper bounds used by the channel engine and the GPIO bridge.

/// Protocol major version. A peer with a different major version is rejected.
pub const VERSION_MAJOR: u16 = 4;

/// Protocol minor version.
pub const VERSION_MINOR: u16 = 3;

/// Size of the common packet header (cmd, len, id, flags, dev).
pub const HEADER_SIZE: usize = 20;

/// Hello packet: header + version + capability descriptor.
pub const HELLO_SIZE: usize = HEADER_SIZE + 4 + 8;

/// Minimum Hello body carrying only the version.
pub const HELLO_VERSION_BODY: usize = 4;

/// Cfg packet: header + opt + set.
pub const CFG_SIZE: usize = HEADER_SIZE + 5;

/// Legacy busaccess packet without payload.
pub const BUSACCESS_SIZE: usize = HEADER_SIZE + 38;

/// Extended busaccess packet without payload.
pub const BUSACCESS_EXT_SIZE: usize = HEADER_SIZE + 60;

/// Interrupt packet.
pub const INTERRUPT_SIZE: usize = HEADER_SIZE + 21;

/// Sync packet.
pub const SYNC_SIZE: usize = HEADER_SIZE + 8;

/// ATS request/invalidate packet (four reserved u64 words included).
pub const ATS_SIZE: usize = HEADER_SIZE + 68;

/// Cfg option selecting the sync quantum.
pub const CFG_OPT_QUANTUM: u32 = 0;

/// Highest number of GPIO lines a single bridge can expose.
pub const MAX_GPIOS: u32 = 164;

/// Extra payload room preallocated in receive and response buffers.
pub const PAYLOAD_HEADROOM: usize = 1024;
