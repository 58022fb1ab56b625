//! Remote-Port wire protocol.
//!
//! Pure encode/decode of the big-endian packet format. Nothing here does I/O.

/// Capability negotiation.
pub mod caps;
/// Packet encoders and decoders.
pub mod codec;
/// Common header and command codes.
pub mod header;
/// Decoded bodies and attribute bits.
pub mod packet;

pub use caps::{Capabilities, Capability};
pub use header::{Command, FLAG_OPTIONAL, FLAG_POSTED, FLAG_RESPONSE, Header};
pub use packet::{Body, Packet, RespCode, Version};
