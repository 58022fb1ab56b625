//! Error types for the Remote-Port stack.
//!
//! Errors fall into four groups that map onto how the channel reacts:
//! 1. **Codec errors:** Malformed or truncated packets. Raised by the pure codec.
//! 2. **Protocol violations:** Broken contract between cooperating peers. Always fatal.
//! 3. **Bus errors:** Rejected simulated accesses. Carried back as response codes.
//! 4. **Channel errors:** Transport failure, termination and configuration problems.

use std::io;

use thiserror::Error;

/// Failure to decode or encode a packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input shorter than the fixed structure being read.
    #[error("short input: need {need} bytes, have {have}")]
    Short {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Header length smaller than the fixed body layout of the command.
    #[error("{cmd} body too short: need {need} bytes, header says {len}")]
    BodyTooShort {
        /// Command name.
        cmd: &'static str,
        /// Minimum body size.
        need: usize,
        /// Body length from the header.
        len: u32,
    },

    /// Capability list referenced outside the packet.
    #[error("capability list at offset {offset} with {count} entries exceeds packet size {packet_size}")]
    CapsOutOfBounds {
        /// Offset from packet start.
        offset: u32,
        /// Number of u32 entries.
        count: u16,
        /// Header plus body length.
        packet_size: usize,
    },

    /// Master id does not fit the 16-bit legacy field.
    #[error("legacy busaccess cannot carry master id {0:#x}")]
    MasterIdTooWide(u64),

    /// Payload size differs from the access size.
    #[error("payload of {got} bytes does not match access size {size}")]
    PayloadLength {
        /// Access size from the request.
        size: u32,
        /// Bytes supplied.
        got: usize,
    },
}

/// Violation of the contract between two cooperating peers.
///
/// These never become recoverable results: the channel logs them and terminates
/// the process (see [`Channel::fatal`](crate::channel::Channel::fatal)).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Peer speaks a different major version.
    #[error("version mismatch: local {local}.x, peer {peer}.{peer_minor}")]
    VersionMismatch {
        /// Our major version.
        local: u16,
        /// Peer major version.
        peer: u16,
        /// Peer minor version.
        peer_minor: u16,
    },

    /// Capabilities announced twice.
    #[error("capabilities already negotiated")]
    CapabilitiesRenegotiated,

    /// The same capability code listed twice in one Hello.
    #[error("duplicate capability code {0}")]
    DuplicateCapability(u32),

    /// Response id differs from the id of the outstanding request.
    #[error("response id mismatch: expected {expected}, got {got}")]
    ResponseIdMismatch {
        /// Id of the request.
        expected: u32,
        /// Id found in the response.
        got: u32,
    },

    /// A response arrived while the previous one was still unconsumed.
    #[error("unexpected response id {id} for device {dev}")]
    UnexpectedResponse {
        /// Response id.
        id: u32,
        /// Device index.
        dev: u32,
    },

    /// Command code outside the known set.
    #[error("unknown command {cmd} for device {dev}")]
    UnknownCommand {
        /// Raw command code.
        cmd: u32,
        /// Device index.
        dev: u32,
    },

    /// Data-plane command for a device index with nothing attached.
    #[error("no device attached at index {dev} for {cmd}")]
    NoDevice {
        /// Device index.
        dev: u32,
        /// Command name.
        cmd: &'static str,
    },

    /// Attached device does not implement the command.
    #[error("device {name} at index {dev} does not handle {cmd}")]
    UnhandledCommand {
        /// Device index.
        dev: u32,
        /// Device name.
        name: String,
        /// Command name.
        cmd: &'static str,
    },

    /// A packet arrived with the wrong body for its command.
    #[error("malformed {cmd} packet")]
    Malformed {
        /// Command name.
        cmd: &'static str,
    },

    /// More outstanding requests on one device than slots.
    #[error("outstanding transactions exceeded on device {dev} (limit {limit})")]
    TooManyOutstanding {
        /// Device index.
        dev: u32,
        /// Slot count.
        limit: usize,
    },

    /// The packet did not decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Simulated bus rejected an access. Not fatal; becomes a response code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Target-side failure.
    #[error("bus error")]
    Generic,
    /// Nothing decodes at this address.
    #[error("address decode error at {0:#x}")]
    Decode(u64),
}

/// Configuration rejected at load or validation time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// JSON did not parse into the configuration structure.
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading the configuration file failed.
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),

    /// A field holds an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Top-level error for channel and device operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport I/O failed before the channel was established.
    #[error("transport I/O: {0}")]
    Io(#[from] io::Error),

    /// The peer went away. The channel is terminated.
    #[error("peer disconnected")]
    Disconnected,

    /// The channel was shut down locally.
    #[error("channel shut down")]
    Shutdown,

    /// The channel was terminated by a protocol violation seen on another thread.
    #[error("channel terminated by protocol violation: {0}")]
    Protocol(ProtocolError),

    /// Encoding a packet failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
