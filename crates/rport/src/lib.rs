//! Remote-Port co-simulation protocol.
//!
//! This crate connects two simulators over a byte stream so that each can
//! reach the other's bus, interrupt lines and IOMMU, with bounded drift
//! between their virtual clocks. It provides:
//! 1. **Protocol:** Packet codec, capability negotiation and packet buffers.
//! 2. **Channel:** Receive thread, ordered hand-over to the consumer,
//!    request/response correlation and time synchronization.
//! 3. **Devices:** Device registry, memory master and slave, GPIO bridge.
//! 4. **ATS:** Translation server, client and cache.
//! 5. **Ambient:** Configuration, statistics, clocks and transports.

/// Address Translation Service (cache, server, client).
pub mod ats;
/// Growable packet buffer.
pub mod buffer;
/// Channel engine.
pub mod channel;
/// Virtual clock sources.
pub mod clock;
/// Constants, errors and lock helpers.
pub mod common;
/// JSON configuration.
pub mod config;
/// Device trait and registry.
pub mod device;
/// Memory master, memory slave and GPIO bridge.
pub mod devices;
/// Consumer wakeup notification.
pub mod event;
/// Local bus targets.
pub mod memory;
/// Peer negotiation state.
pub mod peer;
/// Wire protocol.
pub mod proto;
/// Channel counters.
pub mod stats;
/// Byte-stream transports.
pub mod transport;

/// A connection to a peer; create with `Channel::new`, then `start`.
pub use crate::channel::Channel;
/// Root configuration; use `Config::default()` or load JSON.
pub use crate::config::Config;
/// Crate error and result types.
pub use crate::common::{Error, Result};
/// Packet storage shared by the codec and the channel.
pub use crate::buffer::DynPacket;
/// Implemented by everything attached to a channel.
pub use crate::device::RemotePortDevice;
