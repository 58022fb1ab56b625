//! Devices built on the channel engine.
//!
//! - [`MemoryMaster`] issues bus transactions to the peer.
//! - [`MemorySlave`] serves the peer's bus transactions from local targets.
//! - [`Gpio`] bridges interrupt lines in both directions.

/// Interrupt-line bridge.
pub mod gpio;
/// Outbound bus transactions.
pub mod memory_master;
/// Inbound bus transactions.
pub mod memory_slave;

pub use gpio::{Gpio, IrqSink};
pub use memory_master::{BusResponse, MemoryMaster};
pub use memory_slave::MemorySlave;
