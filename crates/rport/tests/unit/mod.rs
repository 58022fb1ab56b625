//! # Unit Components
//!
//! Tests grouped by the component they exercise. Codec, buffer, cache and
//! configuration tests are pure; the rest drive live channels over socket
//! pairs.


/// Packet buffer behavior.
pub mod buffer;

/// Receive routing, ordering, backpressure and fatal violations.
pub mod channel;




/// End-to-end flows between two channels.
pub mod scenarios;

/// Time synchronization.
pub mod sync;
