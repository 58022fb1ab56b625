//! Channel statistics.
//!
//! Counters are updated lock-free from the receive thread and from callers.
//! It provides:
//! 1. **Traffic:** Packets and bytes in each direction.
//! 2. **Dispatch:** Responses routed, packets handed to the consumer, ring-full stalls.
//! 3. **Time sync:** Fast-path replies, sync rounds, deferred replies and clock warps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live per-channel counters.
        #[derive(Debug, Default)]
        pub struct ChannelStats {
            $($(#[$doc])* $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`ChannelStats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl ChannelStats {
            /// Copies every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Packets written to the transport.
    tx_packets,
    /// Bytes written to the transport.
    tx_bytes,
    /// Packets read from the transport.
    rx_packets,
    /// Bytes read from the transport.
    rx_bytes,
    /// Responses routed to a waiting slot.
    responses,
    /// Packets handed to the consumer through the ring.
    handovers,
    /// Times the receive thread found the ring full.
    ring_full,
    /// Packets dropped (posted responses, out-of-range devices).
    dropped,
    /// Sync requests answered on the receive thread.
    sync_fast,
    /// Sync handshakes initiated locally.
    sync_rounds,
    /// Sync responses delayed until local time caught up.
    sync_deferred,
    /// Forward clock warps.
    warps,
}

impl ChannelStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        let _ = counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_tx(&self, bytes: usize) {
        Self::add(&self.tx_packets, 1);
        Self::add(&self.tx_bytes, bytes as u64);
    }

    pub(crate) fn record_rx(&self, bytes: usize) {
        Self::add(&self.rx_packets, 1);
        Self::add(&self.rx_bytes, bytes as u64);
    }

    pub(crate) fn bump(&self, counter: Counter) {
        let c = match counter {
            Counter::Response => &self.responses,
            Counter::Handover => &self.handovers,
            Counter::RingFull => &self.ring_full,
            Counter::Dropped => &self.dropped,
            Counter::SyncFast => &self.sync_fast,
            Counter::SyncRound => &self.sync_rounds,
            Counter::SyncDeferred => &self.sync_deferred,
            Counter::Warp => &self.warps,
        };
        Self::add(c, 1);
    }
}

/// Event counters other than traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    Response,
    Handover,
    RingFull,
    Dropped,
    SyncFast,
    SyncRound,
    SyncDeferred,
    Warp,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==========================================================")?;
        writeln!(f, "REMOTE-PORT CHANNEL STATISTICS")?;
        writeln!(f, "==========================================================")?;
        writeln!(f, "tx                       {} packets, {} bytes", self.tx_packets, self.tx_bytes)?;
        writeln!(f, "rx                       {} packets, {} bytes", self.rx_packets, self.rx_bytes)?;
        writeln!(f, "responses routed         {}", self.responses)?;
        writeln!(f, "handed to consumer       {}", self.handovers)?;
        writeln!(f, "ring full stalls         {}", self.ring_full)?;
        writeln!(f, "dropped                  {}", self.dropped)?;
        writeln!(f, "sync fast / rounds       {} / {}", self.sync_fast, self.sync_rounds)?;
        write!(f, "sync deferred / warps    {} / {}", self.sync_deferred, self.warps)
    }
}
