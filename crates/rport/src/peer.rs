//! Per-connection peer state.
//!
//! Holds what one side knows about the other: the negotiated version and
//! capabilities (set once, from the first Hello), the clock base used to
//! normalize wire timestamps, and the session options announced via Cfg.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use crate::common::{ProtocolError, lock};
use crate::common::constants::VERSION_MAJOR;
use crate::proto::caps::Capabilities;
use crate::proto::packet::Version;

/// Result of the Hello exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Version announced by the peer.
    pub version: Version,
    /// Capabilities both sides honor.
    pub caps: Capabilities,
}

/// What this side knows about its peer.
#[derive(Debug)]
pub struct PeerState {
    local_caps: Capabilities,
    negotiated: OnceLock<Negotiated>,
    clk_base: u64,
    local_quantum: u64,
    peer_options: Mutex<BTreeMap<u32, u8>>,
}

impl PeerState {
    /// Creates the state for a new session.
    ///
    /// # Arguments
    ///
    /// * `local_caps` - Capabilities this side advertises and is willing to honor.
    /// * `clk_base` - Local virtual time at session start.
    /// * `local_quantum` - Sync quantum configured on this side, in ns.
    pub const fn new(local_caps: Capabilities, clk_base: u64, local_quantum: u64) -> Self {
        Self {
            local_caps,
            negotiated: OnceLock::new(),
            clk_base,
            local_quantum,
            peer_options: Mutex::new(BTreeMap::new()),
        }
    }

    /// Capabilities advertised by this side.
    pub const fn local_caps(&self) -> &Capabilities {
        &self.local_caps
    }

    /// Records the peer's Hello.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::VersionMismatch`] for a different major version and
    /// [`ProtocolError::CapabilitiesRenegotiated`] if a capability list arrives
    /// after negotiation already happened.
    pub fn negotiate(&self, version: Version, codes: &[u32]) -> Result<Negotiated, ProtocolError> {
        if version.major != VERSION_MAJOR {
            return Err(ProtocolError::VersionMismatch {
                local: VERSION_MAJOR,
                peer: version.major,
                peer_minor: version.minor,
            });
        }
        if let Some(existing) = self.negotiated.get() {
            if !codes.is_empty() {
                return Err(ProtocolError::CapabilitiesRenegotiated);
            }
            return Ok(*existing);
        }
        let caps = Capabilities::negotiate(codes, &self.local_caps)?;
        let negotiated = Negotiated { version, caps };
        if self.negotiated.set(negotiated).is_err() {
            return Err(ProtocolError::CapabilitiesRenegotiated);
        }
        Ok(negotiated)
    }

    /// The negotiation result, once the peer's Hello has been seen.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.get()
    }

    /// Negotiated capabilities; none before the peer's Hello.
    pub fn caps(&self) -> Capabilities {
        self.negotiated.get().map_or_else(Capabilities::none, |n| n.caps)
    }

    /// Local virtual time at session start.
    pub const fn clk_base(&self) -> u64 {
        self.clk_base
    }

    /// Converts a local virtual time into session time.
    pub const fn normalize(&self, now: u64) -> u64 {
        now.saturating_sub(self.clk_base)
    }

    /// Converts session time back into local virtual time.
    pub const fn denormalize(&self, session: u64) -> u64 {
        session.saturating_add(self.clk_base)
    }

    /// Sync quantum configured on this side.
    pub const fn local_quantum(&self) -> u64 {
        self.local_quantum
    }

    /// Value the peer announced for a Cfg option, if any.
    pub fn peer_option(&self, opt: u32) -> Option<u8> {
        lock(&self.peer_options).get(&opt).copied()
    }

    pub(crate) fn set_peer_option(&self, opt: u32, set: u8) {
        let _ = lock(&self.peer_options).insert(opt, set);
    }
}
