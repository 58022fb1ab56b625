//! Capability negotiation.
//!
//! Each side lists the capabilities it supports in its Hello. The receiving
//! side honors the intersection of the peer's list with its own, once per
//! session. Missing capabilities force the legacy layout for that feature.

use serde::{Deserialize, Serialize};

use crate::common::ProtocolError;

/// A negotiable protocol capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Capability {
    /// Extended busaccess header (64-bit master id, data offsets).
    BusAccessExtBase = 1,
    /// Byte-enable masks on extended busaccess.
    BusAccessByteEn = 2,
    /// Peer honors the posted flag and only answers non-posted updates.
    WirePostedUpdates = 3,
    /// Address translation service commands.
    Ats = 4,
}

impl Capability {
    /// All capabilities in code order.
    pub const ALL: [Self; 4] = [
        Self::BusAccessExtBase,
        Self::BusAccessByteEn,
        Self::WirePostedUpdates,
        Self::Ats,
    ];

    /// Wire code.
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Capability {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::BusAccessExtBase),
            2 => Ok(Self::BusAccessByteEn),
            3 => Ok(Self::WirePostedUpdates),
            4 => Ok(Self::Ats),
            other => Err(other),
        }
    }
}

/// Set of negotiated capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    /// Extended busaccess header.
    pub busaccess_ext_base: bool,
    /// Byte enables.
    pub busaccess_ext_byte_en: bool,
    /// Posted wire updates.
    pub wire_posted_updates: bool,
    /// Address translation service.
    pub ats: bool,
}

impl Capabilities {
    /// Every capability this crate implements.
    pub const fn all() -> Self {
        Self {
            busaccess_ext_base: true,
            busaccess_ext_byte_en: true,
            wire_posted_updates: true,
            ats: true,
        }
    }

    /// No capabilities: the legacy protocol.
    pub const fn none() -> Self {
        Self {
            busaccess_ext_base: false,
            busaccess_ext_byte_en: false,
            wire_posted_updates: false,
            ats: false,
        }
    }

    /// Builds a set from a list of capabilities.
    pub fn from_list(list: &[Capability]) -> Self {
        let mut caps = Self::none();
        for &cap in list {
            caps.insert(cap);
        }
        caps
    }

    const fn flag_mut(&mut self, cap: Capability) -> &mut bool {
        match cap {
            Capability::BusAccessExtBase => &mut self.busaccess_ext_base,
            Capability::BusAccessByteEn => &mut self.busaccess_ext_byte_en,
            Capability::WirePostedUpdates => &mut self.wire_posted_updates,
            Capability::Ats => &mut self.ats,
        }
    }

    /// True if `cap` is in the set.
    pub const fn contains(&self, cap: Capability) -> bool {
        match cap {
            Capability::BusAccessExtBase => self.busaccess_ext_base,
            Capability::BusAccessByteEn => self.busaccess_ext_byte_en,
            Capability::WirePostedUpdates => self.wire_posted_updates,
            Capability::Ats => self.ats,
        }
    }

    /// Adds `cap` to the set.
    pub const fn insert(&mut self, cap: Capability) {
        *self.flag_mut(cap) = true;
    }

    /// Capabilities present in both sets.
    pub const fn intersection(&self, other: &Self) -> Self {
        Self {
            busaccess_ext_base: self.busaccess_ext_base && other.busaccess_ext_base,
            busaccess_ext_byte_en: self.busaccess_ext_byte_en && other.busaccess_ext_byte_en,
            wire_posted_updates: self.wire_posted_updates && other.wire_posted_updates,
            ats: self.ats && other.ats,
        }
    }

    /// Wire codes of the set, in code order.
    pub fn to_codes(&self) -> Vec<u32> {
        Capability::ALL
            .iter()
            .filter(|&&cap| self.contains(cap))
            .map(|&cap| cap.code())
            .collect()
    }

    /// Processes the capability codes of a peer's Hello.
    ///
    /// Unknown codes are ignored. Listing a known code twice is a protocol
    /// violation.
    ///
    /// # Arguments
    ///
    /// * `codes` - Raw codes from the Hello.
    /// * `local` - Capabilities this side supports.
    ///
    /// # Returns
    ///
    /// The capabilities both sides will use.
    pub fn negotiate(codes: &[u32], local: &Self) -> Result<Self, ProtocolError> {
        let mut peer = Self::none();
        for &code in codes {
            let Ok(cap) = Capability::try_from(code) else {
                tracing::debug!(code, "ignoring unknown capability");
                continue;
            };
            let flag = peer.flag_mut(cap);
            if *flag {
                return Err(ProtocolError::DuplicateCapability(code));
            }
            *flag = true;
        }
        Ok(peer.intersection(local))
    }
}
