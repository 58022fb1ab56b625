//! Dynamic packet buffer.
//!
//! A [`DynPacket`] owns the storage of at most one packet. Storage grows on
//! demand and is never released while the buffer lives, so the receive path
//! and the response slots recycle the same allocations by swapping buffers
//! instead of copying packets.
//!
//! Validity is tracked in the packet itself: a buffer is valid while the
//! header length field it stores is non-zero. [`DynPacket::invalidate`]
//! clears that field.

use std::mem;

use crate::common::CodecError;
use crate::common::constants::{BUSACCESS_EXT_SIZE, HEADER_SIZE};
use crate::proto::caps::Capabilities;
use crate::proto::codec;
use crate::proto::header::Header;
use crate::proto::packet::{Body, Packet};

/// Offset of the `len` field inside the header.
const LEN_FIELD: usize = 4;

/// Growable storage for one packet plus its decoded form.
#[derive(Debug, Clone, Default)]
pub struct DynPacket {
    buf: Vec<u8>,
    decoded: Option<Packet>,
}

impl DynPacket {
    /// Creates a buffer with no storage.
    pub const fn new() -> Self {
        Self { buf: Vec::new(), decoded: None }
    }

    /// Creates a buffer with `capacity` zeroed bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], decoded: None }
    }

    /// Usable storage in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Grows the storage to at least `size` bytes, zero-filling the new part.
    pub fn ensure_capacity(&mut self, size: usize) {
        if self.buf.len() < size {
            self.buf.resize(size, 0);
        }
    }

    /// Marks the buffer empty by clearing the stored header length.
    ///
    /// Storage is kept. Calling this on an empty or already invalid buffer is a no-op.
    pub fn invalidate(&mut self) {
        if let Some(len) = self.buf.get_mut(LEN_FIELD..LEN_FIELD + 4) {
            len.fill(0);
        }
        self.decoded = None;
    }

    /// True if storage exists and the stored header length is non-zero.
    pub fn is_valid(&self) -> bool {
        !self.buf.is_empty() && self.stored_len() != 0
    }

    /// Body length recorded in the stored header, zero if there is no header.
    pub fn stored_len(&self) -> u32 {
        self.buf
            .get(LEN_FIELD..LEN_FIELD + 4)
            .and_then(|b| b.try_into().ok())
            .map_or(0, u32::from_be_bytes)
    }

    /// Exchanges the storage of two buffers without copying.
    pub fn swap(a: &mut Self, b: &mut Self) {
        mem::swap(a, b);
    }

    /// All storage, including bytes beyond the packet.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable storage for the codec and the receive path.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        self.decoded = None;
        &mut self.buf
    }

    /// The bytes of the stored packet: header plus `len` body bytes.
    pub fn packet_bytes(&self) -> &[u8] {
        let size = (HEADER_SIZE + self.stored_len() as usize).min(self.buf.len());
        &self.buf[..size]
    }

    /// Decodes the stored packet and caches the result.
    ///
    /// # Errors
    ///
    /// Propagates codec failures; the cache is left empty in that case.
    pub fn decode(&mut self) -> Result<&Packet, CodecError> {
        let packet = codec::decode(&self.buf)?;
        Ok(self.decoded.insert(packet))
    }

    /// The decoded packet, if [`DynPacket::decode`] ran since the last change.
    pub const fn packet(&self) -> Option<&Packet> {
        self.decoded.as_ref()
    }

    /// The decoded header.
    pub fn header(&self) -> Option<&Header> {
        self.decoded.as_ref().map(|p| &p.header)
    }

    /// Payload of a decoded read or write, if it lies inside the packet.
    ///
    /// Write requests and read responses carry a payload; other busaccess
    /// packets return `None`.
    pub fn bus_data(&self) -> Option<&[u8]> {
        let packet = self.decoded.as_ref()?;
        let ba = packet.bus_access()?;
        let start = ba.payload_offset();
        let end = start.checked_add(ba.len as usize)?;
        if start < HEADER_SIZE || end > packet.header.packet_size() {
            return None;
        }
        self.buf.get(start..end)
    }

    /// Byte-enable mask of a decoded extended read or write.
    ///
    /// `None` unless `peer` negotiated byte enables, the packet is extended and
    /// the mask lies after the extended header and inside the packet.
    pub fn byte_enables(&self, peer: &Capabilities) -> Option<&[u8]> {
        if !peer.busaccess_ext_byte_en {
            return None;
        }
        let packet = self.decoded.as_ref()?;
        let ba = packet.bus_access()?;
        if !ba.is_extended() || ba.byte_enable_len == 0 {
            return None;
        }
        let start = ba.byte_enable_offset as usize;
        let end = start.checked_add(ba.byte_enable_len as usize)?;
        if start < BUSACCESS_EXT_SIZE || end > packet.header.packet_size() {
            return None;
        }
        self.buf.get(start..end)
    }

    /// Capability codes of a decoded Hello.
    pub fn capabilities(&self) -> Option<&[u32]> {
        match &self.decoded.as_ref()?.body {
            Body::Hello(hello) => Some(&hello.caps),
            _ => None,
        }
    }
}
