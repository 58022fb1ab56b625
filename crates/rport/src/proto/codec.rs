//! Packet encoding and decoding.
//!
//! Pure functions over byte buffers; all integers are big-endian on the wire.
//! It provides:
//! 1. **Decoding:** [`decode_header`], [`decode_payload`] and [`decode`] for whole packets.
//! 2. **Encoding:** One `encode_*` function per command, each writing into a
//!    [`DynPacket`] and returning the number of bytes to put on the wire.
//! 3. **Busaccess layout choice:** Legacy or extended header depending on the
//!    negotiated capabilities and the request attributes.

use crate::buffer::DynPacket;
use crate::common::CodecError;
use crate::common::constants::{
    ATS_SIZE, BUSACCESS_EXT_SIZE, BUSACCESS_SIZE, CFG_SIZE, HEADER_SIZE, HELLO_SIZE,
    HELLO_VERSION_BODY, INTERRUPT_SIZE, SYNC_SIZE,
};

use super::caps::Capabilities;
use super::header::{Command, FLAG_RESPONSE, Header};
use super::packet::{Ats, Body, BusAccess, Cfg, Hello, Interrupt, Packet, TimeSync, Version, attr};

/// Big-endian cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(CodecError::Short { need: end, have: self.buf.len() })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take()?))
    }
}

/// Big-endian cursor writing into a pre-sized slice.
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    /// Sizes `pkt` for `size` bytes, zeroes them and starts writing at offset 0.
    fn start(pkt: &'a mut DynPacket, size: usize) -> Self {
        pkt.ensure_capacity(size);
        let buf = &mut pkt.as_mut_bytes()[..size];
        buf.fill(0);
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_be_bytes());
    }

    fn header(&mut self, cmd: Command, len: usize, id: u32, flags: u32, dev: u32) {
        self.u32(cmd.code());
        self.u32(len as u32);
        self.u32(id);
        self.u32(flags);
        self.u32(dev);
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }
}

/// Decodes the fixed header from the first [`HEADER_SIZE`] bytes.
///
/// # Errors
///
/// [`CodecError::Short`] if fewer than [`HEADER_SIZE`] bytes are supplied.
pub fn decode_header(bytes: &[u8]) -> Result<Header, CodecError> {
    let mut r = Reader::new(bytes, 0);
    Ok(Header {
        cmd: r.u32()?,
        len: r.u32()?,
        id: r.u32()?,
        flags: r.u32()?,
        dev: r.u32()?,
    })
}

fn require(hdr: &Header, cmd: Command, need: usize) -> Result<(), CodecError> {
    if (hdr.len as usize) < need {
        return Err(CodecError::BodyTooShort { cmd: cmd.name(), need, len: hdr.len });
    }
    Ok(())
}

/// Decodes the body of a packet.
///
/// `packet` holds the whole packet starting at the header, since trailing
/// data is addressed by offsets from packet start. Bytes beyond the fixed
/// layout of the command are left in place for forward-compatible
/// extensions.
///
/// # Arguments
///
/// * `hdr` - Header decoded from the same bytes.
/// * `packet` - Header and body bytes; may be longer than the packet.
///
/// # Returns
///
/// The body and the number of body bytes it consumed.
///
/// # Errors
///
/// Fails on a truncated buffer, a body shorter than the command's fixed
/// layout, or a capability list outside the packet.
pub fn decode_payload(hdr: &Header, packet: &[u8]) -> Result<(Body, usize), CodecError> {
    let size = hdr.packet_size();
    let packet = packet
        .get(..size)
        .ok_or(CodecError::Short { need: size, have: packet.len() })?;
    let mut r = Reader::new(packet, HEADER_SIZE);

    let Some(cmd) = hdr.command() else {
        return Ok((Body::Unknown, 0));
    };

    match cmd {
        Command::Nop => Ok((Body::Empty, 0)),
        Command::Hello => {
            require(hdr, cmd, HELLO_VERSION_BODY)?;
            let version = Version { major: r.u16()?, minor: r.u16()? };
            let mut caps = Vec::new();
            if hdr.len as usize >= HELLO_SIZE - HEADER_SIZE {
                let offset = r.u32()?;
                let count = r.u16()?;
                let _reserved = r.u16()?;
                if count > 0 {
                    let start = offset as usize;
                    let end = start + count as usize * 4;
                    if start < HEADER_SIZE || end > size {
                        return Err(CodecError::CapsOutOfBounds { offset, count, packet_size: size });
                    }
                    let mut list = Reader::new(packet, start);
                    for _ in 0..count {
                        caps.push(list.u32()?);
                    }
                }
            }
            Ok((Body::Hello(Hello { version, caps }), hdr.len as usize))
        }
        Command::Cfg => {
            require(hdr, cmd, CFG_SIZE - HEADER_SIZE)?;
            let cfg = Cfg { opt: r.u32()?, set: r.u8()? };
            Ok((Body::Cfg(cfg), CFG_SIZE - HEADER_SIZE))
        }
        Command::Read | Command::Write => {
            require(hdr, cmd, BUSACCESS_SIZE - HEADER_SIZE)?;
            let mut ba = BusAccess {
                timestamp: r.u64()?,
                attributes: r.u64()?,
                addr: r.u64()?,
                len: r.u32()?,
                width: r.u32()?,
                stream_width: r.u32()?,
                master_id: u64::from(r.u16()?),
                ..BusAccess::default()
            };
            if !ba.is_extended() {
                return Ok((Body::BusAccess(ba), BUSACCESS_SIZE - HEADER_SIZE));
            }
            require(hdr, cmd, BUSACCESS_EXT_SIZE - HEADER_SIZE)?;
            let id_31_16 = u64::from(r.u16()?);
            let id_63_32 = u64::from(r.u32()?);
            ba.master_id |= (id_31_16 << 16) | (id_63_32 << 32);
            ba.data_offset = r.u32()?;
            ba.next_offset = r.u32()?;
            ba.byte_enable_offset = r.u32()?;
            ba.byte_enable_len = r.u32()?;
            Ok((Body::BusAccess(ba), BUSACCESS_EXT_SIZE - HEADER_SIZE))
        }
        Command::Interrupt => {
            require(hdr, cmd, INTERRUPT_SIZE - HEADER_SIZE)?;
            let irq = Interrupt {
                timestamp: r.u64()?,
                vector: r.u64()?,
                line: r.u32()?,
                val: r.u8()?,
            };
            Ok((Body::Interrupt(irq), INTERRUPT_SIZE - HEADER_SIZE))
        }
        Command::Sync => {
            require(hdr, cmd, SYNC_SIZE - HEADER_SIZE)?;
            Ok((Body::Sync(TimeSync { timestamp: r.u64()? }), SYNC_SIZE - HEADER_SIZE))
        }
        Command::AtsReq | Command::AtsInv => {
            require(hdr, cmd, ATS_SIZE - HEADER_SIZE)?;
            let ats = Ats {
                timestamp: r.u64()?,
                attributes: r.u64()?,
                addr: r.u64()?,
                len: r.u64()?,
                result: r.u32()?,
            };
            Ok((Body::Ats(ats), ATS_SIZE - HEADER_SIZE))
        }
    }
}

/// Decodes a whole packet: header and body.
///
/// # Errors
///
/// See [`decode_header`] and [`decode_payload`].
pub fn decode(packet: &[u8]) -> Result<Packet, CodecError> {
    let header = decode_header(packet)?;
    let (body, _) = decode_payload(&header, packet)?;
    Ok(Packet { header, body })
}

/// Writes a bare header into the first [`HEADER_SIZE`] bytes of `pkt`.
///
/// Used for commands with no body (nop) and by tests building raw packets.
pub fn encode_hdr(pkt: &mut DynPacket, cmd: Command, len: u32, id: u32, flags: u32, dev: u32) -> usize {
    pkt.ensure_capacity(HEADER_SIZE);
    let mut w = Writer { buf: &mut pkt.as_mut_bytes()[..HEADER_SIZE], pos: 0 };
    w.header(cmd, len as usize, id, flags, dev);
    HEADER_SIZE
}

/// Encodes a Hello with the capability list placed right after the fixed part.
pub fn encode_hello_caps(pkt: &mut DynPacket, id: u32, dev: u32, version: Version, caps: &[u32]) -> usize {
    let size = HELLO_SIZE + caps.len() * 4;
    let mut w = Writer::start(pkt, size);
    w.header(Command::Hello, size - HEADER_SIZE, id, 0, dev);
    w.u16(version.major);
    w.u16(version.minor);
    w.u32(HELLO_SIZE as u32);
    w.u16(caps.len() as u16);
    w.u16(0);
    for &code in caps {
        w.u32(code);
    }
    size
}

/// Encodes a Cfg option.
pub fn encode_cfg(pkt: &mut DynPacket, id: u32, dev: u32, cfg: Cfg, flags: u32) -> usize {
    let mut w = Writer::start(pkt, CFG_SIZE);
    w.header(Command::Cfg, CFG_SIZE - HEADER_SIZE, id, flags, dev);
    w.u32(cfg.opt);
    w.u8(cfg.set);
    CFG_SIZE
}

/// Encodes an interrupt / GPIO line update.
pub fn encode_interrupt(pkt: &mut DynPacket, id: u32, dev: u32, irq: &Interrupt, flags: u32) -> usize {
    let mut w = Writer::start(pkt, INTERRUPT_SIZE);
    w.header(Command::Interrupt, INTERRUPT_SIZE - HEADER_SIZE, id, flags, dev);
    w.u64(irq.timestamp);
    w.u64(irq.vector);
    w.u32(irq.line);
    w.u8(irq.val);
    INTERRUPT_SIZE
}

fn encode_sync_common(pkt: &mut DynPacket, id: u32, dev: u32, clk: u64, flags: u32) -> usize {
    let mut w = Writer::start(pkt, SYNC_SIZE);
    w.header(Command::Sync, SYNC_SIZE - HEADER_SIZE, id, flags, dev);
    w.u64(clk);
    SYNC_SIZE
}

/// Encodes a Sync request carrying the local normalized clock.
pub fn encode_sync(pkt: &mut DynPacket, id: u32, dev: u32, clk: u64) -> usize {
    encode_sync_common(pkt, id, dev, clk, 0)
}

/// Encodes a Sync response echoing the requester's timestamp.
pub fn encode_sync_resp(pkt: &mut DynPacket, id: u32, dev: u32, clk: u64) -> usize {
    encode_sync_common(pkt, id, dev, clk, FLAG_RESPONSE)
}

fn encode_ats(pkt: &mut DynPacket, cmd: Command, id: u32, dev: u32, ats: &Ats, flags: u32) -> usize {
    let mut w = Writer::start(pkt, ATS_SIZE);
    w.header(cmd, ATS_SIZE - HEADER_SIZE, id, flags, dev);
    w.u64(ats.timestamp);
    w.u64(ats.attributes);
    w.u64(ats.addr);
    w.u64(ats.len);
    w.u32(ats.result);
    ATS_SIZE
}

/// Encodes an ATS translation request, or its response with [`FLAG_RESPONSE`].
pub fn encode_ats_req(pkt: &mut DynPacket, id: u32, dev: u32, ats: &Ats, flags: u32) -> usize {
    encode_ats(pkt, Command::AtsReq, id, dev, ats, flags)
}

/// Encodes an ATS invalidation, or its response with [`FLAG_RESPONSE`].
pub fn encode_ats_inv(pkt: &mut DynPacket, id: u32, dev: u32, ats: &Ats, flags: u32) -> usize {
    encode_ats(pkt, Command::AtsInv, id, dev, ats, flags)
}

/// Inputs for [`encode_busaccess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusAccessIn {
    /// [`Command::Read`] or [`Command::Write`].
    pub cmd: Command,
    /// Packet id.
    pub id: u32,
    /// Device index.
    pub dev: u32,
    /// Header flags.
    pub flags: u32,
    /// Normalized virtual time.
    pub clk: u64,
    /// Attribute bits, response code included.
    pub attributes: u64,
    /// Target address.
    pub addr: u64,
    /// Access size in bytes.
    pub size: u32,
    /// Bus width.
    pub width: u32,
    /// Streaming width.
    pub stream_width: u32,
    /// Requester id.
    pub master_id: u64,
}

impl BusAccessIn {
    /// Prepares the response to a decoded read or write request.
    ///
    /// Copies id, device, flags, address and sizes, sets the response flag and
    /// keeps `EXT_BASE` so an extended request gets an extended response.
    pub fn response_to(hdr: &Header, req: &BusAccess) -> Self {
        Self {
            cmd: hdr.command().unwrap_or(Command::Read),
            id: hdr.id,
            dev: hdr.dev,
            flags: hdr.flags | FLAG_RESPONSE,
            clk: req.timestamp,
            attributes: req.attributes & attr::EXT_BASE,
            addr: req.addr,
            size: req.len,
            width: req.width,
            stream_width: req.stream_width,
            master_id: req.master_id,
        }
    }

    /// True if this packet carries `size` payload bytes: write requests and read responses.
    pub const fn carries_payload(&self) -> bool {
        let response = self.flags & FLAG_RESPONSE != 0;
        match self.cmd {
            Command::Write => !response,
            Command::Read => response,
            _ => false,
        }
    }
}

/// Encodes a read or write, with payload and byte enables.
///
/// The legacy layout is used when the peer lacks the extended-header
/// capability and the attributes do not ask for it. Byte enables need the
/// extended layout and are dropped from legacy packets.
///
/// # Arguments
///
/// * `pkt` - Destination buffer.
/// * `peer` - Capabilities negotiated with the peer.
/// * `input` - Header and busaccess fields.
/// * `data` - Payload; must be `input.size` bytes when the packet carries one.
/// * `byte_en` - Byte-enable mask, possibly empty.
///
/// # Returns
///
/// Total packet size.
///
/// # Errors
///
/// [`CodecError::PayloadLength`] for a payload of the wrong size and
/// [`CodecError::MasterIdTooWide`] for a legacy packet with a master id
/// above 16 bits.
pub fn encode_busaccess(
    pkt: &mut DynPacket,
    peer: &Capabilities,
    input: &BusAccessIn,
    data: &[u8],
    byte_en: &[u8],
) -> Result<usize, CodecError> {
    let payload: &[u8] = if input.carries_payload() {
        if data.len() != input.size as usize {
            return Err(CodecError::PayloadLength { size: input.size, got: data.len() });
        }
        data
    } else {
        &[]
    };

    let extended = peer.busaccess_ext_base || input.attributes & attr::EXT_BASE != 0;
    if !extended {
        if input.master_id > u64::from(u16::MAX) {
            return Err(CodecError::MasterIdTooWide(input.master_id));
        }
        let size = BUSACCESS_SIZE + payload.len();
        let mut w = Writer::start(pkt, size);
        w.header(input.cmd, size - HEADER_SIZE, input.id, input.flags, input.dev);
        w.u64(input.clk);
        w.u64(input.attributes);
        w.u64(input.addr);
        w.u32(input.size);
        w.u32(input.width);
        w.u32(input.stream_width);
        w.u16(input.master_id as u16);
        w.put(payload);
        return Ok(size);
    }

    let be_offset = BUSACCESS_EXT_SIZE + payload.len();
    let size = be_offset + byte_en.len();
    let mut w = Writer::start(pkt, size);
    w.header(input.cmd, size - HEADER_SIZE, input.id, input.flags, input.dev);
    w.u64(input.clk);
    w.u64(input.attributes | attr::EXT_BASE);
    w.u64(input.addr);
    w.u32(input.size);
    w.u32(input.width);
    w.u32(input.stream_width);
    w.u16(input.master_id as u16);
    w.u16((input.master_id >> 16) as u16);
    w.u32((input.master_id >> 32) as u32);
    w.u32(BUSACCESS_EXT_SIZE as u32);
    w.u32(0);
    w.u32(be_offset as u32);
    w.u32(byte_en.len() as u32);
    w.seek(BUSACCESS_EXT_SIZE);
    w.put(payload);
    w.put(byte_en);
    Ok(size)
}
