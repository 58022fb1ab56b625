//! Memory master: issues bus reads and writes to the peer.
//!
//! Each transaction is a session request: one in flight per channel, answered
//! in order. Bus errors come back as a response code in [`BusResponse`], not
//! as an `Err`.

use std::sync::Arc;

use tracing::debug;

use crate::buffer::DynPacket;
use crate::channel::Channel;
use crate::common::{CodecError, ProtocolError, Result};
use crate::config::MasterConfig;
use crate::memory::MemAttrs;
use crate::proto::codec::{self, BusAccessIn};
use crate::proto::header::Command;
use crate::proto::packet::{RespCode, attr};

/// Outcome of one bus transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusResponse {
    /// Read data; empty for writes.
    pub data: Vec<u8>,
    /// Response code from the peer.
    pub resp: RespCode,
    /// Peer's session time when it answered.
    pub timestamp: u64,
}

impl BusResponse {
    /// True if the peer completed the access.
    pub const fn is_ok(&self) -> bool {
        self.resp.is_ok()
    }

    /// First eight bytes of `data` as a little-endian integer.
    pub fn value_le(&self) -> u64 {
        self.data.iter().take(8).rev().fold(0, |acc, &b| (acc << 8) | u64::from(b))
    }
}

/// Bus master on the local side of a channel.
#[derive(Debug)]
pub struct MemoryMaster {
    channel: Arc<Channel>,
    dev: u32,
    config: MasterConfig,
}

impl MemoryMaster {
    /// Creates a master that targets device index `dev` on the peer.
    pub const fn new(channel: Arc<Channel>, dev: u32, config: MasterConfig) -> Self {
        Self { channel, dev, config }
    }

    /// Device index on the peer.
    pub const fn dev(&self) -> u32 {
        self.dev
    }

    /// Address sent on the wire for local address `addr`.
    pub const fn wire_addr(&self, addr: u64) -> u64 {
        if self.config.relative { addr } else { addr.wrapping_add(self.config.offset) }
    }

    /// Reads `size` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Channel failures, or [`Error::Codec`](crate::common::Error::Codec) if
    /// the master id does not fit the negotiated layout.
    pub fn read(&self, addr: u64, size: u32, attrs: MemAttrs) -> Result<BusResponse> {
        self.transact(Command::Read, addr, size, &[], attrs)
    }

    /// Writes `data` at `addr`.
    ///
    /// # Errors
    ///
    /// As [`MemoryMaster::read`].
    pub fn write(&self, addr: u64, data: &[u8], attrs: MemAttrs) -> Result<BusResponse> {
        let size = u32::try_from(data.len())
            .map_err(|_| CodecError::PayloadLength { size: u32::MAX, got: data.len() })?;
        self.transact(Command::Write, addr, size, data, attrs)
    }

    fn transact(&self, cmd: Command, addr: u64, size: u32, data: &[u8], attrs: MemAttrs) -> Result<BusResponse> {
        let channel = &self.channel;
        let clk = channel.normalized_clk();
        let input = BusAccessIn {
            cmd,
            id: channel.new_id(),
            dev: self.dev,
            flags: 0,
            clk,
            attributes: if attrs.secure { attr::SECURE } else { 0 },
            addr: self.wire_addr(addr),
            size,
            width: 0,
            stream_width: size,
            master_id: attrs.master_id,
        };
        let mut pkt = DynPacket::new();
        let len = codec::encode_busaccess(&mut pkt, &channel.peer().caps(), &input, data, &[])?;

        let rsp = channel.request(&pkt, len)?;
        let reply = rsp.packet().and_then(|p| p.bus_access()).copied();
        let payload = if cmd == Command::Read { rsp.bus_data().map(<[u8]>::to_vec) } else { Some(Vec::new()) };
        drop(rsp);
        let (Some(reply), Some(data)) = (reply, payload) else {
            channel.fatal(ProtocolError::Malformed { cmd: cmd.name() });
        };

        debug!(
            channel = channel.name(),
            dev = self.dev,
            %cmd,
            addr = input.addr,
            size,
            resp = ?reply.resp(),
            "bus transaction"
        );
        channel.sync_vmclock(clk, reply.timestamp);
        channel.restart_sync_timer();
        Ok(BusResponse { data, resp: reply.resp(), timestamp: reply.timestamp })
    }
}
