//! Receive thread.
//!
//! One thread per channel reads packets off the transport and routes them:
//! - responses go to the session slot or the matching per-device slot;
//! - Hello is negotiated on the spot;
//! - Sync is answered immediately when the peer is within one quantum;
//! - everything else is handed to the consumer through the ring.
//!
//! The thread never runs device code.

use std::io;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::buffer::DynPacket;
use crate::common::constants::HEADER_SIZE;
use crate::common::{ProtocolError, lock};
use crate::proto::codec;
use crate::proto::header::{Command, Header};
use crate::proto::packet::Body;
use crate::stats::Counter;

use super::queue::Permit;
use super::{Channel, Termination};

impl Channel {
    pub(super) fn rx_loop(self: Arc<Self>) {
        let mut buf = DynPacket::with_capacity(self.config.initial_packet_capacity);
        debug!(channel = %self.name, "receive thread started");
        while !self.is_terminated() {
            if let Err(e) = self.read_packet(&mut buf) {
                if !self.is_terminated() {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        info!(channel = %self.name, "peer closed the connection");
                    } else {
                        warn!(channel = %self.name, error = %e, "transport read failed");
                    }
                    self.terminate(Termination::Disconnected);
                }
                break;
            }
            if let Err(err) = self.route(&mut buf) {
                self.fatal(err);
            }
        }
        debug!(channel = %self.name, "receive thread exiting");
    }

    /// Reads one complete packet into `buf`, growing it as needed.
    fn read_packet(&self, buf: &mut DynPacket) -> io::Result<()> {
        buf.ensure_capacity(HEADER_SIZE);
        self.transport.recv_exact(&mut buf.as_mut_bytes()[..HEADER_SIZE])?;
        let hdr = codec::decode_header(buf.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let size = hdr.packet_size();
        buf.ensure_capacity(size);
        if size > HEADER_SIZE {
            self.transport.recv_exact(&mut buf.as_mut_bytes()[HEADER_SIZE..size])?;
        }
        self.stats.record_rx(size);
        Ok(())
    }

    fn route(&self, buf: &mut DynPacket) -> Result<(), ProtocolError> {
        let hdr = buf.decode()?.header;
        trace!(
            channel = %self.name,
            cmd = Command::name_of(hdr.cmd),
            id = hdr.id,
            dev = hdr.dev,
            flags = hdr.flags,
            len = hdr.len,
            "rx"
        );
        let Some(cmd) = hdr.command() else {
            return Err(ProtocolError::UnknownCommand { cmd: hdr.cmd, dev: hdr.dev });
        };
        if hdr.dev as usize >= self.config.max_devs {
            warn!(channel = %self.name, dev = hdr.dev, %cmd, "dropping packet for device outside the table");
            self.stats.bump(Counter::Dropped);
            return Ok(());
        }
        if hdr.is_response() {
            return self.route_response(&hdr, buf);
        }
        match cmd {
            Command::Nop => {}
            Command::Hello => self.handle_hello(buf)?,
            Command::Sync => {
                if !self.answer_sync_fast(&hdr, buf) {
                    self.hand_over(buf);
                }
            }
            _ => self.hand_over(buf),
        }
        Ok(())
    }

    fn route_response(&self, hdr: &Header, buf: &mut DynPacket) -> Result<(), ProtocolError> {
        if hdr.is_posted() {
            debug!(channel = %self.name, id = hdr.id, "dropping posted response");
            self.stats.bump(Counter::Dropped);
            return Ok(());
        }
        let unexpected = ProtocolError::UnexpectedResponse { id: hdr.id, dev: hdr.dev };
        let mut st = lock(&self.responses);
        let waiting = st
            .dev_slots
            .get_mut(hdr.dev as usize)
            .and_then(|slots| slots.iter_mut().find(|s| s.used && s.id == hdr.id));
        if let Some(slot) = waiting {
            if slot.rsp.is_valid() {
                return Err(unexpected);
            }
            DynPacket::swap(&mut slot.rsp, buf);
        } else {
            if st.session.is_valid() {
                return Err(unexpected);
            }
            DynPacket::swap(&mut st.session, buf);
        }
        drop(st);
        self.stats.bump(Counter::Response);
        self.progress.notify_all();
        Ok(())
    }

    fn handle_hello(&self, buf: &DynPacket) -> Result<(), ProtocolError> {
        let Some(Body::Hello(hello)) = buf.packet().map(|p| &p.body) else {
            return Err(ProtocolError::Malformed { cmd: "hello" });
        };
        let negotiated = self.peer.negotiate(hello.version, &hello.caps)?;
        info!(
            channel = %self.name,
            major = negotiated.version.major,
            minor = negotiated.version.minor,
            caps = ?negotiated.caps,
            "peer hello"
        );
        Ok(())
    }

    /// Moves `buf` into the next ring slot, blocking while the ring is full.
    fn hand_over(&self, buf: &mut DynPacket) {
        match self.ring.free.acquire() {
            Permit::Closed => return,
            Permit::GrantedAfterWait => {
                self.stats.bump(Counter::RingFull);
                debug!(channel = %self.name, "receive ring was full");
            }
            Permit::Granted => {}
        }
        let pos = lock(&self.responses).write_pos();
        DynPacket::swap(&mut lock(self.ring.slot(pos)), buf);
        lock(&self.responses).publish();
        self.stats.bump(Counter::Handover);
        self.events.notify();
        self.progress.notify_all();
    }
}
