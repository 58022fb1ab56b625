//! # Channel Tests
//!
//! Drives a channel from a raw peer on the other end of a socket pair:
//! Hello negotiation, ordered hand-over to the consumer, ring backpressure,
//! response routing and the protocol violations that must stop the channel.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;

use rport_core::buffer::DynPacket;
use rport_core::channel::{Channel, ChannelState, Termination};
use rport_core::common::constants::{CFG_OPT_QUANTUM, HEADER_SIZE};
use rport_core::common::{Error, ProtocolError, Result};
use rport_core::config::ChannelConfig;
use rport_core::device::{CommandSet, RemotePortDevice};
use rport_core::proto::caps::Capabilities;
use rport_core::proto::codec;
use rport_core::proto::header::{Command, FLAG_POSTED, FLAG_RESPONSE};
use rport_core::proto::packet::{Cfg, Interrupt, Version};

use crate::common::harness::{RawPeer, negotiated_raw_pair, process_until, raw_pair, test_config, wait_until};
use crate::common::mocks::RecordingDevice;

/// Sends an interrupt packet for `dev` and returns its id.
fn send_interrupt(peer: &mut RawPeer, dev: u32, line: u32, flags: u32) -> u32 {
    let mut pkt = DynPacket::new();
    let id = peer.id();
    let irq = Interrupt { timestamp: 0, vector: 0, line, val: 1 };
    let len = codec::encode_interrupt(&mut pkt, id, dev, &irq, flags);
    peer.send(&pkt, len);
    id
}

fn sync_request(channel: &Channel) -> (DynPacket, usize) {
    let mut pkt = DynPacket::new();
    let len = codec::encode_sync(&mut pkt, channel.new_id(), 0, channel.normalized_clk());
    (pkt, len)
}

fn interrupt_recorder() -> Arc<RecordingDevice> {
    Arc::new(RecordingDevice::new(CommandSet::empty().with(Command::Interrupt)))
}

fn terminated_by(channel: &Channel) -> Option<Termination> {
    match channel.state() {
        ChannelState::Terminated(reason) => Some(reason),
        _ => None,
    }
}

/// The peer's Hello fixes the capabilities to the intersection of both lists.
#[test]
fn hello_negotiates_capabilities() {
    let (channel, mut peer, _clock) = raw_pair(test_config());
    assert_eq!(channel.state(), ChannelState::Established);
    assert!(channel.peer().negotiated().is_none());
    assert_eq!(channel.peer().caps(), Capabilities::none());

    peer.send_hello(&[2, 4, 77]);
    assert!(wait_until(|| channel.peer().negotiated().is_some()));
    let caps = channel.peer().caps();
    assert!(caps.busaccess_ext_byte_en);
    assert!(caps.ats);
    assert!(!caps.busaccess_ext_base);
    assert!(!caps.wire_posted_updates);
    channel.shutdown();
}

/// A Hello without capabilities after negotiation is tolerated; one with
/// capabilities is a violation.
#[test]
fn second_hello() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    peer.send_hello(&[]);
    let _ = send_interrupt(&mut peer, 40, 0, 0);
    assert!(wait_until(|| channel.stats().dropped == 1));
    assert!(!channel.is_terminated());

    peer.send_hello(&[1]);
    assert!(wait_until(|| channel.is_terminated()));
    assert_eq!(terminated_by(&channel), Some(Termination::Protocol(ProtocolError::CapabilitiesRenegotiated)));
    channel.shutdown();
}

/// A different major version stops the channel.
#[test]
fn version_mismatch_is_fatal() {
    let (channel, mut peer, _clock) = raw_pair(test_config());
    let mut pkt = DynPacket::new();
    let len = codec::encode_hello_caps(&mut pkt, 1, 0, Version { major: 3, minor: 9 }, &[]);
    peer.send(&pkt, len);
    assert!(wait_until(|| channel.is_terminated()));
    assert_eq!(
        terminated_by(&channel),
        Some(Termination::Protocol(ProtocolError::VersionMismatch { local: 4, peer: 3, peer_minor: 9 }))
    );
    channel.shutdown();
}

/// Requests reach the device in the order they were sent.
#[test]
fn handover_preserves_order() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let recorder = interrupt_recorder();
    channel.attach(1, recorder.clone()).unwrap();

    let sent: Vec<u32> = (0..6).map(|line| send_interrupt(&mut peer, 1, line, FLAG_POSTED)).collect();
    assert!(process_until(&channel, || recorder.ids().len() == sent.len()));
    assert_eq!(recorder.ids(), sent);
    assert_eq!(channel.stats().handovers, 6);
    channel.shutdown();
}

/// A full ring stalls the receive thread without losing or reordering packets.
#[test]
fn ring_backpressure() {
    let config = ChannelConfig { rx_queue_len: 4, ..test_config() };
    let (channel, mut peer, _clock) = negotiated_raw_pair(config);
    let recorder = interrupt_recorder();
    channel.attach(1, recorder.clone()).unwrap();
    assert_eq!(channel.ring_capacity(), 3);

    let sent: Vec<u32> = (0..10).map(|line| send_interrupt(&mut peer, 1, line, FLAG_POSTED)).collect();
    assert!(wait_until(|| channel.pending() == 3));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(channel.pending(), 3);
    assert_eq!(channel.ring_free(), 0);

    assert!(process_until(&channel, || recorder.ids().len() == sent.len()));
    assert_eq!(recorder.ids(), sent);
    assert!(channel.stats().ring_full >= 1);
    channel.shutdown();
}

/// Nop packets are consumed by the receive thread.
#[test]
fn nop_is_ignored() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let recorder = interrupt_recorder();
    channel.attach(1, recorder.clone()).unwrap();

    let mut nop = DynPacket::new();
    let len = codec::encode_hdr(&mut nop, Command::Nop, 0, peer.id(), 0, 1);
    peer.send(&nop, len);
    let id = send_interrupt(&mut peer, 1, 0, FLAG_POSTED);
    assert!(process_until(&channel, || !recorder.ids().is_empty()));
    assert_eq!(recorder.ids(), vec![id]);
    assert_eq!(channel.stats().handovers, 1);
    channel.shutdown();
}

/// Posted responses and packets for devices outside the table are dropped.
#[test]
fn drops_posted_responses_and_unknown_devices() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let _ = send_interrupt(&mut peer, 0, 0, FLAG_RESPONSE | FLAG_POSTED);
    let _ = send_interrupt(&mut peer, channel.config().max_devs as u32, 0, 0);
    assert!(wait_until(|| channel.stats().dropped == 2));
    assert_eq!(channel.pending(), 0);
    assert!(!channel.is_terminated());

    // The session slot is still free.
    let (pkt, len) = sync_request(&channel);
    let requester = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || channel.request(&pkt, len).map(|rsp| rsp.header().map(|h| h.id)))
    };
    let req = peer.expect(Command::Sync);
    let hdr = *req.header().unwrap();
    let mut rsp = DynPacket::new();
    let n = codec::encode_sync_resp(&mut rsp, hdr.id, 0, RawPeer::sync_timestamp(&req));
    peer.send(&rsp, n);
    assert_eq!(requester.join().unwrap().unwrap(), Some(hdr.id));
    channel.shutdown();
}

/// Cfg options are recorded and answered unless posted.
#[test]
fn cfg_options() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let mut pkt = DynPacket::new();
    let len = codec::encode_cfg(&mut pkt, peer.id(), 0, Cfg { opt: 5, set: 2 }, FLAG_POSTED);
    peer.send(&pkt, len);
    let id = peer.id();
    let len = codec::encode_cfg(&mut pkt, id, 0, Cfg { opt: CFG_OPT_QUANTUM, set: 1 }, 0);
    peer.send(&pkt, len);

    assert!(process_until(&channel, || channel.peer().peer_option(CFG_OPT_QUANTUM).is_some()));
    assert_eq!(channel.peer().peer_option(5), Some(2));
    let rsp = peer.expect(Command::Cfg);
    let hdr = rsp.header().unwrap();
    assert!(hdr.is_response());
    assert_eq!(hdr.id, id);
    channel.shutdown();
}

/// Per-device requests match responses by id, whatever order they arrive in.
#[test]
fn device_responses_match_by_id() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let requesters: Vec<_> = (0..2)
        .map(|line| {
            let channel = Arc::clone(&channel);
            thread::spawn(move || -> Result<(u32, u32)> {
                let mut pkt = DynPacket::new();
                let id = channel.new_id();
                let irq = Interrupt { timestamp: 0, vector: 0, line, val: 1 };
                let len = codec::encode_interrupt(&mut pkt, id, 2, &irq, 0);
                let rsp = channel.device_request(2, &pkt, len)?;
                Ok((id, rsp.header().map_or(u32::MAX, |h| h.id)))
            })
        })
        .collect();

    let first = peer.expect(Command::Interrupt);
    let second = peer.expect(Command::Interrupt);
    for req in [second, first] {
        let hdr = *req.header().unwrap();
        let mut rsp = DynPacket::new();
        let irq = Interrupt { timestamp: 0, vector: 0, line: 0, val: 1 };
        let len = codec::encode_interrupt(&mut rsp, hdr.id, hdr.dev, &irq, FLAG_RESPONSE);
        peer.send(&rsp, len);
    }
    for requester in requesters {
        let (sent, got) = requester.join().unwrap().unwrap();
        assert_eq!(sent, got);
    }
    assert_eq!(channel.stats().responses, 2);
    channel.shutdown();
}

/// A session response with the wrong id is fatal for the requester.
#[test]
#[should_panic(expected = "response id mismatch")]
fn reordered_session_response() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let responder = thread::spawn(move || {
        let req = peer.expect(Command::Sync);
        let hdr = *req.header().unwrap();
        let mut rsp = DynPacket::new();
        let len = codec::encode_sync_resp(&mut rsp, hdr.id.wrapping_add(1), 0, 0);
        peer.send(&rsp, len);
        peer
    });
    let (pkt, len) = sync_request(&channel);
    let _keep_peer = responder;
    let _ = channel.request(&pkt, len);
}

/// An unsolicited response while the session slot is full stops the channel.
#[test]
fn unexpected_response_is_fatal() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let mut rsp = DynPacket::new();
    let len = codec::encode_sync_resp(&mut rsp, 77, 0, 0);
    peer.send(&rsp, len);
    peer.send(&rsp, len);
    assert!(wait_until(|| channel.is_terminated()));
    assert_eq!(
        terminated_by(&channel),
        Some(Termination::Protocol(ProtocolError::UnexpectedResponse { id: 77, dev: 0 }))
    );
    channel.shutdown();
}

/// Command codes outside the protocol stop the channel.
#[test]
fn unknown_command_is_fatal() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let mut pkt = DynPacket::with_capacity(HEADER_SIZE);
    pkt.as_mut_bytes()[..4].copy_from_slice(&42u32.to_be_bytes());
    peer.send(&pkt, HEADER_SIZE);
    assert!(wait_until(|| channel.is_terminated()));
    assert_eq!(
        terminated_by(&channel),
        Some(Termination::Protocol(ProtocolError::UnknownCommand { cmd: 42, dev: 0 }))
    );
    channel.shutdown();
}

/// A request for an empty device index is fatal on the consumer side.
#[test]
#[should_panic(expected = "no device attached")]
fn request_for_missing_device() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let _ = send_interrupt(&mut peer, 3, 0, FLAG_POSTED);
    let _ = process_until(&channel, || false);
}

/// A command the attached device does not implement is fatal.
#[test]
#[should_panic(expected = "does not handle interrupt")]
fn command_not_handled_by_device() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    channel.attach(1, Arc::new(RecordingDevice::new(CommandSet::bus()))).unwrap();
    let _ = send_interrupt(&mut peer, 1, 0, FLAG_POSTED);
    let _ = process_until(&channel, || false);
}

/// Issues a session request from inside its handler.
struct Nester;

impl RemotePortDevice for Nester {
    fn name(&self) -> &str {
        "nester"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::empty().with(Command::Interrupt)
    }

    fn handle(&self, channel: &Channel, _pkt: &DynPacket) -> Result<()> {
        let (pkt, len) = sync_request(channel);
        drop(channel.request(&pkt, len)?);
        Ok(())
    }
}

/// Session requests do not nest on one thread.
#[test]
#[should_panic(expected = "nested session request")]
fn nested_session_request() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    channel.attach(1, Arc::new(Nester)).unwrap();
    let peer_thread = thread::spawn(move || {
        let _ = peer.expect(Command::Sync);
        let _ = send_interrupt(&mut peer, 1, 0, FLAG_POSTED);
        peer
    });
    let (pkt, len) = sync_request(&channel);
    let _keep_peer = peer_thread;
    let _ = channel.request(&pkt, len);
}

/// Losing the peer fails pending and future requests with `Disconnected`.
#[test]
fn disconnect_fails_waiters() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    let (pkt, len) = sync_request(&channel);
    let requester = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || channel.request(&pkt, len).map(|_| ()))
    };
    let _ = peer.expect(Command::Sync);
    peer.close();

    assert!(matches!(requester.join().unwrap(), Err(Error::Disconnected)));
    assert_eq!(terminated_by(&channel), Some(Termination::Disconnected));
    let (pkt, len) = sync_request(&channel);
    assert!(matches!(channel.request(&pkt, len), Err(Error::Disconnected)));
    assert!(matches!(channel.run(), Error::Disconnected));
    channel.shutdown();
}

/// Shutdown is idempotent, detaches devices and keeps the first reason.
#[test]
fn shutdown_is_terminal() {
    let (channel, _peer, _clock) = negotiated_raw_pair(test_config());
    channel.attach(1, interrupt_recorder()).unwrap();
    assert!(channel.device(1).is_some());

    channel.shutdown();
    channel.shutdown();
    assert_eq!(terminated_by(&channel), Some(Termination::Shutdown));
    assert!(channel.device(1).is_none());
    assert!(matches!(channel.write(&[0; HEADER_SIZE]), Err(Error::Shutdown)));
    assert!(matches!(channel.send_cfg(1, 1), Err(Error::Shutdown)));
}

/// Device indices outside the table cannot be attached.
#[test]
fn attach_out_of_range() {
    let (channel, _peer, _clock) = raw_pair(test_config());
    let max = channel.config().max_devs as u32;
    assert!(matches!(channel.attach(max, interrupt_recorder()), Err(Error::Config(_))));
    channel.shutdown();
}
