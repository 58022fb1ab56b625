//! # Time Synchronization Tests
//!
//! Fast-path answers on the receive thread, deferred answers, clock warps and
//! locally initiated sync rounds. Clocks are manual, so every step is
//! deterministic: session time starts at zero and only moves when a test (or
//! a warp) moves it.

use std::thread;

use pretty_assertions::assert_eq;

use rport_core::buffer::DynPacket;
use rport_core::clock::VirtualClock;
use rport_core::config::ChannelConfig;
use rport_core::proto::codec;
use rport_core::proto::header::Command;

use crate::common::harness::{CLOCK_START, RawPeer, negotiated_raw_pair, process_until, test_config, wait_until};

const QUANTUM: u64 = 10_000;

fn sync_config(time_warp: bool) -> ChannelConfig {
    ChannelConfig { sync: true, sync_quantum_ns: QUANTUM, time_warp, ..test_config() }
}

fn send_sync(peer: &mut RawPeer, ts: u64) -> u32 {
    let mut pkt = DynPacket::new();
    let id = peer.id();
    let len = codec::encode_sync(&mut pkt, id, 0, ts);
    peer.send(&pkt, len);
    id
}

/// Reads the next packet and checks it answers Sync request `id` with `ts`.
fn expect_sync_response(peer: &mut RawPeer, id: u32, ts: u64) {
    let rsp = peer.expect(Command::Sync);
    let hdr = rsp.header().unwrap();
    assert!(hdr.is_response());
    assert_eq!(hdr.id, id);
    assert_eq!(RawPeer::sync_timestamp(&rsp), ts);
}

/// A peer less than a quantum ahead is answered by the receive thread.
#[test]
fn fast_path_answer() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(sync_config(true));
    let id = send_sync(&mut peer, QUANTUM / 2);
    expect_sync_response(&mut peer, id, QUANTUM / 2);
    assert_eq!(channel.stats().sync_fast, 1);
    assert_eq!(channel.pending(), 0);
    channel.shutdown();
}

/// With sync disabled every request is answered immediately.
#[test]
fn sync_disabled_always_answers() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(test_config());
    assert_eq!(channel.sync_deadline(), None);
    let id = send_sync(&mut peer, 1 << 40);
    expect_sync_response(&mut peer, id, 1 << 40);
    assert_eq!(channel.stats().sync_fast, 1);
    channel.shutdown();
}

/// Without warping the answer waits until local time reaches the request.
#[test]
fn deferred_answer_without_warp() {
    let (channel, mut peer, clock) = negotiated_raw_pair(sync_config(false));
    let ts = 5 * QUANTUM;
    let id = send_sync(&mut peer, ts);

    assert!(process_until(&channel, || channel.has_deferred_sync()));
    assert_eq!(channel.stats().sync_deferred, 1);
    channel.poll_sync().unwrap();
    assert!(channel.has_deferred_sync());

    let _ = clock.advance(ts);
    channel.restart_sync_timer();
    channel.poll_sync().unwrap();
    assert!(!channel.has_deferred_sync());
    expect_sync_response(&mut peer, id, ts);
    assert_eq!(clock.now_ns(), CLOCK_START + ts);
    channel.shutdown();
}

/// An idle channel warps forward by up to one quantum and answers if that
/// reaches the request.
#[test]
fn warp_and_answer() {
    let (channel, mut peer, clock) = negotiated_raw_pair(sync_config(true));
    let id = send_sync(&mut peer, QUANTUM);

    assert!(process_until(&channel, || channel.stats().warps == 1));
    expect_sync_response(&mut peer, id, QUANTUM);
    assert_eq!(channel.normalized_clk(), QUANTUM);
    assert_eq!(clock.now_ns(), CLOCK_START + QUANTUM);
    assert!(!channel.has_deferred_sync());
    channel.shutdown();
}

/// A request further ahead than one quantum gets a partial warp and a deferral.
#[test]
fn partial_warp_defers() {
    let (channel, mut peer, _clock) = negotiated_raw_pair(sync_config(true));
    let ts = 3 * QUANTUM;
    let id = send_sync(&mut peer, ts);

    assert!(process_until(&channel, || channel.has_deferred_sync()));
    assert_eq!(channel.normalized_clk(), QUANTUM);
    assert_eq!(channel.stats().warps, 1);

    // A second request replaces the first deferral.
    let id2 = send_sync(&mut peer, ts + 1);
    assert!(process_until(&channel, || channel.stats().sync_deferred == 2));
    assert_eq!(channel.normalized_clk(), 2 * QUANTUM);

    channel.clock().warp_to(CLOCK_START + ts + 1);
    channel.restart_sync_timer();
    channel.poll_sync().unwrap();
    expect_sync_response(&mut peer, id2, ts + 1);
    assert_ne!(id, id2);
    channel.shutdown();
}

/// The timer starts a round one quantum after start; the peer's answer
/// completes it and re-arms the timer.
#[test]
fn local_sync_round() {
    let (channel, mut peer, clock) = negotiated_raw_pair(sync_config(true));
    assert_eq!(channel.sync_deadline(), Some(QUANTUM));

    let responder = thread::spawn(move || {
        let req = peer.expect(Command::Sync);
        let hdr = *req.header().unwrap();
        let ts = RawPeer::sync_timestamp(&req);
        let mut rsp = DynPacket::new();
        let len = codec::encode_sync_resp(&mut rsp, hdr.id, 0, ts);
        peer.send(&rsp, len);
        (ts, peer)
    });

    let _ = clock.advance(QUANTUM);
    channel.poll_sync().unwrap();
    let (ts, _peer) = responder.join().unwrap();
    assert_eq!(ts, QUANTUM);
    assert_eq!(channel.stats().sync_rounds, 1);
    assert_eq!(channel.sync_deadline(), Some(2 * QUANTUM));
    channel.shutdown();
}

/// A round that comes due while an answer is deferred is postponed.
#[test]
fn round_postponed_while_deferred() {
    let (channel, mut peer, clock) = negotiated_raw_pair(sync_config(false));
    let _ = send_sync(&mut peer, 5 * QUANTUM);
    assert!(process_until(&channel, || channel.has_deferred_sync()));

    let _ = clock.advance(QUANTUM);
    channel.poll_sync().unwrap();
    assert!(channel.sync_pending());
    assert_eq!(channel.sync_deadline(), Some(2 * QUANTUM));
    assert_eq!(channel.stats().sync_rounds, 0);
    channel.shutdown();
}

/// Completed transactions pull the clock forward by at most one quantum.
#[test]
fn vmclock_catch_up() {
    let (channel, _peer, _clock) = negotiated_raw_pair(sync_config(true));
    channel.sync_vmclock(0, 5 * QUANTUM);
    assert_eq!(channel.normalized_clk(), QUANTUM);

    channel.sync_vmclock(QUANTUM, QUANTUM / 2);
    assert_eq!(channel.normalized_clk(), QUANTUM);

    assert!(channel.set_time_warp(false));
    assert!(!channel.time_warp());
    channel.sync_vmclock(QUANTUM, 2 * QUANTUM);
    assert_eq!(channel.normalized_clk(), QUANTUM);
    assert_eq!(channel.stats().warps, 1);
    channel.shutdown();
}

/// `run` keeps answering deferred requests as local time advances.
#[test]
fn run_drives_deferred_answers() {
    let (channel, mut peer, clock) = negotiated_raw_pair(sync_config(false));
    let consumer = {
        let channel = std::sync::Arc::clone(&channel);
        thread::spawn(move || channel.run())
    };
    let ts = QUANTUM / 2 + 3 * QUANTUM;
    let id = send_sync(&mut peer, ts);
    assert!(wait_until(|| channel.has_deferred_sync()));

    clock.set(CLOCK_START + ts);
    expect_sync_response(&mut peer, id, ts);

    channel.shutdown();
    assert!(matches!(consumer.join().unwrap(), rport_core::Error::Shutdown));
}
