//! # Packet Buffer Tests
//!
//! Validity tracking, invalidation and storage recycling of [`DynPacket`].

use rport_core::buffer::DynPacket;
use rport_core::common::constants::{HEADER_SIZE, SYNC_SIZE};
use rport_core::proto::codec;
use rport_core::proto::header::Command;

/// Invalidating twice leaves the buffer invalid and keeps its storage.
#[test]
fn invalidate_is_idempotent() {
    let mut pkt = DynPacket::new();
    let _ = codec::encode_sync(&mut pkt, 1, 0, 42);
    assert!(pkt.is_valid());
    let capacity = pkt.capacity();

    pkt.invalidate();
    assert!(!pkt.is_valid());
    assert_eq!(pkt.stored_len(), 0);
    pkt.invalidate();
    assert!(!pkt.is_valid());
    assert_eq!(pkt.capacity(), capacity);
    assert!(pkt.packet().is_none());
}

/// A header with a zero length field reads as invalid even though storage exists.
#[test]
fn zero_length_header_is_invalid() {
    let mut pkt = DynPacket::new();
    let _ = codec::encode_hdr(&mut pkt, Command::Nop, 0, 5, 0, 0);
    assert_eq!(pkt.capacity(), HEADER_SIZE);
    assert!(!pkt.is_valid());
}

/// Swapping exchanges storage and decoded state together.
#[test]
fn swap_moves_storage_and_decoding() {
    let mut a = DynPacket::with_capacity(512);
    let mut b = DynPacket::new();
    let _ = codec::encode_sync(&mut b, 9, 2, 100);
    let _ = b.decode().unwrap();

    DynPacket::swap(&mut a, &mut b);

    assert_eq!(a.header().map(|h| h.id), Some(9));
    assert_eq!(a.packet_bytes().len(), SYNC_SIZE);
    assert!(b.packet().is_none());
    assert_eq!(b.capacity(), 512);
    assert!(!b.is_valid());
}

/// Writing through the mutable view drops the cached decoding.
#[test]
fn mutation_clears_decoding() {
    let mut pkt = DynPacket::new();
    let _ = codec::encode_sync(&mut pkt, 1, 0, 7);
    let _ = pkt.decode().unwrap();
    assert!(pkt.header().is_some());
    pkt.as_mut_bytes()[0] = 0;
    assert!(pkt.header().is_none());
}

/// Payload accessors return nothing for non-busaccess packets.
#[test]
fn payload_accessors_on_other_commands() {
    let mut pkt = DynPacket::new();
    let _ = codec::encode_sync(&mut pkt, 1, 0, 7);
    let _ = pkt.decode().unwrap();
    assert!(pkt.bus_data().is_none());
    assert!(pkt.capabilities().is_none());
}
