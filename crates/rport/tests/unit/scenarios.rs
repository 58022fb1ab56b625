//! # End-to-End Scenarios
//!
//! Two full channels talking to each other: memory traffic in both
//! directions, interrupt lines with acknowledgements, translation with
//! invalidation, and a synchronization round.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use rport_core::ats::{AtsClient, AtsDevice, UnmapListener};
use rport_core::clock::VirtualClock;
use rport_core::config::{ChannelConfig, GpioConfig, MasterConfig};
use rport_core::devices::{Gpio, MemoryMaster, MemorySlave};
use rport_core::memory::{MemAttrs, RamTarget};
use rport_core::proto::packet::ats_attr;

use crate::common::harness::{CLOCK_START, Pair, Pump, test_config, wait_until};
use crate::common::mocks::{CountingTranslator, RecordingIrq};

/// Both sides act as master and slave at the same time.
#[test]
fn memory_both_directions() {
    let pair = Pair::new(test_config(), test_config());
    let ram_a = Arc::new(RamTarget::new(0, 0x1000));
    let ram_b = Arc::new(RamTarget::new(0, 0x1000));
    pair.a.attach(1, Arc::new(MemorySlave::new(ram_a.clone()))).unwrap();
    pair.b.attach(1, Arc::new(MemorySlave::new(ram_b.clone()))).unwrap();
    pair.start();
    let _pump_a = Pump::start(&pair.a);
    let _pump_b = Pump::start(&pair.b);

    let to_b = MemoryMaster::new(pair.a.clone(), 1, MasterConfig::default());
    let to_a = MemoryMaster::new(pair.b.clone(), 1, MasterConfig::default());
    let worker = std::thread::spawn(move || {
        for i in 0..32u64 {
            assert!(to_a.write(i * 8, &i.to_le_bytes(), MemAttrs::default()).unwrap().is_ok());
        }
    });
    for i in 0..32u64 {
        assert!(to_b.write(i * 8, &(i << 8).to_le_bytes(), MemAttrs { secure: true, master_id: 7 }).unwrap().is_ok());
    }
    worker.join().unwrap();

    assert_eq!(to_b.read(31 * 8, 8, MemAttrs::default()).unwrap().value_le(), 31 << 8);
    assert_eq!(ram_a.dump(5 * 8, 8).unwrap(), 5u64.to_le_bytes().to_vec());
    assert!(pair.a.stats().tx_packets >= 33);
}

/// Non-posted line updates are acknowledged by the receiving bridge.
#[test]
fn interrupt_lines_with_acks() {
    let pair = Pair::new(test_config(), test_config());
    let irq_b = Arc::new(RecordingIrq::default());
    let config = GpioConfig { num_gpios: 4, posted_updates: false };
    let gpio_a = Gpio::new(&pair.a, 5, config.clone(), Arc::new(RecordingIrq::default()));
    let gpio_b = Arc::new(Gpio::new(&pair.b, 5, config, irq_b.clone()));
    pair.b.attach(5, gpio_b).unwrap();
    pair.start();
    let _pump_b = Pump::start(&pair.b);

    gpio_a.set_line(0, true).unwrap();
    gpio_a.set_line(3, true).unwrap();
    gpio_a.set_line(0, false).unwrap();
    assert_eq!(irq_b.events(), vec![(0, true), (3, true), (0, false)]);
}

/// A translation is fetched once, then served from the cache until the
/// server unmaps it.
#[test]
fn translation_and_invalidation() {
    const DEV: u32 = 2;
    let pair = Pair::new(test_config(), test_config());
    let translator = Arc::new(CountingTranslator::new(0x8000_0000, 0x1000, 0));
    let server = Arc::new(AtsDevice::new(&pair.b, DEV, translator.clone()));
    let client = Arc::new(AtsClient::new(DEV));
    pair.b.attach(DEV, server.clone()).unwrap();
    pair.a.attach(DEV, client.clone()).unwrap();
    pair.start();
    let _pump_a = Pump::start(&pair.a);
    let _pump_b = Pump::start(&pair.b);

    let rw = ats_attr::READ | ats_attr::WRITE;
    let first = client.translate(&pair.a, 0x2000, 0x1000, rw).unwrap().unwrap();
    assert_eq!(first.translated_addr, 0x8000_2000);
    assert_eq!(first.len, 0x1000);
    assert!(!first.from_cache);

    let second = client.translate(&pair.a, 0x2100, 0x100, rw).unwrap().unwrap();
    assert!(second.from_cache);
    assert_eq!(second.translated_addr, 0x8000_2100);
    assert_eq!(second.len, 0xF00);
    assert_eq!(translator.calls(), 1);
    assert_eq!(server.entries().len(), 1);

    server.unmap_notify(0x2000, 0xFFF).unwrap();
    assert!(server.entries().is_empty());
    assert!(client.entries().is_empty());

    let third = client.translate(&pair.a, 0x2100, 0x100, rw).unwrap().unwrap();
    assert!(!third.from_cache);
    assert_eq!(translator.calls(), 2);
}

/// A sync round pulls an idle peer forward by one quantum.
#[test]
fn sync_round_warps_idle_peer() {
    const QUANTUM: u64 = 50_000;
    let config = ChannelConfig { sync: true, sync_quantum_ns: QUANTUM, time_warp: true, ..test_config() };
    let pair = Pair::new(config.clone(), config);
    pair.start();
    let _pump_b = Pump::start(&pair.b);

    let _ = pair.clock_a.advance(QUANTUM);
    pair.a.poll_sync().unwrap();
    assert_eq!(pair.a.stats().sync_rounds, 1);
    assert!(wait_until(|| pair.b.normalized_clk() == QUANTUM));
    assert_eq!(pair.clock_b.now_ns(), CLOCK_START + QUANTUM);
    assert_eq!(pair.a.sync_deadline(), Some(2 * QUANTUM));
}
