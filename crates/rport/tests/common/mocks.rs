use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use mockall::mock;
use rport_core::ats::{InvalidateSink, IommuTranslator, Perms, Translation};
use rport_core::buffer::DynPacket;
use rport_core::channel::Channel;
use rport_core::common::{BusError, Result};
use rport_core::device::{CommandSet, RemotePortDevice};
use rport_core::devices::IrqSink;
use rport_core::memory::{BusTarget, MemAttrs};
use rport_core::proto::header::Header;

mock! {
    pub Sink {}
    impl InvalidateSink for Sink {
        fn invalidate(&mut self, iova: u64, len: u64) -> Result<()>;
    }
}

/// Device that records the header of every packet dispatched to it.
pub struct RecordingDevice {
    commands: CommandSet,
    seen: Mutex<Vec<Header>>,
}

impl RecordingDevice {
    pub fn new(commands: CommandSet) -> Self {
        Self { commands, seen: Mutex::new(Vec::new()) }
    }

    pub fn seen(&self) -> Vec<Header> {
        self.seen.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.seen().iter().map(|h| h.id).collect()
    }
}

impl RemotePortDevice for RecordingDevice {
    fn name(&self) -> &str {
        "recorder"
    }

    fn commands(&self) -> CommandSet {
        self.commands
    }

    fn handle(&self, _channel: &Channel, pkt: &DynPacket) -> Result<()> {
        self.seen.lock().unwrap().push(*pkt.header().unwrap());
        Ok(())
    }
}

/// IRQ sink that records line changes.
#[derive(Default)]
pub struct RecordingIrq {
    events: Mutex<Vec<(u32, bool)>>,
}

impl RecordingIrq {
    pub fn events(&self) -> Vec<(u32, bool)> {
        self.events.lock().unwrap().clone()
    }
}

impl IrqSink for RecordingIrq {
    fn set_irq(&self, line: u32, level: bool) {
        self.events.lock().unwrap().push((line, level));
    }
}

/// Identity-offset IOMMU: every iova maps to `base | iova` within a
/// `window`-sized, window-aligned page, and counts calls.
pub struct CountingTranslator {
    pub base: u64,
    pub window: u64,
    pub target_as: u32,
    pub perms: Perms,
    calls: AtomicUsize,
}

impl CountingTranslator {
    pub fn new(base: u64, window: u64, target_as: u32) -> Self {
        Self { base, window, target_as, perms: Perms { read: true, write: true }, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IommuTranslator for CountingTranslator {
    fn translate(&self, iova: u64, _attrs: u64) -> Option<Translation> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        let page_end = (iova | (self.window - 1)) + 1;
        Some(Translation {
            translated_addr: self.base | iova,
            len: page_end - iova,
            target_as: self.target_as,
            perms: self.perms,
        })
    }
}

/// Target that rejects every access.
pub struct FailingTarget(pub BusError);

impl BusTarget for FailingTarget {
    fn read(&self, _addr: u64, _buf: &mut [u8], _attrs: MemAttrs) -> Result<(), BusError> {
        Err(self.0)
    }

    fn write(&self, _addr: u64, _data: &[u8], _attrs: MemAttrs) -> Result<(), BusError> {
        Err(self.0)
    }
}
