use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rport_core::buffer::DynPacket;
use rport_core::channel::Channel;
use rport_core::clock::ManualClock;
use rport_core::common::constants::HEADER_SIZE;
use rport_core::config::ChannelConfig;
use rport_core::proto::codec;
use rport_core::proto::header::Command;
use rport_core::proto::packet::{Body, Version};

/// Generous upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Clock value channels start at, so normalization is exercised.
pub const CLOCK_START: u64 = 1_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small ring so backpressure is easy to reach.
pub fn test_config() -> ChannelConfig {
    ChannelConfig { rx_queue_len: 8, ..ChannelConfig::default() }
}

/// Polls `cond` until it holds or [`TIMEOUT`] passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Runs a channel's consumer side on a background thread.
pub struct Pump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Pump {
    pub fn start(channel: &Arc<Channel>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let channel = Arc::clone(channel);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) && !channel.is_terminated() {
                let _ = channel.wait_for_work(Duration::from_millis(5));
                let _ = channel.process();
            }
        });
        Self { stop, handle: Some(handle) }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Two started channels connected by a socket pair.
pub struct Pair {
    pub a: Arc<Channel>,
    pub b: Arc<Channel>,
    pub clock_a: Arc<ManualClock>,
    pub clock_b: Arc<ManualClock>,
}

impl Pair {
    pub fn new(config_a: ChannelConfig, config_b: ChannelConfig) -> Self {
        init_tracing();
        let (sa, sb) = UnixStream::pair().unwrap();
        let clock_a = Arc::new(ManualClock::new(CLOCK_START));
        let clock_b = Arc::new(ManualClock::new(CLOCK_START));
        let a = Channel::new("a", config_a, sa, clock_a.clone()).unwrap();
        let b = Channel::new("b", config_b, sb, clock_b.clone()).unwrap();
        Self { a, b, clock_a, clock_b }
    }

    /// Starts both channels and waits until each has seen the other's Hello.
    pub fn start(&self) {
        self.a.start().unwrap();
        self.b.start().unwrap();
        assert!(wait_until(|| self.a.peer().negotiated().is_some() && self.b.peer().negotiated().is_some()));
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.a.shutdown();
        self.b.shutdown();
    }
}

/// The far end of a channel, driven packet by packet from the test.
pub struct RawPeer {
    stream: UnixStream,
    next_id: u32,
}

impl RawPeer {
    /// Reads one packet and decodes it.
    pub fn recv(&mut self) -> DynPacket {
        let mut pkt = DynPacket::with_capacity(HEADER_SIZE);
        self.stream.read_exact(&mut pkt.as_mut_bytes()[..HEADER_SIZE]).unwrap();
        let hdr = codec::decode_header(pkt.as_bytes()).unwrap();
        let size = hdr.packet_size();
        pkt.ensure_capacity(size);
        self.stream.read_exact(&mut pkt.as_mut_bytes()[HEADER_SIZE..size]).unwrap();
        let _ = pkt.decode().unwrap();
        pkt
    }

    /// Reads one packet and checks its command.
    pub fn expect(&mut self, cmd: Command) -> DynPacket {
        let pkt = self.recv();
        assert_eq!(pkt.header().unwrap().command(), Some(cmd));
        pkt
    }

    /// Writes the first `len` bytes of `pkt`.
    pub fn send(&mut self, pkt: &DynPacket, len: usize) {
        self.stream.write_all(&pkt.as_bytes()[..len]).unwrap();
    }

    pub fn id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn send_hello(&mut self, caps: &[u32]) {
        let mut pkt = DynPacket::new();
        let id = self.id();
        let len = codec::encode_hello_caps(&mut pkt, id, 0, Version::CURRENT, caps);
        self.send(&pkt, len);
    }

    /// Timestamp of a decoded Sync packet.
    pub fn sync_timestamp(pkt: &DynPacket) -> u64 {
        match pkt.packet().map(|p| &p.body) {
            Some(Body::Sync(sync)) => sync.timestamp,
            other => panic!("not a sync packet: {other:?}"),
        }
    }

    pub fn close(self) {
        drop(self.stream);
    }
}

/// A started channel whose peer is a [`RawPeer`]. The channel's Hello has
/// already been consumed; the peer's Hello has not been sent.
pub fn raw_pair(config: ChannelConfig) -> (Arc<Channel>, RawPeer, Arc<ManualClock>) {
    init_tracing();
    let (ours, theirs) = UnixStream::pair().unwrap();
    theirs.set_read_timeout(Some(TIMEOUT)).unwrap();
    let clock = Arc::new(ManualClock::new(CLOCK_START));
    let channel = Channel::new("dut", config, ours, clock.clone()).unwrap();
    channel.start().unwrap();
    let mut peer = RawPeer { stream: theirs, next_id: 1000 };
    let _ = peer.expect(Command::Hello);
    (channel, peer, clock)
}

/// As [`raw_pair`], with the peer's Hello (all capabilities) sent and negotiated.
pub fn negotiated_raw_pair(config: ChannelConfig) -> (Arc<Channel>, RawPeer, Arc<ManualClock>) {
    let (channel, mut peer, clock) = raw_pair(config);
    peer.send_hello(&[1, 2, 3, 4]);
    assert!(wait_until(|| channel.peer().negotiated().is_some()));
    (channel, peer, clock)
}

/// Processes handed-over packets until `done` holds.
pub fn process_until(channel: &Channel, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        let _ = channel.process();
        if done() {
            return true;
        }
        let _ = channel.wait_for_work(Duration::from_millis(5));
    }
    done()
}
