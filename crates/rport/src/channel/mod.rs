//! Remote-Port channel engine.
//!
//! A [`Channel`] owns one transport connection to a peer. It provides:
//! 1. **Receive thread:** Reads packets, answers Hello and fast-path Sync,
//!    routes responses to waiting requesters and hands everything else to the
//!    consumer through a bounded ring.
//! 2. **Consumer side:** [`Channel::process`] drains the ring and dispatches
//!    packets to attached devices in arrival order.
//! 3. **Requests:** Serialized writes, fresh packet ids and blocking waits for
//!    the matching response (session-wide or per device).
//! 4. **Time sync:** Periodic sync rounds, deferred replies and clock warps
//!    (see the `sync` submodule).
//!
//! Protocol violations are fatal: [`Channel::fatal`] logs, terminates the
//! channel and panics. Transport failures terminate the channel and surface
//! as [`Error::Disconnected`] to every waiter.

mod queue;
mod response;
mod rx;
mod sync;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::buffer::DynPacket;
use crate::clock::VirtualClock;
use crate::common::constants::CFG_OPT_QUANTUM;
use crate::common::{Error, ProtocolError, Result, lock, read, wait_timeout, write};
use crate::config::ChannelConfig;
use crate::device::{DeviceTable, RemotePortDevice};
use crate::event::EventNotifier;
use crate::peer::PeerState;
use crate::proto::codec;
use crate::proto::header::{Command, FLAG_POSTED, FLAG_RESPONSE, Header};
use crate::proto::packet::{Body, Cfg, Version};
use crate::stats::{ChannelStats, StatsSnapshot};
use crate::transport::Transport;

use queue::RxRing;
pub use response::{Response, ResponseGuard};
use response::ResponseState;
use sync::SyncState;

/// How long blocked waiters sleep before re-checking for termination.
const TERMINATION_POLL: Duration = Duration::from_millis(50);

/// Why a channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The transport failed or the peer closed it.
    Disconnected,
    /// [`Channel::shutdown`] was called.
    Shutdown,
    /// A protocol violation was detected.
    Protocol(ProtocolError),
}

impl Termination {
    fn to_error(&self) -> Error {
        match self {
            Self::Disconnected => Error::Disconnected,
            Self::Shutdown => Error::Shutdown,
            Self::Protocol(e) => Error::Protocol(e.clone()),
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, Hello not sent yet.
    Connecting,
    /// Hello sent, receive thread running.
    Established,
    /// Stopped; every pending and future wait fails.
    Terminated(Termination),
}

/// One connection to a Remote-Port peer.
pub struct Channel {
    name: String,
    config: ChannelConfig,
    transport: Box<dyn Transport>,
    clock: Arc<dyn VirtualClock>,
    peer: PeerState,
    next_id: AtomicU32,
    write_lock: Mutex<()>,
    responses: Mutex<ResponseState>,
    progress: Condvar,
    ring: RxRing,
    events: EventNotifier,
    devices: RwLock<DeviceTable>,
    sync: Mutex<SyncState>,
    time_warp: AtomicBool,
    established: AtomicBool,
    terminated: AtomicBool,
    termination: Mutex<Option<Termination>>,
    stats: ChannelStats,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Creates a channel over `transport`. Nothing is sent until [`Channel::start`].
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in logs and the receive thread name.
    /// * `config` - Validated channel settings.
    /// * `transport` - Connected byte stream to the peer.
    /// * `clock` - Local virtual time; read once here for the session clock base.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `config` fails validation, [`Error::Io`] if the
    /// event pipe cannot be created.
    pub fn new<T: Transport + 'static>(
        name: impl Into<String>,
        config: ChannelConfig,
        transport: T,
        clock: Arc<dyn VirtualClock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let name = name.into();
        let clk_base = clock.now_ns();
        let peer = PeerState::new(config.local_caps(), clk_base, config.sync_quantum_ns);
        let responses = ResponseState::new(
            config.max_devs,
            config.max_outstanding,
            config.initial_packet_capacity,
        );
        debug!(
            channel = %name,
            rx_queue_len = config.rx_queue_len,
            max_devs = config.max_devs,
            sync = config.sync,
            quantum_ns = config.sync_quantum_ns,
            "channel created"
        );
        Ok(Arc::new(Self {
            ring: RxRing::new(config.rx_queue_len, config.initial_packet_capacity),
            devices: RwLock::new(DeviceTable::new(config.max_devs)),
            time_warp: AtomicBool::new(config.time_warp),
            events: EventNotifier::new()?,
            name,
            transport: Box::new(transport),
            clock,
            peer,
            next_id: AtomicU32::new(0),
            write_lock: Mutex::new(()),
            responses: Mutex::new(responses),
            progress: Condvar::new(),
            sync: Mutex::new(SyncState::default()),
            established: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            termination: Mutex::new(None),
            stats: ChannelStats::default(),
            rx_thread: Mutex::new(None),
            config,
        }))
    }

    /// Sends Hello and starts the receive thread.
    ///
    /// Calling it again after a successful start is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::Disconnected`] if Hello cannot be written, [`Error::Io`] if the
    /// thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut rx_thread = lock(&self.rx_thread);
        if rx_thread.is_some() {
            return Ok(());
        }
        self.say_hello()?;
        self.established.store(true, Ordering::Release);

        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("rport-rx:{}", self.name))
            .spawn(move || this.rx_loop())?;
        *rx_thread = Some(handle);
        drop(rx_thread);

        self.restart_sync_timer();
        info!(channel = %self.name, "channel established");
        Ok(())
    }

    fn say_hello(&self) -> Result<()> {
        let mut pkt = DynPacket::new();
        let caps = self.peer.local_caps().to_codes();
        let len = codec::encode_hello_caps(&mut pkt, self.new_id(), 0, Version::CURRENT, &caps);
        debug!(channel = %self.name, caps = ?caps, "sending hello");
        self.write(&pkt.as_bytes()[..len])
    }

    /// Channel label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings the channel was created with.
    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// What is known about the peer.
    pub const fn peer(&self) -> &PeerState {
        &self.peer
    }

    /// Local clock.
    pub fn clock(&self) -> &dyn VirtualClock {
        self.clock.as_ref()
    }

    /// Current local virtual time in session time.
    pub fn normalized_clk(&self) -> u64 {
        self.peer.normalize(self.clock.now_ns())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ChannelState {
        if let Some(reason) = self.termination() {
            ChannelState::Terminated(reason)
        } else if self.established.load(Ordering::Acquire) {
            ChannelState::Established
        } else {
            ChannelState::Connecting
        }
    }

    /// True once the channel stopped for any reason.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn termination(&self) -> Option<Termination> {
        if !self.is_terminated() {
            return None;
        }
        lock(&self.termination).clone()
    }

    fn check_alive(&self) -> Result<()> {
        match self.termination() {
            Some(reason) => Err(reason.to_error()),
            None => Ok(()),
        }
    }

    /// Records why the channel stopped (first reason wins) and wakes everyone.
    fn terminate(&self, reason: Termination) {
        {
            let mut slot = lock(&self.termination);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.terminated.store(true, Ordering::Release);
        self.ring.free.close();
        self.events.notify();
        self.progress.notify_all();
    }

    /// Returns a fresh packet id. Ids wrap at `u32::MAX`.
    pub fn new_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Writes one encoded packet. Concurrent writers never interleave.
    ///
    /// # Errors
    ///
    /// The termination reason if the channel already stopped;
    /// [`Error::Disconnected`] if the transport write fails, which also
    /// terminates the channel.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.check_alive()?;
        let _serialized = lock(&self.write_lock);
        match self.transport.send_all(bytes) {
            Ok(()) => {
                self.stats.record_tx(bytes.len());
                if let Ok(hdr) = codec::decode_header(bytes) {
                    trace!(
                        channel = %self.name,
                        cmd = Command::name_of(hdr.cmd),
                        id = hdr.id,
                        dev = hdr.dev,
                        flags = hdr.flags,
                        len = hdr.len,
                        "tx"
                    );
                }
                Ok(())
            }
            Err(e) => {
                error!(channel = %self.name, error = %e, "transport write failed");
                self.terminate(Termination::Disconnected);
                Err(Error::Disconnected)
            }
        }
    }

    /// Sends a request and waits for its response in the session slot.
    ///
    /// `pkt` must hold an encoded request of `len` bytes.
    ///
    /// # Errors
    ///
    /// As [`Channel::write`] and [`Channel::wait_response`].
    pub fn request(&self, pkt: &DynPacket, len: usize) -> Result<Response<'_>> {
        let bytes = &pkt.as_bytes()[..len];
        let id = codec::decode_header(bytes)?.id;
        let guard = self.lock_session();
        self.write(bytes)?;
        self.wait_response(guard, id)
    }

    /// Sends a request and waits for its response in a slot of device `dev`.
    ///
    /// # Errors
    ///
    /// As [`Channel::write`] and [`Channel::wait_device_response`].
    pub fn device_request(&self, dev: u32, pkt: &DynPacket, len: usize) -> Result<Response<'_>> {
        let bytes = &pkt.as_bytes()[..len];
        let id = codec::decode_header(bytes)?.id;
        let guard = self.lock_responses();
        self.write(bytes)?;
        self.wait_device_response(guard, dev, id)
    }

    /// Attaches `device` at table index `index`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `index` is outside the device table.
    pub fn attach(&self, index: u32, device: Arc<dyn RemotePortDevice>) -> Result<()> {
        let name = device.name().to_owned();
        let replaced = write(&self.devices).attach(index, device)?;
        if let Some(old) = replaced {
            warn!(channel = %self.name, index, old = old.name(), new = %name, "device replaced");
        } else {
            info!(channel = %self.name, index, device = %name, "device attached");
        }
        Ok(())
    }

    /// Detaches and returns the device at `index`.
    pub fn detach(&self, index: u32) -> Option<Arc<dyn RemotePortDevice>> {
        let device = write(&self.devices).detach(index);
        if let Some(dev) = &device {
            info!(channel = %self.name, index, device = dev.name(), "device detached");
        }
        device
    }

    /// Device attached at `index`.
    pub fn device(&self, index: u32) -> Option<Arc<dyn RemotePortDevice>> {
        read(&self.devices).get(index).cloned()
    }

    /// Announces a session option to the peer (posted Cfg).
    ///
    /// # Errors
    ///
    /// As [`Channel::write`].
    pub fn send_cfg(&self, opt: u32, set: u8) -> Result<()> {
        let mut pkt = DynPacket::new();
        let len = codec::encode_cfg(&mut pkt, self.new_id(), 0, Cfg { opt, set }, FLAG_POSTED);
        self.write(&pkt.as_bytes()[..len])
    }

    /// Packets waiting in the ring.
    pub fn pending(&self) -> usize {
        lock(&self.responses).pending()
    }

    /// Packets the ring holds before the receive thread blocks.
    pub const fn ring_capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Ring slots currently free.
    pub fn ring_free(&self) -> usize {
        self.ring.free.available()
    }

    /// Descriptor that becomes readable when [`Channel::process`] has work.
    #[cfg(unix)]
    pub const fn event_fd(&self) -> std::os::fd::RawFd {
        self.events.as_raw_fd()
    }

    /// Blocks until the ring has work, the channel stops, or `timeout` passes.
    ///
    /// Returns true if work is pending.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let st = lock(&self.responses);
        if st.has_work() || self.is_terminated() {
            return st.has_work();
        }
        wait_timeout(&self.progress, st, timeout).has_work()
    }

    /// Dispatches every packet waiting in the ring, in arrival order.
    ///
    /// Safe to call re-entrantly from a device handler that is itself waiting
    /// for a response. Returns the number of packets handled.
    pub fn process(&self) -> usize {
        self.events.drain();
        let mut handled = 0;
        loop {
            let pos = {
                let mut st = lock(&self.responses);
                if !st.has_work() {
                    break;
                }
                st.take_read_pos()
            };
            {
                let mut slot = lock(self.ring.slot(pos));
                self.dispatch(&slot);
                slot.invalidate();
            }
            self.ring.free.release();
            handled += 1;
        }
        handled
    }

    /// Consumer loop for owners without their own event loop.
    ///
    /// Processes work and drives time sync until the channel stops, then
    /// returns the reason.
    pub fn run(&self) -> Error {
        loop {
            let _ = self.wait_for_work(TERMINATION_POLL);
            let _ = self.process();
            if let Err(e) = self.poll_sync() {
                return e;
            }
            if let Err(e) = self.check_alive() {
                let _ = self.process();
                return e;
            }
        }
    }

    fn dispatch(&self, pkt: &DynPacket) {
        let Some(hdr) = pkt.header().copied() else {
            return;
        };
        let Some(cmd) = hdr.command() else {
            return;
        };
        match cmd {
            Command::Sync => self.handle_sync_request(pkt),
            Command::Cfg => self.handle_cfg(&hdr, pkt),
            _ => self.dispatch_to_device(&hdr, cmd, pkt),
        }
    }

    fn dispatch_to_device(&self, hdr: &Header, cmd: Command, pkt: &DynPacket) {
        let device = read(&self.devices).get(hdr.dev).cloned();
        let Some(device) = device else {
            self.fatal(ProtocolError::NoDevice { dev: hdr.dev, cmd: cmd.name() });
        };
        if !device.commands().contains(cmd) {
            self.fatal(ProtocolError::UnhandledCommand {
                dev: hdr.dev,
                name: device.name().to_owned(),
                cmd: cmd.name(),
            });
        }
        trace!(channel = %self.name, device = device.name(), %cmd, id = hdr.id, "dispatch");
        if let Err(e) = device.handle(self, pkt) {
            warn!(channel = %self.name, device = device.name(), %cmd, error = %e, "device handler failed");
        }
    }

    fn handle_cfg(&self, hdr: &Header, pkt: &DynPacket) {
        let Some(Body::Cfg(cfg)) = pkt.packet().map(|p| &p.body) else {
            self.fatal(ProtocolError::Malformed { cmd: "cfg" });
        };
        let cfg = *cfg;
        self.peer.set_peer_option(cfg.opt, cfg.set);
        if cfg.opt == CFG_OPT_QUANTUM {
            debug!(channel = %self.name, set = cfg.set, "peer announced quantum option");
        } else {
            debug!(channel = %self.name, opt = cfg.opt, set = cfg.set, "peer option");
        }
        if hdr.is_posted() {
            return;
        }
        let mut rsp = DynPacket::new();
        let len = codec::encode_cfg(&mut rsp, hdr.id, hdr.dev, cfg, hdr.flags | FLAG_RESPONSE);
        if let Err(e) = self.write(&rsp.as_bytes()[..len]) {
            warn!(channel = %self.name, error = %e, "cfg response not sent");
        }
    }

    /// Reports a protocol violation and stops the process.
    ///
    /// Logs the violation, terminates the channel so other waiters fail,
    /// shuts the transport down and panics. Must not be called while holding a
    /// [`ResponseGuard`] or [`Response`].
    pub fn fatal(&self, err: ProtocolError) -> ! {
        error!(channel = %self.name, error = %err, "fatal protocol violation");
        self.terminate(Termination::Protocol(err.clone()));
        let _ = self.transport.shutdown();
        panic!("{}: fatal protocol violation: {err}", self.name);
    }

    /// Stops the channel: fails pending waits, closes the transport, joins
    /// the receive thread and detaches every device.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.is_terminated() {
            info!(channel = %self.name, "shutting down");
        }
        self.terminate(Termination::Shutdown);
        if let Err(e) = self.transport.shutdown() {
            debug!(channel = %self.name, error = %e, "transport shutdown");
        }
        let handle = lock(&self.rx_thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(channel = %self.name, "receive thread panicked");
            }
        }
        write(&self.devices).clear();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("peer", &self.peer)
            .field("devices", &*read(&self.devices))
            .finish_non_exhaustive()
    }
}
