//! GPIO bridge: interrupt lines in both directions.
//!
//! Outbound, [`Gpio::set_line`] sends an interrupt packet when a line changes
//! level. Inbound interrupt packets drive an [`IrqSink`].
//!
//! Updates are posted when `posted_updates` is set. Otherwise, if the peer
//! negotiated wire-posted updates, each update waits for its acknowledgement.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::buffer::DynPacket;
use crate::channel::Channel;
use crate::common::{ConfigError, Error, Result, lock};
use crate::config::GpioConfig;
use crate::device::{CommandSet, RemotePortDevice};
use crate::proto::codec;
use crate::proto::header::{Command, FLAG_POSTED, FLAG_RESPONSE};
use crate::proto::packet::{Body, Interrupt};

/// Receiver of inbound line changes.
pub trait IrqSink: Send + Sync {
    /// Line `line` is now at `level`.
    fn set_irq(&self, line: u32, level: bool);
}

/// Interrupt-line bridge at one device index.
pub struct Gpio {
    dev: u32,
    channel: Weak<Channel>,
    config: GpioConfig,
    levels: Mutex<Vec<Option<bool>>>,
    irq: Arc<dyn IrqSink>,
}

impl Gpio {
    /// Creates the bridge for device index `dev` on `channel`.
    ///
    /// Every line starts with an unknown level, so the first update of each
    /// line is always sent.
    pub fn new(channel: &Arc<Channel>, dev: u32, config: GpioConfig, irq: Arc<dyn IrqSink>) -> Self {
        Self {
            dev,
            channel: Arc::downgrade(channel),
            levels: Mutex::new(vec![None; config.num_gpios as usize]),
            config,
            irq,
        }
    }

    /// Drives output line `line` to `level`.
    ///
    /// Does nothing if the line is already at that level.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a line outside the bridge, [`Error::Shutdown`] if
    /// the channel is gone, or channel failures while sending.
    pub fn set_line(&self, line: u32, level: bool) -> Result<()> {
        {
            let mut levels = lock(&self.levels);
            let Some(cached) = levels.get_mut(line as usize) else {
                return Err(Error::Config(ConfigError::Invalid {
                    field: "gpio line",
                    reason: format!("{line} is outside the {} lines of the bridge", self.config.num_gpios),
                }));
            };
            if *cached == Some(level) {
                return Ok(());
            }
            *cached = Some(level);
        }
        let channel = self.channel.upgrade().ok_or(Error::Shutdown)?;

        let flags = if self.config.posted_updates { FLAG_POSTED } else { 0 };
        let irq = Interrupt { timestamp: channel.normalized_clk(), vector: 0, line, val: u8::from(level) };
        let mut pkt = DynPacket::new();
        let size = codec::encode_interrupt(&mut pkt, channel.new_id(), self.dev, &irq, flags);
        debug!(channel = channel.name(), dev = self.dev, line, level, posted = self.config.posted_updates, "gpio out");

        if channel.peer().caps().wire_posted_updates && !self.config.posted_updates {
            drop(channel.device_request(self.dev, &pkt, size)?);
            Ok(())
        } else {
            channel.write(&pkt.as_bytes()[..size])
        }
    }

    /// Last level sent on `line`, if any.
    pub fn line_level(&self, line: u32) -> Option<bool> {
        lock(&self.levels).get(line as usize).copied().flatten()
    }
}

impl RemotePortDevice for Gpio {
    fn name(&self) -> &str {
        "gpio"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::empty().with(Command::Interrupt)
    }

    fn handle(&self, channel: &Channel, pkt: &DynPacket) -> Result<()> {
        let Some((hdr, irq)) = pkt.packet().and_then(|p| match p.body {
            Body::Interrupt(irq) => Some((p.header, irq)),
            _ => None,
        }) else {
            return Ok(());
        };
        if irq.line < self.config.num_gpios {
            self.irq.set_irq(irq.line, irq.val != 0);
        } else {
            warn!(dev = self.dev, line = irq.line, "gpio: interrupt for a line outside the bridge");
        }
        debug!(dev = self.dev, line = irq.line, val = irq.val, "gpio in");

        if !channel.peer().caps().wire_posted_updates || hdr.is_posted() {
            return Ok(());
        }
        let mut out = DynPacket::new();
        let size = codec::encode_interrupt(&mut out, hdr.id, hdr.dev, &irq, hdr.flags | FLAG_RESPONSE);
        channel.write(&out.as_bytes()[..size])
    }
}

impl fmt::Debug for Gpio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpio").field("dev", &self.dev).field("config", &self.config).finish_non_exhaustive()
    }
}
