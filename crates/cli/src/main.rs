//! Stand-alone Remote-Port peer.
//!
//! This binary provides three modes:
//! 1. **Serve:** Listen for one simulator, expose RAM behind a memory slave
//!    (and optionally a GPIO bridge), run until the peer disconnects, then
//!    print channel statistics as JSON.
//! 2. **Peek:** Connect to a peer and read from its bus through a memory master.
//! 3. **Poke:** Connect to a peer and write a value to its bus.

mod endpoint;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use rport_core::channel::ChannelState;
use rport_core::clock::HostClock;
use rport_core::config::Config;
use rport_core::devices::{Gpio, IrqSink, MemoryMaster, MemorySlave};
use rport_core::memory::{MemAttrs, RamTarget};
use rport_core::stats::StatsSnapshot;
use rport_core::{Channel, Error};

use endpoint::{Endpoint, parse_u64};

#[derive(Parser, Debug)]
#[command(
    name = "rport-peer",
    author,
    version,
    about = "Remote-Port co-simulation peer",
    long_about = "Serve RAM to a co-simulation peer, or peek and poke a peer's bus.\n\nEndpoints are unix:<path> or tcp:<host>:<port>.\n\nExamples:\n  rport-peer serve unix:/tmp/rp.sock --ram-size 0x100000\n  rport-peer poke unix:/tmp/rp.sock 0x1000 0xdeadbeef\n  rport-peer peek unix:/tmp/rp.sock 0x1000 --size 4"
)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept one peer and serve RAM until it disconnects.
    Serve {
        /// Endpoint to listen on.
        endpoint: Endpoint,

        /// Device index of the memory slave.
        #[arg(long, default_value_t = 1)]
        dev: u32,

        /// RAM size in bytes (overrides the configuration).
        #[arg(long, value_parser = parse_u64)]
        ram_size: Option<u64>,

        /// Device index of a GPIO bridge; none if unset.
        #[arg(long)]
        gpio_dev: Option<u32>,
    },

    /// Read from the peer's bus.
    Peek {
        /// Endpoint to connect to.
        endpoint: Endpoint,

        /// Bus address.
        #[arg(value_parser = parse_u64)]
        addr: u64,

        /// Access size in bytes.
        #[arg(short, long, default_value_t = 4)]
        size: u32,

        /// Device index of the peer's memory slave.
        #[arg(long, default_value_t = 1)]
        dev: u32,
    },

    /// Write a little-endian value to the peer's bus.
    Poke {
        /// Endpoint to connect to.
        endpoint: Endpoint,

        /// Bus address.
        #[arg(value_parser = parse_u64)]
        addr: u64,

        /// Value to write.
        #[arg(value_parser = parse_u64)]
        value: u64,

        /// Access size in bytes (1 to 8).
        #[arg(short, long, default_value_t = 4)]
        size: u32,

        /// Device index of the peer's memory slave.
        #[arg(long, default_value_t = 1)]
        dev: u32,
    },
}

/// Printed when a served session ends.
#[derive(Serialize)]
struct SessionSummary {
    endpoint: String,
    reason: String,
    stats: StatsSnapshot,
}

/// Logs inbound line changes.
struct LogIrq;

impl IrqSink for LogIrq {
    fn set_irq(&self, line: u32, level: bool) {
        info!(line, level, "irq");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path).unwrap_or_else(|e| fail(&format!("{}: {e}", path.display()))),
        None => Config::default(),
    };

    let result = match cli.command {
        Commands::Serve { endpoint, dev, ram_size, gpio_dev } => cmd_serve(config, &endpoint, dev, ram_size, gpio_dev),
        Commands::Peek { endpoint, addr, size, dev } => cmd_peek(config, &endpoint, addr, size, dev),
        Commands::Poke { endpoint, addr, value, size, dev } => cmd_poke(config, &endpoint, addr, value, size, dev),
    };
    if let Err(e) = result {
        fail(&e.to_string());
    }
}

fn fail(msg: &str) -> ! {
    eprintln!("rport-peer: {msg}");
    process::exit(1);
}

/// Accepts a peer, serves RAM at `dev` and blocks until the session ends.
fn cmd_serve(
    mut config: Config,
    endpoint: &Endpoint,
    dev: u32,
    ram_size: Option<u64>,
    gpio_dev: Option<u32>,
) -> rport_core::Result<()> {
    if let Some(size) = ram_size {
        config.ram.size = usize::try_from(size).unwrap_or(usize::MAX);
        config.validate()?;
    }
    info!(%endpoint, "waiting for peer");
    let channel = endpoint.accept("serve", config.channel.clone(), Arc::new(HostClock::new()))?;

    let ram = Arc::new(RamTarget::new(config.ram.base, config.ram.size));
    channel.attach(dev, Arc::new(MemorySlave::new(ram)))?;
    if let Some(gpio_dev) = gpio_dev {
        let gpio = Gpio::new(&channel, gpio_dev, config.gpio.clone(), Arc::new(LogIrq));
        channel.attach(gpio_dev, Arc::new(gpio))?;
    }
    channel.start()?;

    let reason = match channel.run() {
        Error::Disconnected => "peer disconnected".to_owned(),
        other => {
            warn!(error = %other, "session ended");
            other.to_string()
        }
    };
    let summary = SessionSummary { endpoint: endpoint.to_string(), reason, stats: channel.stats() };
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "cannot print session summary"),
    }
    channel.shutdown();
    Ok(())
}

/// Connects and waits for the peer's Hello so the bus layout is known.
fn connect(config: &Config, endpoint: &Endpoint) -> rport_core::Result<Arc<Channel>> {
    let channel = endpoint.connect("client", config.channel.clone(), Arc::new(HostClock::new()))?;
    channel.start()?;
    while channel.peer().negotiated().is_none() {
        if let ChannelState::Terminated(_) = channel.state() {
            return Err(Error::Disconnected);
        }
        let _ = channel.wait_for_work(std::time::Duration::from_millis(10));
        let _ = channel.process();
    }
    Ok(channel)
}

fn cmd_peek(config: Config, endpoint: &Endpoint, addr: u64, size: u32, dev: u32) -> rport_core::Result<()> {
    let channel = connect(&config, endpoint)?;
    let master = MemoryMaster::new(Arc::clone(&channel), dev, config.master);
    let rsp = master.read(addr, size, MemAttrs::default())?;
    channel.shutdown();

    let hex: Vec<String> = rsp.data.iter().map(|b| format!("{b:02x}")).collect();
    println!("{addr:#x}: {} ({:?})", hex.join(" "), rsp.resp);
    if rsp.is_ok() { Ok(()) } else { fail(&format!("read failed: {:?}", rsp.resp)) }
}

fn cmd_poke(config: Config, endpoint: &Endpoint, addr: u64, value: u64, size: u32, dev: u32) -> rport_core::Result<()> {
    if !(1..=8).contains(&size) {
        fail("poke size must be between 1 and 8 bytes");
    }
    let channel = connect(&config, endpoint)?;
    let master = MemoryMaster::new(Arc::clone(&channel), dev, config.master);
    let bytes = value.to_le_bytes();
    let rsp = master.write(addr, &bytes[..size as usize], MemAttrs::default())?;
    channel.shutdown();

    println!("{addr:#x} <- {value:#x} ({:?})", rsp.resp);
    if rsp.is_ok() { Ok(()) } else { fail(&format!("write failed: {:?}", rsp.resp)) }
}
