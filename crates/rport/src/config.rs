//! Configuration for channels and the bundled devices.
//!
//! This module defines all configuration structures used to parameterize a
//! Remote-Port session. It provides:
//! 1. **Defaults:** Baseline values for sync, ring sizing, device limits and bridges.
//! 2. **Structures:** Hierarchical config for the channel, memory master, GPIO bridge and RAM.
//! 3. **Loading:** JSON deserialization and validation.
//!
//! Every field may be omitted from JSON; missing fields take their defaults.

use serde::Deserialize;

use crate::common::ConfigError;
use crate::common::constants::{BUSACCESS_EXT_SIZE, MAX_GPIOS, PAYLOAD_HEADROOM};
use crate::proto::caps::{Capabilities, Capability};

/// Default configuration constants.
mod defaults {
    use super::{BUSACCESS_EXT_SIZE, PAYLOAD_HEADROOM};

    /// Periodic virtual-time synchronization is off unless asked for.
    pub const SYNC: bool = false;

    /// Sync quantum in nanoseconds (1 ms).
    ///
    /// Neither peer may run further ahead of the other than this.
    pub const SYNC_QUANTUM_NS: u64 = 1_000_000;

    /// Clock warping toward the peer's time while idle.
    pub const TIME_WARP: bool = true;

    /// Receive ring slots. Must be a power of two.
    pub const RX_QUEUE_LEN: usize = 128;

    /// Logical devices per channel.
    pub const MAX_DEVS: usize = 34;

    /// Outstanding per-device transactions.
    pub const MAX_OUTSTANDING: usize = 32;

    /// Initial receive and response buffer size.
    pub const PACKET_CAPACITY: usize = BUSACCESS_EXT_SIZE + PAYLOAD_HEADROOM;

    /// GPIO lines per bridge.
    pub const NUM_GPIOS: u32 = 16;

    /// GPIO updates are posted (fire and forget).
    pub const POSTED_UPDATES: bool = true;

    /// RAM window size served by the demo peer (16 MiB).
    pub const RAM_SIZE: usize = 16 * 1024 * 1024;
}

/// Root configuration.
///
/// # Examples
///
/// ```
/// use rport_core::config::Config;
///
/// let json = r#"{
///     "channel": { "sync": true, "sync_quantum_ns": 10000, "capabilities": ["bus_access_ext_base"] },
///     "gpio": { "num_gpios": 8, "posted_updates": false }
/// }"#;
///
/// let config = Config::from_json(json).unwrap();
/// assert!(config.channel.sync);
/// assert_eq!(config.channel.sync_quantum_ns, 10_000);
/// assert_eq!(config.gpio.num_gpios, 8);
/// assert_eq!(config.master.offset, 0);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Channel engine settings.
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Memory master address mapping.
    #[serde(default)]
    pub master: MasterConfig,
    /// GPIO bridge settings.
    #[serde(default)]
    pub gpio: GpioConfig,
    /// RAM served by a memory slave.
    #[serde(default)]
    pub ram: RamConfig,
}

impl Config {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Json`] on malformed input, [`ConfigError::Invalid`] if a
    /// value fails validation.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// As [`Config::from_json`], plus [`ConfigError::Io`] if the file cannot be read.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Checks every section.
    ///
    /// # Errors
    ///
    /// The first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate()?;
        self.gpio.validate()?;
        self.ram.validate()
    }
}

/// Channel engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Run the periodic sync handshake.
    #[serde(default = "ChannelConfig::default_sync")]
    pub sync: bool,

    /// Maximum lead of either peer, in ns.
    #[serde(default = "ChannelConfig::default_sync_quantum_ns")]
    pub sync_quantum_ns: u64,

    /// Allow warping the local clock toward the peer when idle.
    #[serde(default = "ChannelConfig::default_time_warp")]
    pub time_warp: bool,

    /// Receive ring slots (power of two, at least 2).
    #[serde(default = "ChannelConfig::default_rx_queue_len")]
    pub rx_queue_len: usize,

    /// Device table size; packets for higher indices are dropped.
    #[serde(default = "ChannelConfig::default_max_devs")]
    pub max_devs: usize,

    /// Per-device response slots.
    #[serde(default = "ChannelConfig::default_max_outstanding")]
    pub max_outstanding: usize,

    /// Initial size of each receive and response buffer.
    #[serde(default = "ChannelConfig::default_packet_capacity")]
    pub initial_packet_capacity: usize,

    /// Capabilities advertised in Hello.
    #[serde(default = "ChannelConfig::default_capabilities")]
    pub capabilities: Vec<Capability>,
}

impl ChannelConfig {
    fn default_sync() -> bool {
        defaults::SYNC
    }

    fn default_sync_quantum_ns() -> u64 {
        defaults::SYNC_QUANTUM_NS
    }

    fn default_time_warp() -> bool {
        defaults::TIME_WARP
    }

    fn default_rx_queue_len() -> usize {
        defaults::RX_QUEUE_LEN
    }

    fn default_max_devs() -> usize {
        defaults::MAX_DEVS
    }

    fn default_max_outstanding() -> usize {
        defaults::MAX_OUTSTANDING
    }

    fn default_packet_capacity() -> usize {
        defaults::PACKET_CAPACITY
    }

    fn default_capabilities() -> Vec<Capability> {
        Capability::ALL.to_vec()
    }

    /// Advertised capabilities as a flag set.
    pub fn local_caps(&self) -> Capabilities {
        Capabilities::from_list(&self.capabilities)
    }

    /// Checks ring sizing and limits.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rx_queue_len < 2 || !self.rx_queue_len.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "channel.rx_queue_len",
                reason: format!("{} is not a power of two >= 2", self.rx_queue_len),
            });
        }
        if self.max_devs == 0 {
            return Err(ConfigError::Invalid {
                field: "channel.max_devs",
                reason: "at least one device index is required".into(),
            });
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::Invalid {
                field: "channel.max_outstanding",
                reason: "at least one response slot is required".into(),
            });
        }
        if self.sync && self.sync_quantum_ns == 0 {
            return Err(ConfigError::Invalid {
                field: "channel.sync_quantum_ns",
                reason: "quantum must be non-zero when sync is enabled".into(),
            });
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            sync: defaults::SYNC,
            sync_quantum_ns: defaults::SYNC_QUANTUM_NS,
            time_warp: defaults::TIME_WARP,
            rx_queue_len: defaults::RX_QUEUE_LEN,
            max_devs: defaults::MAX_DEVS,
            max_outstanding: defaults::MAX_OUTSTANDING,
            initial_packet_capacity: defaults::PACKET_CAPACITY,
            capabilities: Self::default_capabilities(),
        }
    }
}

/// Memory master address mapping.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MasterConfig {
    /// Send window-relative addresses instead of adding `offset`.
    #[serde(default)]
    pub relative: bool,
    /// Base address of the local window on the peer's bus.
    #[serde(default)]
    pub offset: u64,
}

/// GPIO bridge settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GpioConfig {
    /// Number of lines.
    #[serde(default = "GpioConfig::default_num_gpios")]
    pub num_gpios: u32,
    /// Send line updates as posted packets.
    #[serde(default = "GpioConfig::default_posted_updates")]
    pub posted_updates: bool,
}

impl GpioConfig {
    fn default_num_gpios() -> u32 {
        defaults::NUM_GPIOS
    }

    fn default_posted_updates() -> bool {
        defaults::POSTED_UPDATES
    }

    /// Checks the line count.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the line count exceeds the bridge limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_gpios > MAX_GPIOS {
            return Err(ConfigError::Invalid {
                field: "gpio.num_gpios",
                reason: format!("{} exceeds the limit of {MAX_GPIOS}", self.num_gpios),
            });
        }
        Ok(())
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            num_gpios: defaults::NUM_GPIOS,
            posted_updates: defaults::POSTED_UPDATES,
        }
    }
}

/// RAM window served by a memory slave.
#[derive(Debug, Clone, Deserialize)]
pub struct RamConfig {
    /// Bus address of the first byte.
    #[serde(default)]
    pub base: u64,
    /// Size in bytes.
    #[serde(default = "RamConfig::default_size")]
    pub size: usize,
}

impl RamConfig {
    fn default_size() -> usize {
        defaults::RAM_SIZE
    }

    /// Checks the window size.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for an empty window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::Invalid {
                field: "ram.size",
                reason: "window must not be empty".into(),
            });
        }
        Ok(())
    }
}

impl Default for RamConfig {
    fn default() -> Self {
        Self { base: 0, size: defaults::RAM_SIZE }
    }
}
