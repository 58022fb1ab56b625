//! Socket endpoint descriptors: `unix:<path>` or `tcp:<host>:<port>`.

use std::fmt;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use rport_core::Channel;
use rport_core::clock::VirtualClock;
use rport_core::config::ChannelConfig;

/// Where a peer listens or connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain stream socket.
    Unix(PathBuf),
    /// TCP socket, `host:port`.
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("unix", path)) if !path.is_empty() => Ok(Self::Unix(PathBuf::from(path))),
            Some(("tcp", addr)) if addr.contains(':') => Ok(Self::Tcp(addr.to_owned())),
            _ => Err(format!("`{s}` is not unix:<path> or tcp:<host>:<port>")),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

impl Endpoint {
    /// Waits for one peer on this endpoint and wraps the connection in a channel.
    pub fn accept(&self, name: &str, config: ChannelConfig, clock: Arc<dyn VirtualClock>) -> rport_core::Result<Arc<Channel>> {
        match self {
            Self::Unix(path) => {
                let (stream, _) = UnixListener::bind(path)?.accept()?;
                Channel::new(name, config, stream, clock)
            }
            Self::Tcp(addr) => {
                let (stream, _) = TcpListener::bind(addr.as_str())?.accept()?;
                stream.set_nodelay(true)?;
                Channel::new(name, config, stream, clock)
            }
        }
    }

    /// Connects to a listening peer.
    pub fn connect(&self, name: &str, config: ChannelConfig, clock: Arc<dyn VirtualClock>) -> rport_core::Result<Arc<Channel>> {
        match self {
            Self::Unix(path) => Channel::new(name, config, UnixStream::connect(path)?, clock),
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())?;
                stream.set_nodelay(true)?;
                Channel::new(name, config, stream, clock)
            }
        }
    }
}

/// Parses a number in decimal or `0x` hexadecimal.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("`{s}`: {e}"))
}
