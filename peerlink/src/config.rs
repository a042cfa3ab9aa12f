//! Node configuration.
use std::{fmt, str::FromStr, time::Duration};

use crate::error::Error;

/// Reconnect delay of outbound links.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(20);
/// Heartbeat period of outbound links.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Silence after which an inbound link is considered dead.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(20);

/// The timers driving peer links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reconnect_interval: RECONNECT_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            idle_timeout: PEER_TIMEOUT,
        }
    }
}

/// The address of another node's peer listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidPeerAddr(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidPeerAddr(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidPeerAddr(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the peer listener binds to.
    pub listen: String,
    /// Nodes to keep an outbound link to.
    pub peers: Vec<PeerAddr>,
    pub timing: Timing,
}

impl Config {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            peers: Vec::new(),
            timing: Timing::default(),
        }
    }

    pub fn peer(mut self, addr: PeerAddr) -> Self {
        self.peers.push(addr);
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }
}
