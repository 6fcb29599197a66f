use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

/// Identity of a remote device. Two peers are the same iff host and port both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: Ipv4Addr, port: u16) -> Self {
        Self { host, port }
    }

    /// Devices are IPv4 only; v4-mapped v6 addresses (dual-stack sockets) are unwrapped.
    pub fn from_socket(addr: SocketAddr) -> Option<Self> {
        match addr.ip() {
            IpAddr::V4(host) => Some(Self::new(host, addr.port())),
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(|host| Self::new(host, addr.port())),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A device that answered a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub address: PeerAddress,
    pub label: String,
    pub last_reply_payload: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Parse a user-entered dotted-quad IPv4 address.
pub fn parse_ipv4(raw: &str) -> LinkResult<Ipv4Addr> {
    static PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(?:\d{1,3}\.){3}\d{1,3}$").unwrap());
    let trimmed = raw.trim();
    if !PATTERN.is_match(trimmed) {
        return Err(LinkError::InvalidAddress(raw.to_string()));
    }
    trimmed
        .parse::<Ipv4Addr>()
        .map_err(|_| LinkError::InvalidAddress(raw.to_string()))
}
