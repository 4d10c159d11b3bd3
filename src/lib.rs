//! edgeprobe — CDN edge endpoint prober.
//!
//! Probes candidate `(address, port)` endpoints over reused TCP/TLS
//! connections, reads the edge network's trace document with a raw HTTP/1.1
//! exchange, classifies each endpoint by outbound address family and
//! data-center location, and buckets the accepted endpoints by country.
//! Usable as a library or via the CLI.

pub mod aggregate;
pub mod classify;
pub mod cli;
pub mod engine;
pub mod input;
pub mod net;
pub mod probe;
pub mod summary;

#[cfg(test)]
mod test_support;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Re-export key types for library users.
pub use aggregate::{group_by_country, number_groups, NumberedOutput};
pub use classify::{classify, LocationTable, RejectReason};
pub use engine::{
    BatchReport, BatchScheduler, CounterSnapshot, PipelineError, ProbeConfig, ProbeCounters, Prober,
};
pub use net::pool::{ConnectionPool, PoolConfig, PoolLease, PoolStats};
pub use net::socket::SocketError;
pub use probe::http::ProbeError;
pub use probe::trace::{extract_fields, TraceFields};
pub use summary::RunSummary;

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// A candidate `(address, port)` pair.
///
/// The address is always a literal; nothing is ever resolved. The display
/// form (`1.2.3.4:443`, `[2606:4700::1]:443`) doubles as the pool key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Literal IP address.
    pub address: IpAddr,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Parse `"1.2.3.4:443"` or `"[2606:4700::1]:443"`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        s.parse::<SocketAddr>()
            .map(|addr| Self::new(addr.ip(), addr.port()))
            .map_err(|_| format!("invalid endpoint: '{s}'"))
    }

    /// Build an endpoint from separate address and port columns.
    pub fn from_parts(address: &str, port: &str) -> Result<Self, String> {
        let address = address
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| format!("invalid address: '{}'", address.trim()))?;
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid port: '{}'", port.trim()))?;
        Ok(Self::new(address, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Family of the dialed address (not the outbound address).
    pub fn ip_version(&self) -> IpVersion {
        IpVersion::of(&self.address)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Address family policy
// ─────────────────────────────────────────────────────────────────────────────

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    Ipv4,
    Ipv6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which outbound address families are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpPolicy {
    /// Accept both families.
    Any,
    /// Accept IPv4 outbound addresses only.
    #[default]
    V4Only,
    /// Accept IPv6 outbound addresses only.
    V6Only,
}

impl IpPolicy {
    pub fn allows(&self, version: IpVersion) -> bool {
        match self {
            Self::Any => true,
            Self::V4Only => version == IpVersion::Ipv4,
            Self::V6Only => version == IpVersion::Ipv6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::V4Only => "v4-only",
            Self::V6Only => "v6-only",
        }
    }
}

impl fmt::Display for IpPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Location reference data
// ─────────────────────────────────────────────────────────────────────────────

/// What a location (IATA) code maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Country name or code used as the grouping key.
    pub country: String,
    /// Flag emoji prefixed to output lines.
    pub emoji: String,
    /// Region label (informational).
    #[serde(default)]
    pub region: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Probe results
// ─────────────────────────────────────────────────────────────────────────────

/// An endpoint that answered with a known location and an allowed family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedProbe {
    /// The dialed endpoint.
    pub endpoint: Endpoint,
    /// Outbound address reported by the edge.
    pub outbound_ip: IpAddr,
    /// Location code (`colo`) reported by the edge.
    pub location_code: String,
    /// Country from the location table.
    pub country: String,
    /// Flag emoji from the location table.
    pub emoji: String,
    /// Region from the location table.
    pub region: String,
    /// Family of the outbound address.
    pub ip_version: IpVersion,
    /// When the result was produced.
    pub observed_at: DateTime<Utc>,
}

/// Outcome of one endpoint's exchange after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Accepted(AcceptedProbe),
    Rejected(RejectReason),
}

impl ProbeResult {
    pub fn accepted(self) -> Option<AcceptedProbe> {
        match self {
            Self::Accepted(probe) => Some(probe),
            Self::Rejected(_) => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
