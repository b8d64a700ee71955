//! Upstream server specifications
//!
//! Accepted formats:
//! - `IP`, `IP:port`, `IP[:port]/udp` - plain DNS over UDP
//! - `IP[:port]/tcp` - plain DNS over TCP
//! - `https://...` - DNS over HTTPS (DoH)
//! - `tls://host[:port]` - DNS over TLS (DoT)

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Port used by plain DNS
pub const DNS_PORT: u16 = 53;

/// Port used by DNS over TLS
pub const DOT_PORT: u16 = 853;

/// Strategy for selecting upstream DNS servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamStrategy {
    /// Query all upstreams in parallel, use the first successful response
    #[default]
    FirstReply,

    /// Select upstreams in round-robin order
    RoundRobin,

    /// Select a random upstream for each query
    Random,
}

impl UpstreamStrategy {
    /// Get a human-readable description of this strategy
    pub fn description(&self) -> &'static str {
        match self {
            UpstreamStrategy::FirstReply => "first-reply (parallel queries)",
            UpstreamStrategy::RoundRobin => "round-robin",
            UpstreamStrategy::Random => "random",
        }
    }
}

impl std::fmt::Display for UpstreamStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamStrategy::FirstReply => write!(f, "first-reply"),
            UpstreamStrategy::RoundRobin => write!(f, "round-robin"),
            UpstreamStrategy::Random => write!(f, "random"),
        }
    }
}

impl FromStr for UpstreamStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "first-reply" | "firstreply" => Ok(UpstreamStrategy::FirstReply),
            "round-robin" | "roundrobin" => Ok(UpstreamStrategy::RoundRobin),
            "random" => Ok(UpstreamStrategy::Random),
            _ => Err(Error::Config(format!(
                "unknown upstream strategy '{}', expected 'first-reply', 'round-robin', or 'random'",
                s
            ))),
        }
    }
}

/// Specification for an upstream DNS server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsServerSpec {
    /// Plain DNS over UDP
    Udp { addr: SocketAddr },

    /// Plain DNS over TCP
    Tcp { addr: SocketAddr },

    /// DNS over HTTPS
    Doh { url: String },

    /// DNS over TLS
    Dot { hostname: String, port: u16 },
}

impl DnsServerSpec {
    /// Get a human-readable description of this server type
    pub fn server_type(&self) -> &'static str {
        match self {
            DnsServerSpec::Udp { .. } => "UDP",
            DnsServerSpec::Tcp { .. } => "TCP",
            DnsServerSpec::Doh { .. } => "DoH",
            DnsServerSpec::Dot { .. } => "DoT",
        }
    }

    /// Socket address of a plain DNS server, `None` for encrypted ones
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            DnsServerSpec::Udp { addr } | DnsServerSpec::Tcp { addr } => Some(*addr),
            DnsServerSpec::Doh { .. } | DnsServerSpec::Dot { .. } => None,
        }
    }
}

impl std::fmt::Display for DnsServerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsServerSpec::Udp { addr } => write!(f, "{}/udp", addr),
            DnsServerSpec::Tcp { addr } => write!(f, "{}/tcp", addr),
            DnsServerSpec::Doh { url } => write!(f, "{}", url),
            DnsServerSpec::Dot { hostname, port } if *port == DOT_PORT => {
                write!(f, "tls://{}", hostname)
            }
            DnsServerSpec::Dot { hostname, port } => write!(f, "tls://{}:{}", hostname, port),
        }
    }
}

impl FromStr for DnsServerSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_dns_server(s)
    }
}

/// Parse a DNS server specification string
///
/// - `8.8.8.8`, `8.8.8.8:5353`, `8.8.8.8/udp` - UDP
/// - `8.8.8.8/tcp`, `[2001:db8::1]:53/tcp` - TCP
/// - `https://dns10.quad9.net/dns-query` - DoH
/// - `tls://dns.google`, `tls://dns.google:8853` - DoT
pub fn parse_dns_server(s: &str) -> Result<DnsServerSpec> {
    let s = s.trim();

    if s.starts_with("https://") {
        return Ok(DnsServerSpec::Doh { url: s.to_string() });
    }

    if let Some(rest) = s.strip_prefix("tls://") {
        let (hostname, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') => match port.parse::<u16>() {
                Ok(port) => (host.trim_matches(|c| c == '[' || c == ']'), port),
                Err(_) => (rest, DOT_PORT),
            },
            _ => (rest, DOT_PORT),
        };

        if hostname.is_empty() {
            return Err(Error::Config("empty hostname in DoT URL".into()));
        }

        return Ok(DnsServerSpec::Dot {
            hostname: hostname.to_string(),
            port,
        });
    }

    let (addr, tcp) = match s.rsplit_once('/') {
        Some((addr, proto)) => match proto.to_lowercase().as_str() {
            "udp" => (addr, false),
            "tcp" => (addr, true),
            _ => {
                return Err(Error::Config(format!(
                    "unknown DNS protocol '{}', expected 'udp' or 'tcp'",
                    proto
                )))
            }
        },
        None => (s, false),
    };

    let addr = parse_socket_addr(addr, DNS_PORT)?;
    if tcp {
        Ok(DnsServerSpec::Tcp { addr })
    } else {
        Ok(DnsServerSpec::Udp { addr })
    }
}

/// Parse `ip`, `ip:port`, `[ipv6]` or `[ipv6]:port`
pub fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let bare = s.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    // IPv4 with a port that did not parse as a socket address
    if let Some((ip, port)) = s.rsplit_once(':') {
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", ip, e)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("invalid port '{}': {}", port, e)))?;
        return Ok(SocketAddr::new(ip, port));
    }

    Err(Error::Config(format!("cannot parse DNS server address '{}'", s)))
}
