//! Client access lists and blocked hostnames

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::classify::unmap;
use crate::error::{Error, Result};

/// Why a client was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// An allow list exists and the client is not on it
    NotAllowed,
    /// The client matched this disallowed entry
    Disallowed(String),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::NotAllowed => write!(f, "not in allowed clients"),
            BlockReason::Disallowed(rule) => write!(f, "disallowed by {}", rule),
        }
    }
}

#[derive(Debug, Clone)]
struct ClientRule {
    text: String,
    net: IpNet,
}

#[derive(Debug, Clone)]
enum HostRule {
    Exact(String),
    /// `*.example.org`, stored as `example.org`
    Subdomains(String),
}

/// Parsed allow, deny and blocked-host lists
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: Vec<ClientRule>,
    disallowed: Vec<ClientRule>,
    blocked_hosts: Vec<HostRule>,
}

impl AccessPolicy {
    /// Client entries are IPs or CIDRs; host entries are names or `*.name`
    pub fn new(allowed: &[String], disallowed: &[String], blocked_hosts: &[String]) -> Result<Self> {
        Ok(Self {
            allowed: parse_clients(allowed, "allowed")?,
            disallowed: parse_clients(disallowed, "disallowed")?,
            blocked_hosts: blocked_hosts.iter().filter_map(|h| parse_host(h)).collect(),
        })
    }

    /// Reason to refuse `ip`, `None` when it may query
    pub fn blocked_ip(&self, ip: IpAddr) -> Option<BlockReason> {
        let ip = unmap(ip);
        if !self.allowed.is_empty() {
            return if self.allowed.iter().any(|r| r.net.contains(&ip)) {
                None
            } else {
                Some(BlockReason::NotAllowed)
            };
        }

        self.disallowed
            .iter()
            .find(|r| r.net.contains(&ip))
            .map(|r| BlockReason::Disallowed(r.text.clone()))
    }

    /// Whether `host` is never forwarded upstream
    pub fn is_blocked_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        self.blocked_hosts.iter().any(|rule| match rule {
            HostRule::Exact(name) => *name == host,
            HostRule::Subdomains(parent) => host
                .strip_suffix(parent.as_str())
                .is_some_and(|prefix| prefix.ends_with('.')),
        })
    }
}

fn parse_clients(entries: &[String], list: &str) -> Result<Vec<ClientRule>> {
    entries
        .iter()
        .map(|text| {
            let text = text.trim();
            let net = match text.parse::<IpAddr>() {
                Ok(ip) => IpNet::from(unmap(ip)),
                Err(_) => text.parse::<IpNet>().map_err(|e| {
                    Error::InvalidConfig(format!("invalid {} client {:?}: {}", list, text, e))
                })?,
            };
            Ok(ClientRule {
                text: text.to_string(),
                net: net.trunc(),
            })
        })
        .collect()
}

fn parse_host(entry: &str) -> Option<HostRule> {
    let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
    if entry.is_empty() {
        return None;
    }

    match entry.strip_prefix("*.") {
        Some(parent) if !parent.is_empty() => Some(HostRule::Subdomains(parent.to_string())),
        Some(_) => None,
        None => Some(HostRule::Exact(entry)),
    }
}
