//! Host network facts: interface addresses and system resolvers

use std::net::IpAddr;
use std::path::PathBuf;

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};

use crate::error::{Error, Result};

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Source of interface addresses and the host's configured resolvers
pub trait HostNetwork: Send + Sync {
    /// Every address assigned to a local interface
    fn interface_addrs(&self) -> Result<Vec<IpAddr>>;

    /// Resolvers the operating system is configured with, as `ip` or `ip:port`
    fn system_resolvers(&self) -> Result<Vec<String>>;
}

/// The real host
#[derive(Debug, Clone)]
pub struct OsNetwork {
    resolv_conf: PathBuf,
}

impl OsNetwork {
    pub fn new() -> Self {
        Self {
            resolv_conf: PathBuf::from(RESOLV_CONF),
        }
    }

    /// Read resolvers from another resolv.conf
    pub fn with_resolv_conf(path: impl Into<PathBuf>) -> Self {
        Self {
            resolv_conf: path.into(),
        }
    }
}

impl Default for OsNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl HostNetwork for OsNetwork {
    fn interface_addrs(&self) -> Result<Vec<IpAddr>> {
        let interfaces = NetworkInterface::show()
            .map_err(|e| Error::Io(std::io::Error::other(format!("failed to list interfaces: {}", e))))?;

        let addrs = interfaces
            .into_iter()
            .flat_map(|iface| iface.addr)
            .map(|addr| match addr {
                Addr::V4(v4) => IpAddr::V4(v4.ip),
                Addr::V6(v6) => IpAddr::V6(v6.ip),
            })
            .collect();

        Ok(addrs)
    }

    fn system_resolvers(&self) -> Result<Vec<String>> {
        match std::fs::read_to_string(&self.resolv_conf) {
            Ok(content) => Ok(parse_resolv_conf(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("{} not found, no system resolvers", self.resolv_conf.display());
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Nameserver addresses from resolv.conf content
///
/// Scoped IPv6 addresses (`fe80::1%eth0`) lose their zone; anything that is
/// not an IP address is skipped.
pub fn parse_resolv_conf(content: &str) -> Vec<String> {
    let mut servers = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let mut parts = line.split_whitespace();
        if parts.next() != Some("nameserver") {
            continue;
        }

        let Some(server) = parts.next() else {
            continue;
        };
        let server = server.split('%').next().unwrap_or(server);

        match server.parse::<IpAddr>() {
            Ok(ip) => servers.push(ip.to_string()),
            Err(_) => log::debug!("Skipping nameserver {:?} in resolv.conf", server),
        }
    }

    servers
}
