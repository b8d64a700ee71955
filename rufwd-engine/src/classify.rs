//! Locally-served address classification
//!
//! Reverse lookups for addresses in these networks never leave the local
//! resolver set, following the RFC 6303 list of locally served zones.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// Decides whether an address belongs to a locally served network
pub trait SubnetClassifier: Send + Sync {
    fn is_locally_served(&self, ip: IpAddr) -> bool;
}

const LOCALLY_SERVED: [&str; 12] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "100.64.0.0/10",
    "0.0.0.0/8",
    "255.255.255.255/32",
    "::1/128",
    "::/128",
    "fe80::/10",
    "fc00::/7",
];

/// Private, loopback and link-local ranges plus any configured extras
#[derive(Debug, Clone)]
pub struct LocallyServedNetworks {
    nets: Vec<IpNet>,
}

impl LocallyServedNetworks {
    /// The standard ranges only
    pub fn new() -> Self {
        Self {
            nets: LOCALLY_SERVED
                .iter()
                .filter_map(|net| net.parse().ok())
                .collect(),
        }
    }

    /// The standard ranges plus `extra`, given in CIDR notation
    pub fn with_networks<S: AsRef<str>>(extra: &[S]) -> Result<Self> {
        let mut classifier = Self::new();
        for net in extra {
            let net = net.as_ref();
            let parsed = net
                .parse::<IpNet>()
                .map_err(|e| Error::InvalidConfig(format!("invalid local network {:?}: {}", net, e)))?;
            classifier.nets.push(parsed.trunc());
        }
        Ok(classifier)
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.nets
    }
}

impl Default for LocallyServedNetworks {
    fn default() -> Self {
        Self::new()
    }
}

impl SubnetClassifier for LocallyServedNetworks {
    fn is_locally_served(&self, ip: IpAddr) -> bool {
        let ip = unmap(ip);
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

/// IPv4 form of an IPv4-mapped IPv6 address, other addresses unchanged
///
/// Dual-stack sockets report IPv4 peers as `::ffff:a.b.c.d`.
pub(crate) fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn served(ip: &str) -> bool {
        LocallyServedNetworks::new().is_locally_served(ip.parse().unwrap())
    }

    #[test]
    fn test_all_default_ranges_parse() {
        assert_eq!(LocallyServedNetworks::new().networks().len(), LOCALLY_SERVED.len());
    }

    #[test]
    fn test_private_ranges() {
        assert!(served("192.168.1.5"));
        assert!(served("10.20.30.40"));
        assert!(served("172.31.255.1"));
        assert!(served("127.0.0.1"));
        assert!(served("169.254.10.1"));
        assert!(served("100.100.0.1"));
        assert!(served("fd00::1"));
        assert!(served("fe80::1"));
        assert!(served("::1"));
        assert!(served("::ffff:192.168.0.1"));
    }

    #[test]
    fn test_public_ranges() {
        assert!(!served("8.8.8.8"));
        assert!(!served("172.32.0.1"));
        assert!(!served("2001:4860:4860::8888"));
    }

    #[test]
    fn test_extra_networks() {
        let classifier = LocallyServedNetworks::with_networks(&["203.0.113.0/24"]).unwrap();
        assert!(classifier.is_locally_served("203.0.113.9".parse().unwrap()));
        assert!(!classifier.is_locally_served("203.0.114.9".parse().unwrap()));

        assert!(LocallyServedNetworks::with_networks(&["not a net"]).is_err());
    }
}
