//! Hostnames of DHCP clients under a local top-level label

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One DHCP lease, reduced to what the name tables need
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Short hostname reported by the client, without any suffix
    pub hostname: String,
    pub ip: IpAddr,
}

impl Lease {
    pub fn new(hostname: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            hostname: hostname.into(),
            ip,
        }
    }
}

/// Kind of lease change delivered by the DHCP side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    Added,
    Updated,
    Removed,
    RemovedAll,
}

/// `.<label>.`, appended to short hostnames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutohostSuffix(String);

impl AutohostSuffix {
    pub fn new(label: &str) -> Result<Self> {
        if !is_valid_label(label) {
            return Err(Error::InvalidAutohostTld(label.to_string()));
        }
        Ok(Self(format!(".{}.", label.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AutohostSuffix {
    fn default() -> Self {
        Self(format!(".{}.", crate::config::DEFAULT_AUTOHOST_TLD))
    }
}

impl fmt::Display for AutohostSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single DNS label: 1 to 63 letters, digits or hyphens, no hyphen at either end
fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

#[derive(Debug, Default)]
struct Indexes {
    host_to_ip: HashMap<String, IpAddr>,
    ip_to_host: HashMap<IpAddr, String>,
}

/// Host-to-IP and IP-to-host indexes built from the lease set
///
/// Both indexes live under one lock and are replaced in the same write, so a
/// reader never sees one updated without the other.
#[derive(Debug, Default)]
pub struct AutohostTable {
    suffix: AutohostSuffix,
    indexes: RwLock<Indexes>,
}

impl AutohostTable {
    pub fn new(suffix: AutohostSuffix) -> Self {
        Self {
            suffix,
            indexes: RwLock::new(Indexes::default()),
        }
    }

    pub fn suffix(&self) -> &AutohostSuffix {
        &self.suffix
    }

    /// Apply a lease change notification carrying the current lease set
    pub fn apply(&self, event: LeaseEvent, leases: &[Lease]) {
        let fresh = match event {
            LeaseEvent::RemovedAll => Indexes::default(),
            LeaseEvent::Added | LeaseEvent::Updated | LeaseEvent::Removed => build_indexes(leases),
        };

        let count = fresh.host_to_ip.len();
        match self.indexes.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }

        log::debug!("Autohost table rebuilt on {:?}: {} hosts", event, count);
    }

    /// Address of `qname` when it is `<host><suffix>`, case-insensitive
    pub fn ip_for_host(&self, qname: &str) -> Option<IpAddr> {
        let qname = qname.to_ascii_lowercase();
        let qname = if qname.ends_with('.') { qname } else { format!("{}.", qname) };
        let host = qname.strip_suffix(self.suffix.as_str())?;
        if host.is_empty() || host.contains('.') {
            return None;
        }

        let guard = match self.indexes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.host_to_ip.get(host).copied()
    }

    /// Fully-qualified `<host><suffix>` for a leased address
    pub fn host_for_ip(&self, ip: IpAddr) -> Option<String> {
        let guard = match self.indexes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .ip_to_host
            .get(&ip)
            .map(|host| format!("{}{}", host, self.suffix))
    }

    pub fn len(&self) -> usize {
        match self.indexes.read() {
            Ok(guard) => guard.host_to_ip.len(),
            Err(poisoned) => poisoned.into_inner().host_to_ip.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_indexes(leases: &[Lease]) -> Indexes {
    let mut indexes = Indexes::default();

    for lease in leases {
        let host = lease.hostname.trim().to_ascii_lowercase();
        if !is_valid_label(&host) {
            log::debug!("Skipping lease {} with hostname {:?}", lease.ip, lease.hostname);
            continue;
        }

        // Later leases win, and the entries they displace go from both maps
        if let Some(old_ip) = indexes.host_to_ip.insert(host.clone(), lease.ip) {
            if old_ip != lease.ip {
                indexes.ip_to_host.remove(&old_ip);
            }
        }
        if let Some(old_host) = indexes.ip_to_host.insert(lease.ip, host.clone()) {
            if old_host != host {
                indexes.host_to_ip.remove(&old_host);
            }
        }
    }

    indexes
}
