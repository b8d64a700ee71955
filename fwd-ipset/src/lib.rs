//! Pure Rust access to Linux ipset via netlink.
//!
//! An [`IpsetConn`] owns one netfilter netlink socket and issues ipset
//! commands over it: look up a set header, add an address, test membership.
//!
//! On non-Linux platforms every operation returns
//! `Err(IpSetError::UnsupportedPlatform)`.

#[cfg(target_os = "linux")]
mod netlink;

#[cfg(target_os = "linux")]
mod ipset;
#[cfg(target_os = "linux")]
pub use ipset::IpsetConn;

#[cfg(not(target_os = "linux"))]
mod stub;
#[cfg(not(target_os = "linux"))]
pub use stub::IpsetConn;

use std::net::IpAddr;
use thiserror::Error;

/// Longest set name the kernel accepts, NUL excluded
pub const IPSET_MAXNAMELEN: usize = 31;

/// Error type for ipset operations.
#[derive(Error, Debug)]
pub enum IpSetError {
    #[error("invalid set name: {0:?}")]
    InvalidSetName(String),

    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),

    #[error("netlink error: {}", std::io::Error::from_raw_os_error(*.0))]
    NetlinkError(i32),

    #[error("set not found: {0}")]
    SetNotFound(String),

    #[error("element not found")]
    ElementNotFound,

    #[error("element already exists")]
    ElementExists,

    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    #[error("unsupported platform: ipset is only available on Linux")]
    UnsupportedPlatform,
}

impl IpSetError {
    /// Whether the failure means ipset is unavailable here rather than misconfigured
    ///
    /// Missing privileges and kernels or platforms without ipset support fall
    /// in this class.
    pub fn is_degraded(&self) -> bool {
        const DEGRADED: [i32; 4] = [
            libc::EPERM,
            libc::EACCES,
            libc::EPROTONOSUPPORT,
            libc::EAFNOSUPPORT,
        ];

        match self {
            IpSetError::UnsupportedPlatform => true,
            IpSetError::NetlinkError(code) => DEGRADED.contains(code),
            IpSetError::SocketError(e) => {
                e.kind() == std::io::ErrorKind::PermissionDenied
                    || e.raw_os_error().is_some_and(|code| DEGRADED.contains(&code))
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, IpSetError>;

/// Address family of a set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpSetFamily {
    Inet,
    Inet6,
}

impl IpSetFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpSetFamily::Inet,
            IpAddr::V6(_) => IpSetFamily::Inet6,
        }
    }

    /// Whether `ip` can be stored in a set of this family
    pub fn matches(&self, ip: &IpAddr) -> bool {
        Self::of(ip) == *self
    }
}

impl std::fmt::Display for IpSetFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpSetFamily::Inet => write!(f, "inet"),
            IpSetFamily::Inet6 => write!(f, "inet6"),
        }
    }
}

/// What the kernel reports about an existing set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetHeader {
    pub name: String,
    /// Set type such as `hash:ip` or `hash:net`
    pub type_name: String,
    pub family: IpSetFamily,
}

/// Options for creating a `hash:ip` set
#[derive(Clone, Debug)]
pub struct IpSetCreateOptions {
    pub family: IpSetFamily,
    pub timeout: Option<u32>,
}

impl Default for IpSetCreateOptions {
    fn default() -> Self {
        Self {
            family: IpSetFamily::Inet,
            timeout: None,
        }
    }
}

pub(crate) fn validate_set_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > IPSET_MAXNAMELEN || name.contains('\0') {
        return Err(IpSetError::InvalidSetName(name.to_string()));
    }
    Ok(())
}
