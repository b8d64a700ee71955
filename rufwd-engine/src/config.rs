//! Configuration types for the forwarding engine

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use fwd_dns::{parse_dns_server, parse_socket_addr, DnsServerSpec, UpstreamStrategy, DNS_PORT};
use serde::{Deserialize, Serialize};

use crate::autohost::Lease;
use crate::error::{Error, Result};

/// Upstream used when none is configured
pub const DEFAULT_DNS: &str = "https://dns10.quad9.net/dns-query";

/// Plain resolvers used to bootstrap encrypted upstreams
pub const DEFAULT_BOOTSTRAP: [&str; 4] = ["9.9.9.10", "149.112.112.10", "2620:fe::10", "2620:fe::fe:10"];

/// Hostnames queried by fingerprinting tools, refused unless configured otherwise
pub const DEFAULT_BLOCKED_HOSTS: [&str; 3] = ["version.bind", "id.server", "hostname.bind"];

/// Upstream timeout when none is configured
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Default autohost top-level label
pub const DEFAULT_AUTOHOST_TLD: &str = "lan";

/// Class of the build target, used to pick upstream defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchClass {
    /// Targets that can afford TLS to upstreams
    Standard,
    /// Targets where DoH is too heavy, currently MIPS
    Constrained,
}

impl ArchClass {
    /// Class of the running build
    pub fn current() -> Self {
        if cfg!(any(target_arch = "mips", target_arch = "mips64")) {
            ArchClass::Constrained
        } else {
            ArchClass::Standard
        }
    }
}

/// Default upstream list for an architecture class
pub fn default_upstreams(arch: ArchClass) -> Vec<String> {
    match arch {
        ArchClass::Standard => vec![DEFAULT_DNS.to_string()],
        ArchClass::Constrained => DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect(),
    }
}

/// How queries for blocked hostnames are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMode {
    /// Unspecified address for A/AAAA, NXDOMAIN otherwise
    #[default]
    Default,
    /// NXDOMAIN for every type
    Nxdomain,
    /// 0.0.0.0 / :: for A/AAAA
    NullIp,
    /// The configured blocking_ipv4 / blocking_ipv6
    CustomIp,
    /// REFUSED for every type
    Refused,
}

/// Main configuration file
///
/// # Example Configuration
///
/// ```toml
/// log_level = "info"
/// autohost_tld = "lan"
///
/// [dns]
/// udp_listen_addrs = ["0.0.0.0:53"]
/// upstream_dns = ["https://dns10.quad9.net/dns-query"]
///
/// [[leases]]
/// hostname = "printer"
/// ip = "192.168.1.20"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Label appended to DHCP hostnames, `lan` gives `printer.lan.`
    #[serde(default = "default_autohost_tld")]
    pub autohost_tld: String,

    /// Networks answered by local PTR resolvers in addition to the private ranges
    #[serde(default)]
    pub local_networks: Vec<String>,

    /// DNS server settings
    #[serde(default)]
    pub dns: ServerConfig,

    /// Static hostname leases fed to the autohost table
    #[serde(default)]
    pub leases: Vec<Lease>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            autohost_tld: default_autohost_tld(),
            local_networks: Vec::new(),
            dns: ServerConfig::default(),
            leases: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        crate::autohost::AutohostSuffix::new(&self.autohost_tld)?;

        for net in &self.local_networks {
            net.parse::<ipnet::IpNet>()
                .map_err(|e| Error::InvalidConfig(format!("invalid local network {:?}: {}", net, e)))?;
        }

        self.dns.validate()
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# rufwd DNS forwarder configuration

# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

# Label appended to DHCP hostnames: "printer" is served as "printer.lan."
autohost_tld = "lan"

# Extra networks whose reverse lookups go to the local PTR resolvers.
# Private, loopback and link-local ranges are always included.
# local_networks = ["203.0.113.0/24"]

[dns]
# Addresses to listen on. An unspecified IP listens on every interface.
udp_listen_addrs = ["0.0.0.0:53"]
tcp_listen_addrs = ["0.0.0.0:53"]

# Upstream servers: "IP[:port][/udp|tcp]", "https://...", "tls://host[:port]"
# Defaults to Quad9 over HTTPS (plain Quad9 on MIPS).
# upstream_dns = ["https://dns10.quad9.net/dns-query"]

# Plain servers used to resolve encrypted upstream hostnames
# bootstrap_dns = ["9.9.9.10", "149.112.112.10"]

# Upstream selection: "first-reply", "round-robin", "random"
upstream_mode = "first-reply"

# Seconds to wait for an upstream (default: 10)
upstream_timeout = 10

# Answer for blocked hostnames: "default", "nxdomain", "null_ip", "custom_ip", "refused"
blocking_mode = "default"
# blocking_ipv4 = "192.0.2.1"   # required by custom_ip
# blocking_ipv6 = "2001:db8::1" # required by custom_ip
blocked_response_ttl = 10

# Resolvers for reverse lookups of private addresses.
# Empty means the system resolvers; this server's own addresses are skipped.
# local_ptr_resolvers = ["192.168.1.1"]

# Look up client hostnames through reverse DNS
resolve_clients = true

# Client access lists, IPs or CIDRs
# allowed_clients = ["192.168.1.0/24"]
# disallowed_clients = ["192.168.1.66"]

# Hostnames that are never forwarded, "*.example.org" matches subdomains
# blocked_hosts = ["version.bind", "id.server", "hostname.bind"]

# Queries per second per client, 0 disables the limit
ratelimit = 20
# ratelimit_whitelist = ["127.0.0.1"]

# Linux only: add resolved addresses to ipsets, "domain[,domain]/set[,set]"
# ipset = ["example.org,example.net/vpn_hosts"]

# Number of cached responses, 0 disables the cache
cache_size = 4096

# Drop AAAA records from answers
aaaa_disabled = false
"#
        .to_string()
    }
}

/// DNS server configuration, immutable once prepared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP listen addresses, the IP may be unspecified
    pub udp_listen_addrs: Vec<SocketAddr>,

    /// TCP listen addresses, the IP may be unspecified
    pub tcp_listen_addrs: Vec<SocketAddr>,

    /// Upstream servers, see [`fwd_dns::parse_dns_server`] for the format
    pub upstream_dns: Vec<String>,

    /// Plain DNS servers used to resolve encrypted upstream hostnames
    pub bootstrap_dns: Vec<String>,

    /// Upstream selection strategy
    pub upstream_mode: UpstreamStrategy,

    /// Upstream timeout in seconds, 0 uses the default
    pub upstream_timeout: u64,

    pub blocking_mode: BlockingMode,
    pub blocking_ipv4: Option<Ipv4Addr>,
    pub blocking_ipv6: Option<Ipv6Addr>,

    /// TTL of synthesized answers for blocked hostnames
    pub blocked_response_ttl: u32,

    /// Resolvers for reverse lookups of locally-served addresses
    pub local_ptr_resolvers: Vec<String>,

    /// Whether reverse lookups of client addresses are attempted at all
    pub resolve_clients: bool,

    pub allowed_clients: Vec<String>,
    pub disallowed_clients: Vec<String>,
    pub blocked_hosts: Vec<String>,

    /// Queries per second per client, 0 disables
    pub ratelimit: u32,
    pub ratelimit_whitelist: Vec<String>,

    /// `dom1,dom2/set1,set2` lines
    pub ipset: Vec<String>,

    /// Number of cached responses, 0 disables
    pub cache_size: usize,

    /// Drop AAAA records from answers
    pub aaaa_disabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_listen_addrs: Vec::new(),
            tcp_listen_addrs: Vec::new(),
            upstream_dns: Vec::new(),
            bootstrap_dns: Vec::new(),
            upstream_mode: UpstreamStrategy::default(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT.as_secs(),
            blocking_mode: BlockingMode::default(),
            blocking_ipv4: None,
            blocking_ipv6: None,
            blocked_response_ttl: default_blocked_response_ttl(),
            local_ptr_resolvers: Vec::new(),
            resolve_clients: true,
            allowed_clients: Vec::new(),
            disallowed_clients: Vec::new(),
            blocked_hosts: Vec::new(),
            ratelimit: default_ratelimit(),
            ratelimit_whitelist: Vec::new(),
            ipset: Vec::new(),
            cache_size: default_cache_size(),
            aaaa_disabled: false,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    ///
    /// Runs before anything from the configuration is applied.
    pub fn validate(&self) -> Result<()> {
        if self.blocking_mode == BlockingMode::CustomIp
            && (self.blocking_ipv4.is_none() || self.blocking_ipv6.is_none())
        {
            return Err(Error::InvalidConfig(
                "blocking_ipv4 and blocking_ipv6 must be set when blocking_mode is custom_ip".into(),
            ));
        }

        for upstream in self.upstream_dns.iter().chain(&self.local_ptr_resolvers) {
            parse_dns_server(upstream)
                .map_err(|e| Error::InvalidConfig(format!("invalid DNS server {:?}: {}", upstream, e)))?;
        }

        self.bootstrap_addrs()?;

        Ok(())
    }

    /// Fill in defaults for everything left empty
    pub fn with_defaults(mut self, arch: ArchClass) -> Self {
        if self.upstream_dns.is_empty() {
            self.upstream_dns = default_upstreams(arch);
        }
        if self.bootstrap_dns.is_empty() {
            self.bootstrap_dns = DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect();
        }
        if self.blocked_hosts.is_empty() {
            self.blocked_hosts = DEFAULT_BLOCKED_HOSTS.iter().map(|s| s.to_string()).collect();
        }
        if self.upstream_timeout == 0 {
            self.upstream_timeout = DEFAULT_UPSTREAM_TIMEOUT.as_secs();
        }
        self
    }

    pub fn upstream_timeout(&self) -> Duration {
        if self.upstream_timeout == 0 {
            DEFAULT_UPSTREAM_TIMEOUT
        } else {
            Duration::from_secs(self.upstream_timeout)
        }
    }

    /// Parse the configured upstreams
    pub fn upstream_specs(&self) -> Result<Vec<DnsServerSpec>> {
        self.upstream_dns
            .iter()
            .map(|s| parse_dns_server(s).map_err(Error::from))
            .collect()
    }

    /// Parse the bootstrap servers, which must be plain IPs
    pub fn bootstrap_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.bootstrap_dns
            .iter()
            .map(|s| {
                parse_socket_addr(s, DNS_PORT)
                    .map_err(|e| Error::InvalidConfig(format!("invalid bootstrap server {:?}: {}", s, e)))
            })
            .collect()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_autohost_tld() -> String {
    DEFAULT_AUTOHOST_TLD.to_string()
}

fn default_blocked_response_ttl() -> u32 {
    10
}

fn default_ratelimit() -> u32 {
    20
}

fn default_cache_size() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.autohost_tld, "lan");
        assert_eq!(config.dns.udp_listen_addrs, vec!["0.0.0.0:53".parse().unwrap()]);
        assert_eq!(config.dns.ratelimit, 20);
        assert_eq!(config.dns.cache_size, 4096);
        assert!(config.dns.resolve_clients);
    }

    #[test]
    fn test_parse_dns_section() {
        let toml = r#"
[dns]
udp_listen_addrs = ["127.0.0.1:5353"]
upstream_dns = ["9.9.9.9", "tls://dns.quad9.net"]
upstream_mode = "round-robin"
blocking_mode = "custom_ip"
blocking_ipv4 = "192.0.2.1"
blocking_ipv6 = "2001:db8::1"
local_ptr_resolvers = ["192.168.1.1"]

[[leases]]
hostname = "printer"
ip = "192.168.1.20"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.dns.upstream_mode, UpstreamStrategy::RoundRobin);
        assert_eq!(config.dns.blocking_mode, BlockingMode::CustomIp);
        assert_eq!(config.dns.upstream_specs().unwrap().len(), 2);
        assert_eq!(config.leases.len(), 1);
        assert_eq!(config.leases[0].hostname, "printer");
    }

    #[test]
    fn test_custom_ip_requires_both_addresses() {
        let conf = ServerConfig {
            blocking_mode: BlockingMode::CustomIp,
            blocking_ipv4: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..Default::default()
        };

        let err = conf.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_invalid_upstream_rejected() {
        let conf = ServerConfig {
            upstream_dns: vec!["not-a-server".into()],
            ..Default::default()
        };
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_invalid_tld_rejected() {
        let toml = r#"autohost_tld = "-bad-""#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(Error::InvalidAutohostTld(_))
        ));
    }

    #[test]
    fn test_defaults_applied() {
        let conf = ServerConfig {
            upstream_timeout: 0,
            ..Default::default()
        }
        .with_defaults(ArchClass::Standard);

        assert_eq!(conf.upstream_dns, vec![DEFAULT_DNS.to_string()]);
        assert_eq!(conf.bootstrap_dns.len(), 4);
        assert_eq!(conf.blocked_hosts, vec!["version.bind", "id.server", "hostname.bind"]);
        assert_eq!(conf.upstream_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_configured_values_survive_defaults() {
        let conf = ServerConfig {
            upstream_dns: vec!["192.0.2.53".into()],
            blocked_hosts: vec!["*.ads.example".into()],
            ..Default::default()
        }
        .with_defaults(ArchClass::Constrained);

        assert_eq!(conf.upstream_dns, vec!["192.0.2.53"]);
        assert_eq!(conf.blocked_hosts, vec!["*.ads.example"]);
    }

    #[test]
    fn test_default_upstreams_by_arch() {
        assert_eq!(default_upstreams(ArchClass::Standard), vec![DEFAULT_DNS]);
        assert_eq!(
            default_upstreams(ArchClass::Constrained),
            vec!["9.9.9.10", "149.112.112.10", "2620:fe::10", "2620:fe::fe:10"]
        );
    }
}
