//! Local PTR resolver set
//!
//! Reverse lookups for locally-served addresses go to a dedicated set of
//! resolvers: the configured ones, or the system's when none are configured,
//! minus the addresses this server listens on so it never queries itself.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use fwd_dns::{parse_dns_server, ClientOptions, DnsClient, UpstreamStrategy};
use hickory_proto::op::Message;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::net::HostNetwork;

/// Timeout for each local resolver exchange
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Elements of `a` that are not in `b`, keeping the order of `a`
pub fn set_subtract(a: &[String], b: &[String]) -> Vec<String> {
    let exclude: HashSet<&str> = b.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();

    a.iter()
        .filter(|s| !exclude.contains(s.as_str()) && seen.insert(s.as_str()))
        .cloned()
        .collect()
}

/// IPs this server listens on, without ports
///
/// TCP addresses come first. The first unspecified IP makes the partial
/// result irrelevant: the server is reachable on every interface, so every
/// interface address is returned instead.
pub fn collect_self_addrs(conf: &ServerConfig, net: &dyn HostNetwork) -> Result<Vec<String>> {
    let mut addrs = Vec::with_capacity(conf.tcp_listen_addrs.len() + conf.udp_listen_addrs.len());

    for addr in conf.tcp_listen_addrs.iter().chain(&conf.udp_listen_addrs) {
        if addr.ip().is_unspecified() {
            let all = net.interface_addrs()?;
            return Ok(all.iter().map(IpAddr::to_string).collect());
        }
        addrs.push(addr.ip().to_string());
    }

    Ok(addrs)
}

/// Resolvers for locally-served reverse lookups
pub struct LocalResolvers {
    addrs: Vec<String>,
    client: Option<DnsClient>,
}

impl LocalResolvers {
    /// Build the set from configuration
    ///
    /// An empty `configured` list falls back to the system resolvers. Addresses
    /// in `self_addrs` are removed. An empty result is accepted; exchanges
    /// through it fail with [`fwd_dns::Error::NoUpstreams`].
    pub fn setup(configured: &[String], self_addrs: &[String], net: &dyn HostNetwork) -> Result<Self> {
        let candidates = if configured.is_empty() {
            net.system_resolvers()
                .map_err(|e| Error::ResolverSetup(format!("reading system resolvers: {}", e)))?
        } else {
            configured.to_vec()
        };

        let addrs = set_subtract(&candidates, self_addrs);

        let specs = addrs
            .iter()
            .map(|addr| {
                parse_dns_server(addr)
                    .map_err(|e| Error::ResolverSetup(format!("bad resolver {:?}: {}", addr, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let client = if specs.is_empty() {
            log::warn!("No local PTR resolvers available, private reverse lookups will fail");
            None
        } else {
            let options = ClientOptions {
                strategy: UpstreamStrategy::FirstReply,
                timeout: LOCAL_TIMEOUT,
                ..Default::default()
            };
            Some(DnsClient::new(specs, options).map_err(|e| Error::ResolverSetup(e.to_string()))?)
        };

        log::debug!("Local PTR resolvers: {:?}", addrs);

        Ok(Self { addrs, client })
    }

    /// Resolver addresses left after self-subtraction
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn is_empty(&self) -> bool {
        self.client.is_none()
    }

    /// Send a query to the set, first reply wins
    pub async fn exchange(&self, request: &Message) -> Result<Message> {
        match &self.client {
            Some(client) => Ok(client.exchange(request).await?),
            None => Err(fwd_dns::Error::NoUpstreams.into()),
        }
    }
}
