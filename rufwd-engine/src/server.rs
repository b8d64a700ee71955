//! Server lifecycle: prepare, start, stop, reconfigure, close
//!
//! One `RwLock` guards the server state. Lifecycle operations hold it
//! exclusively for their whole duration. Query paths hold it only long enough
//! to clone the current [`Generation`], then do their network I/O unlocked,
//! so a slow upstream never delays a reconfiguration.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fwd_dns::{ClientOptions, DnsClient};
use tokio::sync::RwLock;

use crate::access::{AccessPolicy, BlockReason};
use crate::autohost::{AutohostSuffix, AutohostTable, Lease, LeaseEvent};
use crate::classify::{LocallyServedNetworks, SubnetClassifier};
use crate::config::{ArchClass, ServerConfig};
use crate::dhcp::DhcpLeases;
use crate::error::{Error, Result};
use crate::handler::Generation;
use crate::hooks::{HookRegistry, QueryHook};
use crate::ipset::{IpsetBackend, IpsetBinder, NetlinkIpset};
use crate::listener::Listeners;
use crate::net::{HostNetwork, OsNetwork};
use crate::ratelimit::RateLimiter;
use crate::resolvers::{collect_self_addrs, LocalResolvers};

/// Wait between stopping listeners and rebinding during a reconfiguration,
/// giving the OS time to release the sockets
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Identity the query hook is registered under unless configured otherwise
pub const DEFAULT_HOOK_ID: &str = "/dns-query";

/// Opens the kernel side of the ipset binder
pub type IpsetOpener = Arc<dyn Fn() -> fwd_ipset::Result<Box<dyn IpsetBackend>> + Send + Sync>;

#[derive(Default)]
struct ServerState {
    generation: Option<Arc<Generation>>,
    listeners: Option<Listeners>,
    running: bool,
}

struct Inner {
    state: RwLock<ServerState>,
    autohost: Arc<AutohostTable>,
    classifier: Arc<dyn SubnetClassifier>,
    network: Arc<dyn HostNetwork>,
    hooks: Option<(Arc<dyn HookRegistry>, String)>,
    dhcp: Option<Arc<dyn DhcpLeases>>,
    ipset_opener: IpsetOpener,
    arch: ArchClass,
}

/// Builder for [`Server`]
pub struct ServerBuilder {
    autohost_tld: Option<String>,
    classifier: Option<Arc<dyn SubnetClassifier>>,
    network: Option<Arc<dyn HostNetwork>>,
    hooks: Option<(Arc<dyn HookRegistry>, String)>,
    dhcp: Option<Arc<dyn DhcpLeases>>,
    ipset_opener: Option<IpsetOpener>,
    arch: ArchClass,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            autohost_tld: None,
            classifier: None,
            network: None,
            hooks: None,
            dhcp: None,
            ipset_opener: None,
            arch: ArchClass::current(),
        }
    }

    /// Label DHCP hostnames are served under, `lan` when unset
    pub fn autohost_tld(mut self, tld: impl Into<String>) -> Self {
        self.autohost_tld = Some(tld.into());
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn SubnetClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn network(mut self, network: Arc<dyn HostNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Register the query hook in `registry` under `id` on prepare
    pub fn hook_registry(mut self, registry: Arc<dyn HookRegistry>, id: impl Into<String>) -> Self {
        self.hooks = Some((registry, id.into()));
        self
    }

    pub fn dhcp(mut self, dhcp: Arc<dyn DhcpLeases>) -> Self {
        self.dhcp = Some(dhcp);
        self
    }

    pub fn ipset_opener(mut self, opener: IpsetOpener) -> Self {
        self.ipset_opener = Some(opener);
        self
    }

    pub fn arch(mut self, arch: ArchClass) -> Self {
        self.arch = arch;
        self
    }

    pub fn build(self) -> Result<Server> {
        let suffix = match &self.autohost_tld {
            Some(tld) => AutohostSuffix::new(tld)?,
            None => AutohostSuffix::default(),
        };
        let autohost = Arc::new(AutohostTable::new(suffix));

        if let Some(dhcp) = &self.dhcp {
            let table = autohost.clone();
            dhcp.set_on_lease_changed(Box::new(move |event: LeaseEvent, leases: &[Lease]| {
                table.apply(event, leases)
            }));
            autohost.apply(LeaseEvent::Added, &dhcp.leases());
        }

        let ipset_opener: IpsetOpener = match self.ipset_opener {
            Some(opener) => opener,
            None => Arc::new(|| NetlinkIpset::open().map(|b| Box::new(b) as Box<dyn IpsetBackend>)),
        };
        let classifier: Arc<dyn SubnetClassifier> = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(LocallyServedNetworks::new()),
        };
        let network: Arc<dyn HostNetwork> = match self.network {
            Some(network) => network,
            None => Arc::new(OsNetwork::new()),
        };

        Ok(Server {
            inner: Arc::new(Inner {
                state: RwLock::new(ServerState::default()),
                autohost,
                classifier,
                network,
                hooks: self.hooks,
                dhcp: self.dhcp,
                ipset_opener,
                arch: self.arch,
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The DNS forwarding server
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Build a new generation from `config`; the server stays stopped
    pub async fn prepare(&self, config: ServerConfig) -> Result<()> {
        let mut state = self.inner.state.write().await;
        self.prepare_locked(&mut state, config)
    }

    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        self.start_locked(&mut state).await
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        self.stop_locked(&mut state).await
    }

    /// Stop, rebuild from `config` and start again
    ///
    /// Any failure leaves the server stopped.
    pub async fn reconfigure(&self, config: ServerConfig) -> Result<()> {
        let mut state = self.inner.state.write().await;

        log::info!("Start reconfiguring the server");
        self.stop_locked(&mut state)
            .await
            .map_err(|e| Error::Reconfigure(Box::new(e)))?;

        // Closed listeners do not always release their ports immediately
        tokio::time::sleep(SETTLE_DELAY).await;

        self.prepare_locked(&mut state, config)
            .map_err(|e| Error::Reconfigure(Box::new(e)))?;
        self.start_locked(&mut state)
            .await
            .map_err(|e| Error::Reconfigure(Box::new(e)))?;

        log::info!("Server reconfigured");
        Ok(())
    }

    /// Tear down the current generation; `start` fails until the next `prepare`
    pub async fn close(&self) {
        let mut state = self.inner.state.write().await;
        if let Some(listeners) = state.listeners.take() {
            listeners.shutdown().await;
        }
        state.running = false;

        if let Some(generation) = state.generation.take() {
            generation.ipset.close();
        }
        log::info!("DNS server closed");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.read().await.running
    }

    /// Local PTR resolvers as configured and whether client lookups are on
    pub async fn rdns_settings(&self) -> (Vec<String>, bool) {
        match self.generation().await {
            Some(generation) => (
                generation.conf.local_ptr_resolvers.clone(),
                generation.conf.resolve_clients,
            ),
            None => (Vec::new(), false),
        }
    }

    /// Copy of the prepared configuration, defaults included
    pub async fn config(&self) -> Option<ServerConfig> {
        self.generation().await.map(|generation| generation.conf.clone())
    }

    /// Addresses the running listeners are bound to
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        let state = self.inner.state.read().await;
        state
            .listeners
            .as_ref()
            .map(|l| l.local_addrs().to_vec())
            .unwrap_or_default()
    }

    /// Reason `ip` may not query, `None` when it may
    pub async fn is_blocked_ip(&self, ip: IpAddr) -> Option<BlockReason> {
        self.generation().await?.access.blocked_ip(ip)
    }

    /// Hostname of a client address through reverse DNS
    ///
    /// `Ok(None)` when client lookups are disabled.
    pub async fn exchange(&self, ip: IpAddr) -> Result<Option<String>> {
        let generation = self.generation().await.ok_or(Error::NotPrepared)?;
        if !generation.conf.resolve_clients {
            return Ok(None);
        }

        generation.reverse_router().lookup(ip).await.map(Some)
    }

    /// Addresses of `host` through the internal client, works before start
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let generation = self.generation().await.ok_or(Error::NotPrepared)?;
        Ok(generation.internal.lookup_ip(host).await?)
    }

    /// Answer a raw query handed over by an outer transport
    ///
    /// Returns `None` once the server is closed.
    pub async fn serve_dns(&self, query: &[u8], client: IpAddr) -> Option<Vec<u8>> {
        let generation = self.generation().await?;
        generation.handle_query(query, client).await
    }

    pub fn autohost(&self) -> &AutohostTable {
        &self.inner.autohost
    }

    async fn generation(&self) -> Option<Arc<Generation>> {
        self.inner.state.read().await.generation.clone()
    }

    fn prepare_locked(&self, state: &mut ServerState, config: ServerConfig) -> Result<()> {
        config.validate()?;
        let conf = config.with_defaults(self.inner.arch);

        let opener = self.inner.ipset_opener.clone();
        let ipset = IpsetBinder::init_with(&conf.ipset, move || opener())?;

        let bootstrap = conf.bootstrap_addrs()?;
        let upstream = DnsClient::new(
            conf.upstream_specs()?,
            ClientOptions {
                strategy: conf.upstream_mode,
                timeout: conf.upstream_timeout(),
                cache_size: conf.cache_size,
                filter_ipv6: conf.aaaa_disabled,
                bootstrap: bootstrap.clone(),
                ..Default::default()
            },
        )?;
        let internal = DnsClient::new(
            conf.upstream_specs()?,
            ClientOptions {
                strategy: conf.upstream_mode,
                timeout: conf.upstream_timeout(),
                cache_size: 0,
                filter_ipv6: conf.aaaa_disabled,
                bootstrap,
                ..Default::default()
            },
        )?;

        let access = AccessPolicy::new(&conf.allowed_clients, &conf.disallowed_clients, &conf.blocked_hosts)?;
        let ratelimit = RateLimiter::new(conf.ratelimit, &conf.ratelimit_whitelist)?;

        self.register_hook();

        let network = self.inner.network.as_ref();
        let self_addrs = collect_self_addrs(&conf, network).map_err(resolver_setup)?;
        let local =
            LocalResolvers::setup(&conf.local_ptr_resolvers, &self_addrs, network).map_err(resolver_setup)?;

        if let Some(dhcp) = &self.inner.dhcp {
            self.inner.autohost.apply(LeaseEvent::Added, &dhcp.leases());
        }

        let generation = Generation {
            conf,
            upstream,
            internal,
            local,
            access,
            ratelimit,
            ipset: Arc::new(ipset),
            self_addrs,
            classifier: self.inner.classifier.clone(),
            autohost: self.inner.autohost.clone(),
        };

        if let Some(previous) = state.generation.replace(Arc::new(generation)) {
            previous.ipset.close();
        }

        log::info!("DNS server prepared");
        Ok(())
    }

    async fn start_locked(&self, state: &mut ServerState) -> Result<()> {
        if state.listeners.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let generation = state.generation.clone().ok_or(Error::NotPrepared)?;

        let listeners = Listeners::bind(
            &generation.conf.udp_listen_addrs,
            &generation.conf.tcp_listen_addrs,
            generation.clone(),
        )
        .await?;

        state.listeners = Some(listeners);
        state.running = true;
        log::info!("DNS server started");
        Ok(())
    }

    async fn stop_locked(&self, state: &mut ServerState) -> Result<()> {
        if let Some(listeners) = state.listeners.take() {
            listeners.shutdown().await;
            log::info!("DNS server stopped");
        }
        state.running = false;
        Ok(())
    }

    fn register_hook(&self) {
        let Some((registry, id)) = &self.inner.hooks else {
            return;
        };
        let hook = Arc::new(ServerHook(Arc::downgrade(&self.inner)));
        if registry.register(id, hook) {
            log::info!("Registered DNS query hook {}", id);
        }
    }
}

fn resolver_setup(e: Error) -> Error {
    match e {
        Error::ResolverSetup(_) => e,
        other => Error::ResolverSetup(other.to_string()),
    }
}

/// Query hook that follows the server without keeping it alive
struct ServerHook(Weak<Inner>);

#[async_trait]
impl QueryHook for ServerHook {
    async fn serve_dns(&self, query: &[u8], client: IpAddr) -> Option<Vec<u8>> {
        let inner = self.0.upgrade()?;
        Server { inner }.serve_dns(query, client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Loopback;

    impl HostNetwork for Loopback {
        fn interface_addrs(&self) -> Result<Vec<IpAddr>> {
            Ok(vec!["127.0.0.1".parse().unwrap()])
        }

        fn system_resolvers(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn server() -> Server {
        Server::builder()
            .network(Arc::new(Loopback))
            .arch(ArchClass::Constrained)
            .build()
            .unwrap()
    }

    fn conf() -> ServerConfig {
        ServerConfig {
            udp_listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
            tcp_listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
            upstream_dns: vec!["127.0.0.1:1".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_requires_prepare() {
        let server = server();
        assert!(matches!(server.start().await, Err(Error::NotPrepared)));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_before_prepare_is_ok() {
        let server = server();
        server.stop().await.unwrap();
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let server = server();
        server.prepare(conf()).await.unwrap();
        assert!(!server.is_running().await);

        server.start().await.unwrap();
        assert!(server.is_running().await);
        assert_eq!(server.local_addrs().await.len(), 2);
        assert!(matches!(server.start().await, Err(Error::AlreadyRunning)));

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert!(server.local_addrs().await.is_empty());

        server.close().await;
        assert!(matches!(server.start().await, Err(Error::NotPrepared)));
    }

    #[tokio::test]
    async fn test_stop_right_after_start() {
        let server = server();
        server.prepare(conf()).await.unwrap();

        // Listener tasks have not been polled yet when stop signals them
        for _ in 0..10 {
            server.start().await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), server.stop())
                .await
                .expect("stop did not return")
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), server.reconfigure(conf()))
            .await
            .expect("reconfigure did not return")
            .unwrap();
        assert!(server.is_running().await);
        server.close().await;
    }

    #[tokio::test]
    async fn test_defaults_visible_in_config() {
        let server = server();
        server.prepare(conf()).await.unwrap();

        let conf = server.config().await.unwrap();
        assert_eq!(conf.blocked_hosts, vec!["version.bind", "id.server", "hostname.bind"]);
        assert_eq!(conf.upstream_dns, vec!["127.0.0.1:1"]);
        assert_eq!(conf.bootstrap_dns.len(), 4);
    }

    #[tokio::test]
    async fn test_bad_tld_fails_build() {
        assert!(matches!(
            Server::builder().autohost_tld("").build(),
            Err(Error::InvalidAutohostTld(_))
        ));
    }
}
