//! DNS client with multi-protocol support and load balancing
//!
//! Supports UDP, TCP, DoH (DNS over HTTPS), and DoT (DNS over TLS)
//! upstream DNS servers with configurable load balancing strategies and
//! optional TTL-based caching.
//!
//! ## Upstream Strategies
//!
//! - **FirstReply** (default): Sends queries to all upstreams in parallel and returns
//!   the first successful response.
//! - **RoundRobin**: Selects upstreams in round-robin order.
//! - **Random**: Selects a random upstream for each query.
//!
//! ## Bootstrap servers
//!
//! Encrypted upstreams are usually given by hostname. When bootstrap servers
//! are configured, those hostnames are resolved through them over plain UDP
//! instead of the system resolver.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use rand::prelude::IndexedRandom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::RwLock;

use crate::cache::{CacheStats, DnsCache};
use crate::config::{DnsServerSpec, UpstreamStrategy};
use crate::error::{Error, Result};
use crate::msg::{build_query, ResolvedIps};

/// Default per-upstream query timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shortest wait given to a single bootstrap server
const MIN_BOOTSTRAP_ATTEMPT: Duration = Duration::from_millis(500);

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum TCP/DoT/DoH DNS response size
const MAX_TCP_RESPONSE_SIZE: usize = 65535;

/// Knobs for [`DnsClient::new`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Upstream selection strategy
    pub strategy: UpstreamStrategy,

    /// Time allowed for one upstream exchange, connection setup included
    pub timeout: Duration,

    /// Maximum number of cached responses, 0 disables the cache
    pub cache_size: usize,

    /// Strip AAAA records from responses
    pub filter_ipv6: bool,

    /// Local address for outgoing UDP and TCP sockets
    pub bind_addr: Option<IpAddr>,

    /// Plain DNS servers used to resolve DoH/DoT hostnames
    pub bootstrap: Vec<SocketAddr>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            strategy: UpstreamStrategy::default(),
            timeout: DEFAULT_TIMEOUT,
            cache_size: 0,
            filter_ipv6: false,
            bind_addr: None,
            bootstrap: Vec::new(),
        }
    }
}

/// Everything needed to talk to one upstream, cheap to clone into tasks
#[derive(Clone)]
struct Transport {
    http_client: reqwest::Client,
    tls_config: Arc<rustls::ClientConfig>,
    bind_addr: Option<IpAddr>,
    timeout: Duration,
    bootstrap: Arc<[SocketAddr]>,
}

/// DNS client with caching and load balancing
pub struct DnsClient {
    /// Configured upstream servers
    upstreams: Vec<DnsServerSpec>,

    /// Response cache, absent when disabled
    cache: Option<RwLock<DnsCache>>,

    /// Upstream selection strategy
    strategy: UpstreamStrategy,

    /// Next upstream index for round-robin
    next_upstream: AtomicUsize,

    transport: Transport,

    /// Whether to filter AAAA (IPv6) records from responses
    filter_ipv6: bool,
}

/// Remove AAAA records from every section of a response
fn filter_aaaa_records(response_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut message = Message::from_vec(response_bytes)
        .map_err(|e| Error::Dns(format!("failed to parse DNS response for filtering: {}", e)))?;

    let keep = |records: Vec<hickory_proto::rr::Record>| {
        records
            .into_iter()
            .filter(|r| r.record_type() != RecordType::AAAA)
            .collect::<Vec<_>>()
    };

    let answers = keep(message.take_answers());
    let name_servers = keep(message.take_name_servers());
    let additionals = keep(message.take_additionals());
    message.insert_answers(answers);
    message.insert_name_servers(name_servers);
    message.insert_additionals(additionals);

    message
        .to_vec()
        .map_err(|e| Error::Dns(format!("failed to serialize filtered DNS response: {}", e)))
}

impl DnsClient {
    /// Create a client for the given upstream servers
    pub fn new(upstreams: Vec<DnsServerSpec>, options: ClientOptions) -> Result<Self> {
        if upstreams.is_empty() {
            return Err(Error::NoUpstreams);
        }

        log::debug!(
            "Creating DNS client with {} upstreams, strategy: {}, timeout: {:?}, cache: {}, filter_ipv6: {}",
            upstreams.len(),
            options.strategy.description(),
            options.timeout,
            options.cache_size,
            options.filter_ipv6
        );

        let cache = NonZeroUsize::new(options.cache_size).map(|size| RwLock::new(DnsCache::new(size)));

        Ok(Self {
            upstreams,
            cache,
            strategy: options.strategy,
            next_upstream: AtomicUsize::new(0),
            transport: Transport::new(&options)?,
            filter_ipv6: options.filter_ipv6,
        })
    }

    pub fn upstreams(&self) -> &[DnsServerSpec] {
        &self.upstreams
    }

    /// Check if IPv6 filtering is enabled
    pub fn filter_ipv6(&self) -> bool {
        self.filter_ipv6
    }

    /// Get the bind address for outgoing requests
    pub fn bind_addr(&self) -> Option<IpAddr> {
        self.transport.bind_addr
    }

    /// Get the current upstream strategy
    pub fn strategy(&self) -> UpstreamStrategy {
        self.strategy
    }

    pub fn timeout(&self) -> Duration {
        self.transport.timeout
    }

    /// Query DNS with caching
    ///
    /// The query should be a raw DNS message. Returns the raw DNS response.
    pub async fn query(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        let message = Message::from_vec(query_bytes)
            .map_err(|e| Error::Dns(format!("invalid DNS query: {}", e)))?;

        let query = message
            .queries()
            .first()
            .ok_or_else(|| Error::Dns("DNS query has no questions".into()))?;

        if let Some(cache) = &self.cache {
            if let Some(mut response) = cache.write().await.get(query) {
                // Cached responses carry the ID of the query that filled them
                if response.len() >= 2 {
                    response[..2].copy_from_slice(&query_bytes[..2]);
                }
                log::debug!("DNS cache hit for {}", query.name());
                return Ok(response);
            }
            log::debug!("DNS cache miss for {}", query.name());
        }

        let mut response = self.forward_query(query_bytes).await?;

        if self.filter_ipv6 {
            response = filter_aaaa_records(&response)?;
        }

        if let Some(cache) = &self.cache {
            cache.write().await.insert(query, &response);
        }

        Ok(response)
    }

    /// Send a parsed message and parse the response
    pub async fn exchange(&self, request: &Message) -> Result<Message> {
        let response = self.query(&request.to_vec()?).await?;
        Ok(Message::from_vec(&response)?)
    }

    /// Resolve a hostname to its addresses
    ///
    /// IP literals are returned as-is. A and AAAA are asked concurrently;
    /// AAAA is skipped when IPv6 filtering is on.
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let fqdn = if host.ends_with('.') {
            host.to_string()
        } else {
            format!("{}.", host)
        };

        let a_query = build_query(&fqdn, RecordType::A)?;
        let aaaa_query = build_query(&fqdn, RecordType::AAAA)?;

        let (a, aaaa) = tokio::join!(self.exchange(&a_query), async {
            if self.filter_ipv6 {
                Ok(None)
            } else {
                self.exchange(&aaaa_query).await.map(Some)
            }
        });

        let mut ips = Vec::new();
        let mut last_err = None;
        for result in [a.map(Some), aaaa] {
            match result {
                Ok(Some(message)) => {
                    if let Some(resolved) = ResolvedIps::from_message(&message) {
                        ips.extend(resolved.all_ips());
                    }
                }
                Ok(None) => {}
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) if ips.is_empty() => Err(e),
            _ => Ok(ips),
        }
    }

    /// Forward a DNS query to upstream server(s) using the configured strategy
    async fn forward_query(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        match self.strategy {
            UpstreamStrategy::FirstReply => self.forward_first_reply(query_bytes).await,
            UpstreamStrategy::RoundRobin => self.forward_round_robin(query_bytes).await,
            UpstreamStrategy::Random => self.forward_random(query_bytes).await,
        }
    }

    /// Forward query using first-reply strategy (parallel queries to all upstreams)
    async fn forward_first_reply(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        use tokio::sync::mpsc;

        if let [upstream] = self.upstreams.as_slice() {
            return self.transport.query(upstream, query_bytes).await;
        }

        log::debug!(
            "Forwarding DNS query to {} upstreams in parallel (first-reply)",
            self.upstreams.len()
        );

        let (tx, mut rx) = mpsc::channel::<Result<Vec<u8>>>(self.upstreams.len());

        for upstream in &self.upstreams {
            let upstream = upstream.clone();
            let query_bytes = query_bytes.to_vec();
            let transport = self.transport.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = transport.query(&upstream, &query_bytes).await;
                // The receiver is gone once a winner has been picked
                let _ = tx.send(result).await;
            });
        }

        drop(tx);

        let mut errors = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    log::debug!("Upstream query failed: {}", e);
                    errors.push(e);
                }
            }
        }

        Err(Error::Dns(format!(
            "all {} upstreams failed: {}",
            errors.len(),
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        )))
    }

    /// Forward query using round-robin strategy
    async fn forward_round_robin(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        let idx = self.next_upstream.fetch_add(1, Ordering::Relaxed) % self.upstreams.len();
        let upstream = &self.upstreams[idx];

        log::debug!(
            "Forwarding DNS query to {} ({}) [round-robin idx={}]",
            upstream,
            upstream.server_type(),
            idx
        );

        self.transport.query(upstream, query_bytes).await
    }

    /// Forward query using random strategy
    async fn forward_random(&self, query_bytes: &[u8]) -> Result<Vec<u8>> {
        let upstream = self
            .upstreams
            .choose(&mut rand::rng())
            .ok_or(Error::NoUpstreams)?;

        log::debug!(
            "Forwarding DNS query to {} ({}) [random]",
            upstream,
            upstream.server_type()
        );

        self.transport.query(upstream, query_bytes).await
    }

    /// Clear the DNS cache
    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.write().await.clear();
        }
    }

    /// Get cache statistics, `None` when caching is disabled
    pub async fn cache_stats(&self) -> Option<CacheStats> {
        match &self.cache {
            Some(cache) => Some(cache.read().await.stats().clone()),
            None => None,
        }
    }
}

impl Transport {
    fn new(options: &ClientOptions) -> Result<Self> {
        let bootstrap: Arc<[SocketAddr]> = options.bootstrap.clone().into();

        let mut http_builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(options.timeout);
        if !bootstrap.is_empty() {
            http_builder = http_builder.dns_resolver(Arc::new(BootstrapResolver {
                servers: bootstrap.clone(),
                bind_addr: options.bind_addr,
                timeout: options.timeout,
            }));
        }
        let http_client = http_builder
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("failed to create TLS config: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            http_client,
            tls_config: Arc::new(tls_config),
            bind_addr: options.bind_addr,
            timeout: options.timeout,
            bootstrap,
        })
    }

    /// Query one upstream, bounded by the client timeout
    async fn query(&self, upstream: &DnsServerSpec, query_bytes: &[u8]) -> Result<Vec<u8>> {
        match tokio::time::timeout(self.timeout, self.send(upstream, query_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(upstream.to_string())),
        }
    }

    async fn send(&self, upstream: &DnsServerSpec, query_bytes: &[u8]) -> Result<Vec<u8>> {
        match upstream {
            DnsServerSpec::Udp { addr } => query_udp(*addr, query_bytes, self.bind_addr).await,
            DnsServerSpec::Tcp { addr } => {
                let mut stream = connect_tcp(*addr, self.bind_addr).await?;
                dns_over_stream(&mut stream, query_bytes).await
            }
            DnsServerSpec::Doh { url } => self.query_doh(url, query_bytes).await,
            DnsServerSpec::Dot { hostname, port } => {
                self.query_dot(hostname, *port, query_bytes).await
            }
        }
    }

    async fn query_doh(&self, url: &str, query: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .post(url)
            .header("Content-Type", "application/dns-message")
            .header("Accept", "application/dns-message")
            .body(query.to_vec())
            .send()
            .await
            .map_err(|e| Error::Dns(format!("DoH request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Dns(format!(
                "DoH server returned error: {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Dns(format!("failed to read DoH response: {}", e)))?;

        Ok(body.to_vec())
    }

    async fn query_dot(&self, hostname: &str, port: u16, query: &[u8]) -> Result<Vec<u8>> {
        let addr = self.resolve_upstream_host(hostname, port).await?;
        let tcp_stream = connect_tcp(addr, self.bind_addr).await?;

        let connector = tokio_rustls::TlsConnector::from(self.tls_config.clone());
        let server_name = rustls_pki_types::ServerName::try_from(hostname.to_string())
            .map_err(|e| Error::Dns(format!("invalid DoT hostname: {}", e)))?;

        let mut tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| Error::Dns(format!("DoT TLS handshake failed: {}", e)))?;

        dns_over_stream(&mut tls_stream, query).await
    }

    /// Find the address of an encrypted upstream given by name
    async fn resolve_upstream_host(&self, hostname: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let ips: Vec<IpAddr> = if self.bootstrap.is_empty() {
            tokio::net::lookup_host((hostname, port))
                .await
                .map_err(|e| Error::Dns(format!("failed to resolve {}: {}", hostname, e)))?
                .map(|addr| addr.ip())
                .collect()
        } else {
            bootstrap_lookup(&self.bootstrap, hostname, self.bind_addr, self.timeout).await?
        };

        ips.first()
            .map(|ip| SocketAddr::new(*ip, port))
            .ok_or_else(|| Error::Dns(format!("no addresses found for {}", hostname)))
    }
}

/// Resolve `host` over plain UDP through the bootstrap servers, in order
///
/// `budget` is split across every (record type, server) attempt so a silent
/// server cannot use it up before the next one is tried.
async fn bootstrap_lookup(
    servers: &[SocketAddr],
    host: &str,
    bind_addr: Option<IpAddr>,
    budget: Duration,
) -> Result<Vec<IpAddr>> {
    let fqdn = format!("{}.", host.trim_end_matches('.'));
    let attempts = u32::try_from(servers.len().saturating_mul(2)).unwrap_or(u32::MAX).max(1);
    let per_attempt = (budget / attempts).max(MIN_BOOTSTRAP_ATTEMPT);
    let mut last_err = Error::NoUpstreams;

    for record_type in [RecordType::A, RecordType::AAAA] {
        let query = build_query(&fqdn, record_type)?.to_vec()?;
        for server in servers {
            let attempt = match tokio::time::timeout(per_attempt, query_udp(*server, &query, bind_addr)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(server.to_string())),
            };
            match attempt {
                Ok(response) => {
                    if let Some(resolved) = ResolvedIps::from_bytes(&response) {
                        log::debug!("Bootstrap {} resolved {} via {}", record_type, host, server);
                        return Ok(resolved.all_ips());
                    }
                }
                Err(e) => {
                    log::debug!("Bootstrap server {} failed for {}: {}", server, host, e);
                    last_err = e;
                }
            }
        }
    }

    Err(match last_err {
        Error::NoUpstreams => Error::Dns(format!("bootstrap servers have no address for {}", host)),
        e => e,
    })
}

/// Resolver plugged into the DoH HTTP client when bootstrap servers are set
struct BootstrapResolver {
    servers: Arc<[SocketAddr]>,
    bind_addr: Option<IpAddr>,
    timeout: Duration,
}

impl reqwest::dns::Resolve for BootstrapResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let servers = self.servers.clone();
        let bind_addr = self.bind_addr;
        let timeout = self.timeout;
        let host = name.as_str().to_string();

        let lookup = async move {
            let ips = match tokio::time::timeout(timeout, bootstrap_lookup(&servers, &host, bind_addr, timeout)).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::Timeout(host).into()),
            };
            // Port 0 lets the connector fill in the port from the URL
            let addrs: reqwest::dns::Addrs =
                Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        };

        Box::pin(lookup)
    }
}

fn unspecified_for(addr: &SocketAddr) -> IpAddr {
    if addr.is_ipv6() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Send a DNS query over UDP and wait for the matching reply
async fn query_udp(addr: SocketAddr, query: &[u8], bind_addr: Option<IpAddr>) -> Result<Vec<u8>> {
    let local = SocketAddr::new(bind_addr.unwrap_or_else(|| unspecified_for(&addr)), 0);

    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| Error::Dns(format!("failed to bind UDP socket to {}: {}", local, e)))?;

    socket
        .send_to(query, addr)
        .await
        .map_err(|e| Error::Dns(format!("failed to send DNS query to {}: {}", addr, e)))?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    loop {
        let (len, src) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| Error::Dns(format!("failed to receive DNS response: {}", e)))?;

        // Stray datagrams and replies with a foreign ID are ignored
        if src == addr && len >= 2 && query.len() >= 2 && buf[..2] == query[..2] {
            buf.truncate(len);
            return Ok(buf);
        }
        log::debug!("Ignoring unexpected datagram from {}", src);
    }
}

/// Helper to create a bound and connected TCP stream
async fn create_bound_tcp_stream(addr: SocketAddr, bind_addr: IpAddr) -> std::io::Result<TcpStream> {
    let socket = socket2::Socket::new(
        if addr.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.bind(&SocketAddr::new(bind_addr, 0).into())?;
    socket.set_nonblocking(true)?;

    // EINPROGRESS (36 on macOS, 115 on Linux) or WouldBlock means the connect is pending
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(36)
                || e.raw_os_error() == Some(115)
                || e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    stream.ready(tokio::io::Interest::WRITABLE).await?;

    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    Ok(stream)
}

async fn connect_tcp(addr: SocketAddr, bind_addr: Option<IpAddr>) -> Result<TcpStream> {
    let result = match bind_addr {
        Some(bind_ip) => create_bound_tcp_stream(addr, bind_ip).await,
        None => TcpStream::connect(addr).await,
    };

    result.map_err(|e| match bind_addr {
        Some(bind_ip) => Error::Dns(format!(
            "TCP connect to {} (bound to {}) failed: {}",
            addr, bind_ip, e
        )),
        None => Error::Dns(format!("TCP connect to {} failed: {}", addr, e)),
    })
}

/// Length-prefixed exchange over TCP or TLS
async fn dns_over_stream<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len())
        .map_err(|_| Error::Dns("DNS query too large for stream transport".into()))?;
    let mut msg = Vec::with_capacity(2 + query.len());
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(query);

    stream
        .write_all(&msg)
        .await
        .map_err(|e| Error::Dns(format!("stream write failed: {}", e)))?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Dns(format!("stream read failed: {}", e)))?;

    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len > MAX_TCP_RESPONSE_SIZE {
        return Err(Error::Dns("DNS response too large".into()));
    }

    let mut response = vec![0u8; response_len];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::Dns(format!("stream read failed: {}", e)))?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{Name, RData, Record};
    use std::str::FromStr;

    fn udp(addr: &str) -> DnsServerSpec {
        DnsServerSpec::Udp {
            addr: addr.parse().unwrap(),
        }
    }

    /// Fake upstream answering every A query with `v4` and AAAA with `::1`
    async fn spawn_upstream(v4: Ipv4Addr) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let request = Message::from_vec(&buf[..len]).unwrap();
                let mut response = Message::new();
                response.set_id(request.id());
                response.set_message_type(MessageType::Response);
                response.set_op_code(OpCode::Query);
                response.set_response_code(ResponseCode::NoError);
                for q in request.queries() {
                    response.add_query(q.clone());
                    let rdata = match q.query_type() {
                        RecordType::A => RData::A(A(v4)),
                        RecordType::AAAA => RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
                        _ => continue,
                    };
                    response.add_answer(Record::from_rdata(q.name().clone(), 300, rdata));
                }
                socket
                    .send_to(&response.to_vec().unwrap(), src)
                    .await
                    .unwrap();
            }
        });

        (addr, hits)
    }

    fn a_query(name: &str) -> Vec<u8> {
        build_query(name, RecordType::A).unwrap().to_vec().unwrap()
    }

    #[test]
    fn test_dns_client_empty_upstreams() {
        let err = DnsClient::new(vec![], ClientOptions::default()).err().unwrap();
        assert!(matches!(err, Error::NoUpstreams));
    }

    #[test]
    fn test_dns_client_mixed_upstreams() {
        let upstreams = vec![
            udp("8.8.8.8:53"),
            DnsServerSpec::Tcp {
                addr: "8.8.4.4:53".parse().unwrap(),
            },
            DnsServerSpec::Doh {
                url: "https://dns10.quad9.net/dns-query".into(),
            },
            DnsServerSpec::Dot {
                hostname: "dns.google".into(),
                port: 853,
            },
        ];

        let options = ClientOptions {
            bootstrap: vec!["9.9.9.10:53".parse().unwrap()],
            ..Default::default()
        };
        let client = DnsClient::new(upstreams, options).unwrap();
        assert_eq!(client.upstreams().len(), 4);
        assert_eq!(client.strategy(), UpstreamStrategy::FirstReply);
        assert_eq!(client.timeout(), DEFAULT_TIMEOUT);
        assert!(!client.filter_ipv6());
        assert!(client.bind_addr().is_none());
    }

    #[test]
    fn test_round_robin() {
        let options = ClientOptions {
            strategy: UpstreamStrategy::RoundRobin,
            ..Default::default()
        };
        let client = DnsClient::new(vec![udp("8.8.8.8:53"), udp("8.8.4.4:53")], options).unwrap();

        let idx1 = client.next_upstream.fetch_add(1, Ordering::Relaxed) % 2;
        let idx2 = client.next_upstream.fetch_add(1, Ordering::Relaxed) % 2;
        let idx3 = client.next_upstream.fetch_add(1, Ordering::Relaxed) % 2;

        assert_eq!((idx1, idx2, idx3), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_query_udp_upstream() {
        let (addr, _) = spawn_upstream(Ipv4Addr::new(192, 0, 2, 7)).await;
        let client = DnsClient::new(
            vec![DnsServerSpec::Udp { addr }],
            ClientOptions::default(),
        )
        .unwrap();

        let request = build_query("example.com.", RecordType::A).unwrap();
        let response = client.exchange(&request).await.unwrap();
        assert_eq!(response.id(), request.id());
        let resolved = ResolvedIps::from_message(&response).unwrap();
        assert_eq!(resolved.ipv4, vec![Ipv4Addr::new(192, 0, 2, 7)]);
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_queries() {
        let (addr, hits) = spawn_upstream(Ipv4Addr::new(192, 0, 2, 8)).await;
        let options = ClientOptions {
            cache_size: 16,
            ..Default::default()
        };
        let client = DnsClient::new(vec![DnsServerSpec::Udp { addr }], options).unwrap();

        let first = a_query("cached.example.");
        let second = a_query("cached.example.");
        client.query(&first).await.unwrap();
        let response = client.query(&second).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(response[..2], second[..2]);
        assert_eq!(client.cache_stats().await.unwrap().hits, 1);
    }

    #[tokio::test]
    async fn test_uncached_client_always_forwards() {
        let (addr, hits) = spawn_upstream(Ipv4Addr::new(192, 0, 2, 9)).await;
        let client = DnsClient::new(
            vec![DnsServerSpec::Udp { addr }],
            ClientOptions::default(),
        )
        .unwrap();

        client.query(&a_query("again.example.")).await.unwrap();
        client.query(&a_query("again.example.")).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(client.cache_stats().await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_ip() {
        let (addr, _) = spawn_upstream(Ipv4Addr::new(192, 0, 2, 10)).await;
        let client = DnsClient::new(
            vec![DnsServerSpec::Udp { addr }],
            ClientOptions::default(),
        )
        .unwrap();

        let mut ips = client.lookup_ip("host.example").await.unwrap();
        ips.sort();
        assert_eq!(
            ips,
            vec![
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            ]
        );

        let literal = client.lookup_ip("10.1.2.3").await.unwrap();
        assert_eq!(literal, vec![IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))]);
    }

    #[tokio::test]
    async fn test_lookup_ip_filters_ipv6() {
        let (addr, hits) = spawn_upstream(Ipv4Addr::new(192, 0, 2, 11)).await;
        let options = ClientOptions {
            filter_ipv6: true,
            ..Default::default()
        };
        let client = DnsClient::new(vec![DnsServerSpec::Udp { addr }], options).unwrap();

        let ips = client.lookup_ip("host.example.").await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11))]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let options = ClientOptions {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let client = DnsClient::new(vec![DnsServerSpec::Udp { addr }], options).unwrap();

        let err = client.query(&a_query("slow.example.")).await.unwrap_err();
        assert!(err.is_timeout());
        drop(silent);
    }

    #[tokio::test]
    async fn test_bootstrap_lookup() {
        let (addr, _) = spawn_upstream(Ipv4Addr::new(192, 0, 2, 12)).await;
        let ips = bootstrap_lookup(&[addr], "dns.example", None, DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 12))]);
    }

    #[tokio::test]
    async fn test_bootstrap_lookup_skips_silent_server() {
        // Bound but never read, queries to it go unanswered
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (good, hits) = spawn_upstream(Ipv4Addr::new(192, 0, 2, 13)).await;

        let servers = [silent.local_addr().unwrap(), good];
        let lookup = bootstrap_lookup(&servers, "dns.example", None, Duration::from_secs(2));
        let ips = tokio::time::timeout(Duration::from_secs(5), lookup)
            .await
            .expect("second bootstrap server was not tried")
            .unwrap();

        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 13))]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(silent);
    }

    #[tokio::test]
    async fn test_bootstrap_lookup_all_silent() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let servers = [silent.local_addr().unwrap()];

        let err = bootstrap_lookup(&servers, "dns.example", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_filter_aaaa_records() {
        let name = Name::from_str("example.com.").unwrap();
        let mut message = Message::new();
        message.set_id(12345);
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
        message.add_answer(Record::from_rdata(
            name,
            300,
            RData::AAAA(AAAA(Ipv6Addr::new(
                0x2606, 0x2800, 0x220, 0x1, 0x248, 0x1893, 0x25c8, 0x1946,
            ))),
        ));

        let filtered = filter_aaaa_records(&message.to_vec().unwrap()).unwrap();
        let filtered = Message::from_vec(&filtered).unwrap();

        assert_eq!(filtered.id(), 12345);
        assert_eq!(filtered.answers().len(), 1);
        assert_eq!(filtered.answers()[0].record_type(), RecordType::A);
    }
}
