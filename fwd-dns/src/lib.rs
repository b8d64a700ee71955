//! fwd-dns - upstream DNS client with multi-protocol support
//!
//! This crate provides the outbound half of a DNS forwarder:
//! - UDP (traditional DNS)
//! - TCP
//! - DoH (DNS over HTTPS)
//! - DoT (DNS over TLS)
//!
//! Features:
//! - Configurable upstream selection strategies (first-reply, round-robin, random)
//! - Optional TTL-based response caching
//! - Bootstrap servers for resolving encrypted upstream hostnames
//! - Helpers for building queries and reading answers
//!
//! # Example
//!
//! ```no_run
//! use fwd_dns::{ClientOptions, DnsClient, UpstreamStrategy, parse_dns_server};
//!
//! # async fn example() -> fwd_dns::Result<()> {
//! let upstream = parse_dns_server("https://dns10.quad9.net/dns-query")?;
//!
//! let client = DnsClient::new(
//!     vec![upstream],
//!     ClientOptions {
//!         strategy: UpstreamStrategy::RoundRobin,
//!         cache_size: 1000,
//!         bootstrap: vec!["9.9.9.10:53".parse().unwrap()],
//!         ..Default::default()
//!     },
//! )?;
//!
//! let addrs = client.lookup_ip("example.com").await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod client;
mod config;
pub mod error;
mod msg;

pub use cache::{CacheStats, DnsCache};
pub use client::{ClientOptions, DnsClient, DEFAULT_TIMEOUT};
pub use config::{
    parse_dns_server, parse_socket_addr, DnsServerSpec, UpstreamStrategy, DNS_PORT, DOT_PORT,
};
pub use error::{Error, Result};
pub use msg::{build_query, reverse_addr, ResolvedIps};
