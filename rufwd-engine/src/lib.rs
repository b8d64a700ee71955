//! Rufwd Engine
//!
//! This crate provides the orchestration core of a DNS forwarder: the
//! server lifecycle with hot reconfiguration, the query pipeline, reverse
//! lookups of client addresses and DHCP-derived local hostnames.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │   rufwd-cli     │              │  DoH / HTTP front   │   │
//! │  └────────┬────────┘              └──────────┬──────────┘   │
//! │           │                          (QueryHook)            │
//! │           └───────────────┬──────────────────┘              │
//! │                           ▼                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   rufwd-engine                         │ │
//! │  │  - Server (prepare/start/stop/reconfigure/close)       │ │
//! │  │  - Generation (query pipeline)                         │ │
//! │  │  - LocalResolvers, AutohostTable, IpsetBinder          │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Library Layer                            │
//! │  ┌─────────────────┐    ┌─────────────────┐                 │
//! │  │    fwd-dns      │    │   fwd-ipset     │                 │
//! │  │  - UDP/TCP      │    │  - netlink      │                 │
//! │  │  - DoH/DoT      │    │  - hash:ip sets │                 │
//! │  │  - Cache        │    │                 │                 │
//! │  └─────────────────┘    └─────────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod access;
pub mod autohost;
pub mod classify;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod ipset;
mod listener;
pub mod net;
pub mod ratelimit;
pub mod rdns;
pub mod resolvers;
pub mod server;

pub use access::{AccessPolicy, BlockReason};
pub use autohost::{AutohostSuffix, AutohostTable, Lease, LeaseEvent};
pub use classify::{LocallyServedNetworks, SubnetClassifier};
pub use config::{default_upstreams, ArchClass, BlockingMode, Config, ServerConfig};
pub use dhcp::{DhcpLeases, StaticLeases};
pub use error::{Error, Result};
pub use hooks::{HookRegistry, MemoryHookRegistry, QueryHook};
pub use ipset::{IpsetBackend, IpsetBinder};
pub use net::{HostNetwork, OsNetwork};
pub use resolvers::{collect_self_addrs, set_subtract, LocalResolvers};
pub use server::{IpsetOpener, Server, ServerBuilder, DEFAULT_HOOK_ID, SETTLE_DELAY};
