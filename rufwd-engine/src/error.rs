//! Error types for the forwarding engine

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, running or querying the server
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected before anything was applied
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// The autohost TLD is not a valid DNS label
    #[error("invalid autohost tld {0:?}")]
    InvalidAutohostTld(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IP set binding failed in a way that is not merely a missing capability
    #[error("ipset: {0}")]
    Ipset(String),

    /// The local PTR resolver set could not be built
    #[error("setting up resolvers: {0}")]
    ResolverSetup(String),

    /// PTR lookup returned no answers
    #[error("lookup for {arpa:?}: the answer section is empty")]
    EmptyAnswer { arpa: String },

    /// PTR lookup answered with another record type
    #[error("type checking: the response is not a ptr")]
    NotPtr,

    /// Upstream transport or timeout failure
    #[error(transparent)]
    Dns(#[from] fwd_dns::Error),

    /// A listener could not be bound
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Start called while listeners are up
    #[error("DNS server is already running")]
    AlreadyRunning,

    /// Start called without a prepared configuration
    #[error("DNS server is not prepared")]
    NotPrepared,

    /// Any failure inside the stop/prepare/start sequence
    #[error("could not reconfigure the server: {0}")]
    Reconfigure(#[source] Box<Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        match self {
            Error::InvalidConfig(_) | Error::InvalidAutohostTld(_) | Error::ConfigParse(_) => true,
            Error::Reconfigure(inner) => inner.is_config_error(),
            _ => false,
        }
    }

    /// Check if the error is an upstream timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Dns(e) if e.is_timeout())
    }
}
