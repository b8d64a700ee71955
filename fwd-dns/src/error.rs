//! Error types for DNS operations

use thiserror::Error;

/// Result type alias for DNS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during DNS operations
#[derive(Debug, Error)]
pub enum Error {
    /// DNS query/response error
    #[error("DNS error: {0}")]
    Dns(String),

    /// Upstream did not answer within the client timeout
    #[error("DNS query to {0} timed out")]
    Timeout(String),

    /// The resolver set is empty
    #[error("no upstream DNS servers available")]
    NoUpstreams,

    /// DNS configuration error
    #[error("DNS configuration error: {0}")]
    Config(String),

    /// Message encoding or decoding failed
    #[error("DNS message error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
