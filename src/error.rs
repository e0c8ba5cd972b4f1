use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error represents the failure classes surfaced by the proxy
#[derive(Debug, Error)]
pub enum Error {
    /// The peer violated the SOCKS5 negotiation
    #[error("{0}")]
    Protocol(String),

    /// Upstream resolution or connection failure
    #[error("{0}")]
    Network(String),

    /// Cipher or compression stream failure
    #[error("{0}")]
    Codec(String),

    /// A listener could not be bound
    #[error("could not bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// The admin surface was used after the dispatcher stopped
    #[error("proxy service has shut down")]
    Shutdown,

    /// Transport-level I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}
