use thiserror::Error;

/// Transport failures. Any of these destroys the affected connection; none
/// of them is retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid MOO server address '{0}' (expected host:port)")]
    InvalidAddress(String),

    #[error("connection already destroyed")]
    Destroyed,

    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("socket write failed: {0}")]
    Write(#[source] std::io::Error),
}
