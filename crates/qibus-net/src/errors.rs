//! Network error types.
//!
//! Variants carry strings so the type stays `Clone`: a single stream
//! failure fans out to every handler's closer on the same endpoint.

use qibus_proto::ProtocolError;
use thiserror::Error;

/// Errors produced by transports and the endpoint multiplexer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetError {
    /// The address could not be parsed as `scheme://rest`.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The URL scheme names no known transport.
    #[error("unknown url scheme: {0}")]
    UnsupportedScheme(String),

    /// Establishing a connection failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Codec failure while framing messages.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The endpoint or stream is closed.
    #[error("endpoint closed")]
    Closed,

    /// No handler is registered under this id.
    #[error("invalid handler id: {0}")]
    HandlerNotFound(u64),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
