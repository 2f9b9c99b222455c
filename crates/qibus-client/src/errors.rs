//! Client error types.

use qibus_net::NetError;
use qibus_proto::ProtocolError;
use thiserror::Error;

/// Errors surfaced by calls, subscriptions and sessions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Transport or dispatch failure.
    #[error(transparent)]
    Net(#[from] NetError),

    /// Codec failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The call deadline expired before a reply arrived.
    #[error("call timed out")]
    Timeout,

    /// The peer acknowledged cancelling the call.
    #[error("call cancelled")]
    Cancelled,

    /// The endpoint closed while the call was pending.
    #[error("disconnected")]
    Disconnected,

    /// The peer answered with an error frame; carries the decoded message.
    #[error("remote error: {0}")]
    Remote(String),

    /// The authentication handshake failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The legacy capability exchange timed out.
    #[error("authentication timed out waiting for capabilities")]
    AuthTimeout,

    /// The server sent an authentication state outside the protocol.
    #[error("invalid authentication state: {0}")]
    AuthBadState(u32),

    /// No method with this name in the meta-object.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// No signal with this name in the meta-object.
    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    /// No property with this name in the meta-object.
    #[error("unknown property: {0}")]
    UnknownProperty(String),

    /// The directory knows no service with this name or id.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// None of a service's advertised endpoints could be reached.
    #[error("no reachable endpoint for {0}")]
    NoReachableEndpoint(String),
}
