//! Server error types.

use qibus_net::NetError;
use qibus_proto::ProtocolError;
use thiserror::Error;

/// Errors produced by the router and object runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerError {
    /// Transport or dispatch failure.
    #[error(transparent)]
    Net(#[from] NetError),

    /// Codec failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No service registered under this id.
    #[error("unknown service: {0}")]
    UnknownService(u32),

    /// No object registered under this id within the service.
    #[error("unknown object: {0}")]
    UnknownObject(u32),

    /// The object has no handler for this action uid.
    #[error("unknown action: {0}")]
    UnknownAction(u32),

    /// No stored property with this name.
    #[error("unknown property: {0}")]
    UnknownProperty(String),

    /// No signal with this uid in the meta-object.
    #[error("unknown signal: {0}")]
    UnknownSignal(u32),

    /// A meta-object call carried a mismatched object id.
    #[error("wrong object id: got {got}, hosting {expected}")]
    WrongObjectId {
        /// The id this object was activated with.
        expected: u32,
        /// The id carried in the call payload.
        got: u32,
    },

    /// The connection has not completed the authentication handshake.
    #[error("connection is not authenticated")]
    NotAuthenticated,

    /// A user action handler failed; carries its message.
    #[error("{0}")]
    Action(String),

    /// Server configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Service directory failure.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Errors of the service directory state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// No live service with this name.
    #[error("service not found: {0}")]
    NotFound(String),

    /// No service registered under this id.
    #[error("service id not found: {0}")]
    IdNotFound(u32),

    /// The name is already registered (staging or live).
    #[error("service name already registered: {0}")]
    DuplicateName(String),

    /// The service record failed validation.
    #[error("invalid service info: {0}")]
    InvalidInfo(String),

    /// `service_ready` on an id that is not staging.
    #[error("service id not staging: {0}")]
    NotStaging(u32),

    /// `update_service_info` may not change a live service's name.
    #[error("service name is immutable: {got} (expected {expected})")]
    NameMismatch {
        /// The registered name.
        expected: String,
        /// The name in the update.
        got: String,
    },
}
