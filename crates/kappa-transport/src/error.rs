//! Error types for the Kappa transport.

use thiserror::Error;

use crate::wire::RejectReason;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by the transport server, client, and sessions.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("channel rejected ({reason}): {message}")]
    ChannelRejected {
        reason: RejectReason,
        message: String,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("frame error: {0}")]
    Framing(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server already started")]
    AlreadyStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons an authenticator refuses a credential.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("signature does not verify")]
    BadSignature,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("authentication method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("access denied: {0}")]
    Denied(String),
}
