//! Error types for the membership subsystem.

use thiserror::Error;

use crate::validate::ValidationError;

/// Result type alias for membership operations.
pub type MembershipResult<T> = Result<T, MembershipError>;

/// Errors raised by gossip providers and the membership subsystem.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("gossip provider not started")]
    NotStarted,

    #[error("gossip provider already started")]
    AlreadyStarted,

    #[error("gossip provider has been shut down")]
    Shutdown,

    #[error("member name {0:?} is already in use")]
    NameConflict(String),

    #[error("failed to join cluster: {0}")]
    JoinFailed(String),

    #[error("merge rejected: {0}")]
    MergeRejected(#[from] ValidationError),

    #[error("unknown member: {0}")]
    UnknownMember(String),
}
