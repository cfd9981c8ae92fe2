use thiserror::Error;

/// Admission-time failures. The connection is refused; the client decides
/// whether to retry after refreshing credentials.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential token provided")]
    Missing,
    #[error("credential token is invalid")]
    Invalid,
    #[error("credential token has expired")]
    Expired,
    #[error("token subject is not a known user")]
    UnknownSubject,
}

/// Join-time failures. The room is not entered and no state is mutated.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("access to document denied")]
    Denied,
    #[error("access control unavailable: {0}")]
    Unavailable(String),
}

/// A write was attempted without edit rights. The update is rejected but the
/// connection stays joined.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("write permission required")]
pub struct PermissionError;

/// A malformed update was rejected by the CRDT engine. Reported only to the
/// submitter; the authoritative state is never partially applied.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("update rejected: {0}")]
pub struct ApplyError(pub String);

/// Durable store failure. Retried on the next save trigger; never surfaced
/// to clients as an editing error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures a submitted update can hit inside the room.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("connection is not a member of this room")]
    NotInRoom,
}
