//! The error taxonomy of the session runtime.
//!
//! Validation and authorization errors fail fast at the RPC edge, infrastructure
//! failures never abort unrelated sessions, and observer failures (recorder,
//! event bus) are logged but never fail the primary flow.

use thiserror::Error;

/// All failures the core surfaces to its callers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing ids, invalid terminal size, invalid game. Rejected synchronously.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Session, game or save does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The user already has an active session, or the spectator is already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Admin-only action attempted by a non-admin.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Transient infrastructure failure after exhausted retries.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Save checksum mismatch or truncated blob.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// PTY allocation or process spawn failed.
    #[error("resource failure: {0}")]
    Resource(String),

    /// Filesystem level failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation. Fatal to the affected session only.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
