//! Closed error taxonomy shared by every store operation.
//!
//! Kinds are stable; messages are not. Protocol adapters translate kinds to
//! their wire equivalents (`NFS3ERR_*`, `NFS4ERR_*`, `STATUS_*`), so nothing
//! protocol-specific belongs here.

use thiserror::Error;

use crate::locks::ByteRangeLock;

/// Result of store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The id, name, or share does not exist.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// The handle bytes are malformed or carry an unknown version.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Bad name, cross-share move, wrong type for the operation, empty
    /// symlink target and similar caller mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A directory was passed to a non-directory operation.
    #[error("is a directory: {path}")]
    IsDirectory { path: String },

    /// A non-directory was passed to a directory operation.
    #[error("not a directory: {path}")]
    NotDirectory { path: String },

    /// Directory removal or replacement with children present.
    #[error("directory not empty: {path}")]
    NotEmpty { path: String },

    /// Creation under an occupied name.
    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    /// Permission, sticky-bit, or root-only check failed.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A byte-range lock or I/O interlock conflict. Carries the blocking
    /// record so protocol layers can report the owner precisely.
    #[error("locked by session {} at [{}, len {}]", .conflict.session_id, .conflict.offset, .conflict.length)]
    Locked { conflict: ByteRangeLock },

    /// The operation is not supported by this store.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Unexpected backend failure. `retryable` marks transient conditions
    /// (serialization conflicts, deadlocks, lost connections) that are safe
    /// to retry because they never observably committed.
    #[error("io error: {message}")]
    Io { message: String, retryable: bool },

    /// Backend storage is full.
    #[error("no space left on the backing store")]
    NoSpace,

    /// The caller's cancellation token fired. Already-committed operations
    /// stay committed; the interrupted one rolled back.
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn not_found(path: impl Into<String>) -> Self {
        StoreError::NotFound { path: path.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    pub fn access_denied(reason: impl Into<String>) -> Self {
        StoreError::AccessDenied(reason.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        StoreError::Io { message: message.into(), retryable: false }
    }

    /// Transient backend failure; callers may retry.
    pub fn retryable_io(message: impl Into<String>) -> Self {
        StoreError::Io { message: format!("{} (retry)", message.into()), retryable: true }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io { retryable: true, .. })
    }
}
