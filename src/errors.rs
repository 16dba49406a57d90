//! Abstract error kinds shared by every storage-core component.
//!
//! The core does not shape S3 XML or HTTP status codes -- that mapping
//! belongs to the (external) front-end. Every fallible operation in this
//! crate returns [`CoreError`], a closed enum of the abstract error kinds
//! from the design.

use thiserror::Error;

/// Abstract error kinds surfaced by the storage core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input failed validation before any I/O was attempted.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A bucket or object key failed validation.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// No row or no file exists for the requested entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state (e.g. non-empty bucket).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation cannot apply to a job already in a terminal state.
    #[error("already terminal: {0}")]
    AlreadyTerminal(String),

    /// The credential exists but is disabled.
    #[error("credential disabled")]
    CredentialDisabled,

    /// The credential is valid but lacks the requested permission.
    #[error("permission denied")]
    PermissionDenied,

    /// The OS CSPRNG is unavailable. Callers should treat this as fatal.
    #[error("cryptographic RNG unavailable: {0}")]
    CryptoUnavailable(String),

    /// An I/O error surfaced unmodified from the filesystem.
    #[error("I/O error: {0}")]
    IOError(String),

    /// A database error surfaced unmodified from the metadata store.
    #[error("database error: {0}")]
    DBError(String),

    /// The integrity checker found a mismatch between file and metadata.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::IOError(e.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::DBError(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
