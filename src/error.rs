// src/error.rs

//! Error types for the Conary core

use crate::label::LabelParseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Failed to initialize database: {0}")]
    InitError(String),

    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    #[error("Invalid version: {0}")]
    VersionParse(String),

    #[error("Invalid flavor: {0}")]
    FlavorParse(String),

    #[error(transparent)]
    LabelParse(#[from] LabelParseError),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Trove not found: {0}")]
    TroveNotFound(String),

    #[error("Trove missing: {0}")]
    TroveMissing(String),

    #[error("Unresolved dependencies: {0}")]
    DependencyFailure(String),

    #[error("File conflict: {0}")]
    FileConflict(String),

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error("Conflicting flags in strict merge: {0}")]
    ConflictingFlags(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("OpenPGP error: {0}")]
    OpenPgp(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tag handler error: {0}")]
    TagHandler(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error came from a busy or locked backend and may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
