// src/error.rs

use thiserror::Error;

/// Core error types for the Conary repository
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be decoded
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Caller broke an operation's contract (mismatched names, bad input)
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Malformed wire or text input
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid version string '{0}'")]
    InvalidVersion(String),

    #[error("Invalid flavor '{0}'")]
    InvalidFlavor(String),

    #[error("Invalid dependency '{0}'")]
    InvalidDependency(String),

    /// A file id was inserted twice into one trove
    #[error("File {file_id} is already part of trove {trove}")]
    DuplicateFile { trove: String, file_id: String },

    /// A sub-trove reference was added twice
    #[error("Duplicate trove {name}={version} included in {trove}")]
    DuplicateTrove {
        trove: String,
        name: String,
        version: String,
    },

    /// Content did not hash to the digest declared for it
    #[error("Digest mismatch for {id}: expected {expected}, got {actual}")]
    DigestMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Trove {name}={version}[{flavor}] has no trove digest")]
    TroveChecksumMissing {
        name: String,
        version: String,
        flavor: String,
    },

    #[error("Trove integrity error for {name}={version}[{flavor}]: {reason}")]
    TroveIntegrityError {
        name: String,
        version: String,
        flavor: String,
        reason: String,
    },

    #[error(
        "Trove {name}={version}[{flavor}] uses trove schema {found}, this repository understands {supported}"
    )]
    TroveSchemaError {
        name: String,
        version: String,
        flavor: String,
        found: u32,
        supported: u32,
    },

    #[error("Trove {0} is not signed")]
    MissingSignature(String),

    #[error("Trove {trove} signature trust {found} is below required {required}")]
    UntrustedSignature {
        trove: String,
        found: String,
        required: String,
    },

    /// File content needed by a trove is neither in the batch nor the store
    #[error("Contents {sha1} for file {file_id} are missing")]
    MissingContents { file_id: String, sha1: String },

    /// Commit refused by repository policy
    #[error("Commit error: {0}")]
    CommitError(String),

    /// Sub-trove reconciliation could not pick a merge base
    #[error(
        "Ambiguous merge base for {name}[{flavor}] version {version}: {candidates} removed versions, none on the same branch or parent"
    )]
    AmbiguousMerge {
        name: String,
        flavor: String,
        version: String,
        candidates: usize,
    },

    /// Foreign package installer reported failures
    #[error("Capsule operation failed: {}", .0.join("; "))]
    CapsuleError(Vec<String>),

    #[error("No installer registered for capsule kind '{0}'")]
    UnregisteredCapsule(String),

    #[error("Trove {name}={version}[{flavor}] not found")]
    TroveMissing {
        name: String,
        version: String,
        flavor: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// True for the absence errors callers may check for
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::TroveMissing { .. })
    }
}

/// Result type alias using Conary's Error type
pub type Result<T> = std::result::Result<T, Error>;
