//! # Error Types
//!
//! Defines a structured error hierarchy for the backup engine using `thiserror`.
//! Each error variant carries enough context for meaningful diagnostics without
//! exposing internal implementation details to the caller.
//!
//! [`EngineError`] carries the failure *kinds* the core engine reasons about
//! (transport, corruption, races, cancellation) independently of *where* the
//! failure happened; the other sub-enums carry the where. A path being
//! excluded by a configured pattern is deliberately not represented as an
//! error variant here — it's an internal classification signal inside the
//! snapshotter, never an `Err` a caller observes.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type encompassing all failure modes in the backup system.
#[derive(Error, Debug)]
pub enum ButError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ConfigError {
    #[error("config file not found (searched: {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {message}")]
    Validation { message: String },

    #[error("backup set '{name}' has invalid exclusion pattern '{pattern}': {source}")]
    InvalidExclusion {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("backup set '{name}' references non-existent directory: {path}")]
    MissingSource { name: String, path: PathBuf },
}

/// Errors during the backup process.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum BackupError {
    #[error("source directory does not exist: {0}")]
    SourceNotFound(PathBuf),

    #[error("failed to hash file {path}: {source}")]
    HashFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compression failed for {path}: {source}")]
    CompressionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to commit manifest: {0}")]
    ManifestWrite(#[source] std::io::Error),
}

/// Errors during restoration.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum RestoreError {
    #[error("no entry for '{pattern}' at or before the requested instant")]
    NoMatchingEntries { pattern: String },

    #[error("blob missing from repository: {hash}")]
    BlobMissing { hash: String },

    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    IntegrityFailure {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("target directory already exists and --yes not specified: {0}")]
    TargetExists(PathBuf),

    #[error("decompression failed: {0}")]
    DecompressionFailed(#[source] std::io::Error),

    #[error("diff chain for {path} exceeded the maximum resolvable depth")]
    ChainTooLong { path: PathBuf },
}

/// Repository structure and metadata errors.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum RepoError {
    #[error("repository not initialized at {0}")]
    NotInitialized(PathBuf),

    #[error("repository already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("corrupted repository: {message}")]
    Corrupted { message: String },

    #[error("lock held by another running backup: {0}")]
    Locked(PathBuf),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum CryptoError {
    #[error("encryption failed: invalid key length")]
    InvalidKeyLength,

    #[error("decryption failed: authentication tag mismatch (corrupted ciphertext or wrong key)")]
    DecryptionFailed,

    #[error("RSA key wrap/unwrap failed: {0}")]
    KeyWrap(String),

    #[error("blob is encrypted but the backup set has no private key configured")]
    MissingKey,
}

/// Failure kinds the engine core reasons about directly, independent of
/// which subsystem observed them.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum EngineError {
    #[error("blob store transport error: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("a file changed on disk while it was being backed up: {path}")]
    FileRace { path: PathBuf },

    #[error("cancellation requested")]
    CancelRequested,
}

pub type Result<T> = std::result::Result<T, ButError>;
