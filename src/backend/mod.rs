//! # Blob Store Interface
//!
//! The pluggable storage contract the core engine requires from any backend:
//! content-addressed blob put/get/exists/list, a parallel timestamped
//! manifest namespace with version retention, and an advisory run lock.
//! Two implementations ship here: [`local::LocalBackend`] (plain
//! filesystem, stage-then-rename) and [`object::ObjectBackend`] (any
//! `object_store`-supported remote, relying on single-object PUT atomicity).
//!
//! Every `put`/`manifest_put` must be atomic: a concurrent or later `exists`
//! observes the write only once it is fully durable. Both implementations
//! honor this by staging to a temporary name and renaming/re-uploading under
//! the final name only once the payload is completely written.

pub mod local;
pub mod object;

use crate::error::Result;
use std::path::Path;

/// A held advisory lock for the duration of a backup run. Concurrent
/// backups on the *same* set are rejected while a lock is held; dropping
/// the guard releases it.
pub trait LockGuard: Send {}

/// Storage backend contract required by the backup/restore core.
///
/// Implementors must guarantee atomic publish semantics for both `put` and
/// `manifest_put`: no partial payload is ever observable via `exists`/`get`.
pub trait BlobStore: Send + Sync {
    /// Returns whether a blob with this SHA-256 hash is already durable.
    fn exists(&self, sha: &str) -> Result<bool>;

    /// Publishes `data` under `sha`, atomically. If a blob already exists
    /// under this name, the call is a benign no-op when `data` is
    /// byte-identical to what's stored (idempotent retry after a crash);
    /// a mismatch is a `Corrupt` error.
    fn put(&self, sha: &str, data: &[u8]) -> Result<()>;

    /// Reads the full contents of a blob. Fails with a `NotFound`-flavored
    /// error if the blob does not exist.
    fn get(&self, sha: &str) -> Result<Vec<u8>>;

    /// Lists all blob hashes whose hex representation starts with `prefix`.
    /// Used by garbage collection, out of scope for the backup/restore path.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Removes a blob. Only ever invoked by garbage collection.
    fn delete(&self, sha: &str) -> Result<()>;

    /// Publishes manifest bytes under `name` (a timestamped identifier, not
    /// a content hash), atomically, and advances the "latest manifest"
    /// alias to point at it.
    fn manifest_put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Reads manifest bytes previously published under `name`.
    fn manifest_get(&self, name: &str) -> Result<Vec<u8>>;

    /// Lists all published manifest names, independent of the alias.
    fn manifest_list(&self) -> Result<Vec<String>>;

    /// Deletes a specific manifest version. Used to enforce
    /// `max_manifest_versions` retention.
    fn manifest_delete(&self, name: &str) -> Result<()>;

    /// Resolves the "latest manifest" alias to a concrete name, if any
    /// manifest has ever been published for this backend.
    fn manifest_latest(&self) -> Result<Option<String>>;

    /// Acquires the run-exclusive advisory lock. Returns an error if
    /// another backup is already running against this backend.
    fn acquire_lock(&self) -> Result<Box<dyn LockGuard>>;
}

/// Formats a RFC 3339-free, sortable manifest name from a commit instant
/// expressed in Unix nanoseconds, matching the local backend's on-disk
/// naming convention.
pub fn manifest_name(unix_nanos: u128) -> String {
    format!("manifest.{unix_nanos}")
}

/// Extracts the Unix-nanosecond instant encoded in a manifest name produced
/// by [`manifest_name`], for sorting/retention purposes.
pub fn manifest_name_instant(name: &str) -> Option<u128> {
    name.strip_prefix("manifest.")?.parse().ok()
}

/// Convenience: the two-level shard directory/prefix for a content hash,
/// shared by every backend's blob layout.
pub fn shard(sha: &str) -> (&str, &str) {
    crate::hasher::shard_path(sha)
}

/// A backend binding resolved from a backup set's `protocol` configuration.
pub enum Backend {
    Local(local::LocalBackend),
    Object(object::ObjectBackend),
}

impl Backend {
    pub fn local(root: &Path) -> Result<Self> {
        Ok(Backend::Local(local::LocalBackend::new(root)?))
    }

    /// Resolves a backup set's `protocol` configuration into a concrete
    /// backend binding.
    pub fn from_config(cfg: &crate::config::BackendConfig) -> Result<Self> {
        match cfg {
            crate::config::BackendConfig::Local { location } => Self::local(location),
            crate::config::BackendConfig::S3 {
                bucket,
                prefix,
                region,
                endpoint,
            } => {
                use object_store::aws::AmazonS3Builder;
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                let store = builder
                    .build()
                    .map_err(|e| crate::error::EngineError::Transport(e.to_string()))?;
                Ok(Backend::Object(object::ObjectBackend::new(
                    std::sync::Arc::new(store),
                    prefix.clone(),
                )?))
            }
        }
    }
}

impl BlobStore for Backend {
    fn exists(&self, sha: &str) -> Result<bool> {
        match self {
            Backend::Local(b) => b.exists(sha),
            Backend::Object(b) => b.exists(sha),
        }
    }
    fn put(&self, sha: &str, data: &[u8]) -> Result<()> {
        match self {
            Backend::Local(b) => b.put(sha, data),
            Backend::Object(b) => b.put(sha, data),
        }
    }
    fn get(&self, sha: &str) -> Result<Vec<u8>> {
        match self {
            Backend::Local(b) => b.get(sha),
            Backend::Object(b) => b.get(sha),
        }
    }
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            Backend::Local(b) => b.list(prefix),
            Backend::Object(b) => b.list(prefix),
        }
    }
    fn delete(&self, sha: &str) -> Result<()> {
        match self {
            Backend::Local(b) => b.delete(sha),
            Backend::Object(b) => b.delete(sha),
        }
    }
    fn manifest_put(&self, name: &str, data: &[u8]) -> Result<()> {
        match self {
            Backend::Local(b) => b.manifest_put(name, data),
            Backend::Object(b) => b.manifest_put(name, data),
        }
    }
    fn manifest_get(&self, name: &str) -> Result<Vec<u8>> {
        match self {
            Backend::Local(b) => b.manifest_get(name),
            Backend::Object(b) => b.manifest_get(name),
        }
    }
    fn manifest_list(&self) -> Result<Vec<String>> {
        match self {
            Backend::Local(b) => b.manifest_list(),
            Backend::Object(b) => b.manifest_list(),
        }
    }
    fn manifest_delete(&self, name: &str) -> Result<()> {
        match self {
            Backend::Local(b) => b.manifest_delete(name),
            Backend::Object(b) => b.manifest_delete(name),
        }
    }
    fn manifest_latest(&self) -> Result<Option<String>> {
        match self {
            Backend::Local(b) => b.manifest_latest(),
            Backend::Object(b) => b.manifest_latest(),
        }
    }
    fn acquire_lock(&self) -> Result<Box<dyn LockGuard>> {
        match self {
            Backend::Local(b) => b.acquire_lock(),
            Backend::Object(b) => b.acquire_lock(),
        }
    }
}
