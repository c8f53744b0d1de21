//! # Diff Chain Resolution
//!
//! Shared by the Snapshotter (to recover a prior version's plaintext before
//! diffing against it) and the Restorer (to reconstruct a target version):
//! walks the `blobs` table's `parent_sha` pointers from a content SHA back
//! to a base blob, then applies patches forward in order. The chain
//! followed here is a chain of blob SHAs, not of manifest rows — the same
//! content can be reached starting from any path whose history happens to
//! reference a link along the way, which is what makes cross-path
//! deduplication and diffing-against-another-path's-content both sound.

use crate::backup_store::BackupStore;
use crate::diff;
use crate::error::{EngineError, RestoreError, Result};
use crate::hasher;
use crate::manifest::Manifest;
use std::path::PathBuf;

/// A well-formed history never approaches this depth; hitting it means the
/// manifest is corrupt rather than that the chain is legitimately long.
const MAX_CHAIN_DEPTH: usize = 4096;

/// Reconstructs the plaintext addressed by content SHA `sha`, verifying the
/// result hashes back to `sha`.
pub fn resolve(manifest: &Manifest, backup_store: &BackupStore, sha: &str) -> Result<Vec<u8>> {
    resolve_for_path(manifest, backup_store, sha, None)
}

/// As [`resolve`], but attributes a `ChainTooLong` failure to `path` for a
/// clearer restore-time error.
pub fn resolve_for_path(
    manifest: &Manifest,
    backup_store: &BackupStore,
    sha: &str,
    path: Option<&str>,
) -> Result<Vec<u8>> {
    let mut links = Vec::new();
    let mut current = sha.to_string();

    loop {
        let record = manifest.get_blob(&current)?.ok_or_else(|| {
            EngineError::NotFound(format!("blob record for content {current}"))
        })?;
        let is_diff = record.is_diff;
        let parent = record.parent_sha.clone();
        links.push(record);

        if !is_diff {
            break;
        }
        if links.len() > MAX_CHAIN_DEPTH {
            return Err(RestoreError::ChainTooLong {
                path: PathBuf::from(path.unwrap_or(sha)),
            }
            .into());
        }
        current = parent.ok_or_else(|| {
            EngineError::Corrupt(format!("diff blob {current} has no parent_sha"))
        })?;
    }

    // `links` was built target-first, walking toward the base; apply in the
    // opposite order so the base is decoded first and patches apply forward.
    let mut iter = links.into_iter().rev();
    let base = iter.next().expect("loop always pushes at least one link");
    let mut plaintext = backup_store.load(
        &base.blob_addr,
        base.wrapped_key.as_deref(),
        base.iv.as_deref(),
    )?;

    for link in iter {
        let patch_bytes = backup_store.load(
            &link.blob_addr,
            link.wrapped_key.as_deref(),
            link.iv.as_deref(),
        )?;
        plaintext = diff::patch(&plaintext, &patch_bytes)?;
    }

    let actual = hasher::hash_bytes(&plaintext);
    if actual != sha {
        return Err(EngineError::Corrupt(format!(
            "resolved chain for {sha} produced content addressed by {actual} instead"
        ))
        .into());
    }

    Ok(plaintext)
}
