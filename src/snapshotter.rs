//! # Snapshotter
//!
//! The core backup loop: a depth-first walk of each configured root,
//! per-file classification against the manifest's current state, and
//! encode-then-commit discipline. Everything here is deliberately
//! sequential — the engine is single-process, primarily single-threaded
//! — so a single pass is enough to reason about ordering.

use crate::backend::BlobStore;
use crate::backup_store::{BackupStore, BlobKind};
use crate::chain;
use crate::config::BackupSetConfig;
use crate::diff;
use crate::error::{EngineError, Result};
use crate::hasher;
use crate::manifest::{BlobRecord, Entry, Manifest};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Tallies produced by one run, for the CLI's summary line.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotStats {
    pub files_scanned: u64,
    pub files_new: u64,
    pub files_changed_diff: u64,
    pub files_changed_base: u64,
    pub files_metadata_only: u64,
    pub files_unchanged: u64,
    pub files_deleted: u64,
    pub files_failed: u64,
    pub bytes_read: u64,
}

struct FileStat {
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
}

#[cfg(unix)]
fn stat(path: &Path) -> Result<FileStat> {
    use std::os::unix::fs::MetadataExt;
    let metadata = std::fs::symlink_metadata(path)?;
    Ok(FileStat {
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        size: metadata.len(),
        mtime: metadata.mtime(),
    })
}

#[cfg(not(unix))]
fn stat(path: &Path) -> Result<FileStat> {
    let metadata = std::fs::symlink_metadata(path)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(FileStat {
        mode: 0,
        uid: 0,
        gid: 0,
        size: metadata.len(),
        mtime,
    })
}

/// Runs one backup pass over `set`'s configured roots, using `manifest` for
/// classification/history and `backup_store` for blob encode. `cancel` is
/// polled between files; when set, the loop finishes the file in flight and
/// returns early without tombstoning or committing. The caller's state is
/// left exactly where the last checkpoint commit left it — cancellation
/// discards whatever this run saw past that point rather than recording it
/// as a pass over the whole tree.
pub fn run(
    manifest: &mut Manifest,
    store: &dyn BlobStore,
    backup_store: &BackupStore,
    set: &BackupSetConfig,
    set_name: &str,
    cancel: &AtomicBool,
) -> Result<SnapshotStats> {
    let exclusions = set.compiled_exclusions(set_name)?;
    let mut stats = SnapshotStats::default();
    let mut seen: HashSet<String> = HashSet::new();

    let mut files_since_checkpoint = 0usize;
    let mut last_checkpoint = Instant::now();
    let mut cancelled = false;

    'roots: for root in &set.directories {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break 'roots;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let path_str = path.to_string_lossy().to_string();

            if is_excluded(&path_str, &exclusions) {
                continue;
            }
            seen.insert(path_str.clone());

            stats.files_scanned += 1;
            match process_file(manifest, backup_store, path, &path_str, set.options.diff_margin) {
                Ok(Outcome::New { bytes }) => {
                    stats.files_new += 1;
                    stats.bytes_read += bytes;
                    files_since_checkpoint += 1;
                }
                Ok(Outcome::ChangedDiff { bytes }) => {
                    stats.files_changed_diff += 1;
                    stats.bytes_read += bytes;
                    files_since_checkpoint += 1;
                }
                Ok(Outcome::ChangedBase { bytes }) => {
                    stats.files_changed_base += 1;
                    stats.bytes_read += bytes;
                    files_since_checkpoint += 1;
                }
                Ok(Outcome::MetadataOnly) => {
                    stats.files_metadata_only += 1;
                    files_since_checkpoint += 1;
                }
                Ok(Outcome::Unchanged) => {
                    stats.files_unchanged += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path_str, error = %e, "skipping file after failure");
                    stats.files_failed += 1;
                }
            }

            if should_checkpoint(
                files_since_checkpoint,
                last_checkpoint,
                set.options.checkpoint_every_files,
                set.options.checkpoint_every_secs,
            ) {
                manifest.commit(store, set.options.max_manifest_versions)?;
                files_since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }
        }
    }

    if cancelled {
        // The walk stopped partway through the tree, so `seen` doesn't cover
        // every live path. Tombstoning the rest here would mark untouched
        // files as deleted, and committing would persist that. Leave the
        // manifest at its last checkpoint and let the next run pick up
        // where this one left off.
        return Ok(stats);
    }

    // Tombstone every previously-live path that wasn't walked this run.
    for path in manifest.all_paths()? {
        if seen.contains(&path) {
            continue;
        }
        if let Some(prior) = manifest.latest_entry(&path)? {
            if !prior.is_tombstone() {
                manifest.tombstone(&path)?;
                stats.files_deleted += 1;
            }
        }
    }

    manifest.commit(store, set.options.max_manifest_versions)?;
    Ok(stats)
}

enum Outcome {
    New { bytes: u64 },
    ChangedDiff { bytes: u64 },
    ChangedBase { bytes: u64 },
    MetadataOnly,
    Unchanged,
}

/// Classifies and processes a single path, with one bounded retry if the
/// file is caught mid-write (size or mtime shifts between the two stats
/// taken around the read).
fn process_file(
    manifest: &mut Manifest,
    backup_store: &BackupStore,
    path: &Path,
    path_str: &str,
    diff_margin: f64,
) -> Result<Outcome> {
    const MAX_ATTEMPTS: usize = 2;

    for attempt in 1..=MAX_ATTEMPTS {
        match try_process_file(manifest, backup_store, path, path_str, diff_margin) {
            Err(e) if is_file_race(&e) && attempt < MAX_ATTEMPTS => {
                tracing::warn!(path = %path_str, "file changed mid-read, retrying");
                continue;
            }
            other => return other,
        }
    }
    unreachable!("loop always returns by the final attempt")
}

fn is_file_race(err: &crate::error::ButError) -> bool {
    matches!(err, crate::error::ButError::Engine(EngineError::FileRace { .. }))
}

fn try_process_file(
    manifest: &mut Manifest,
    backup_store: &BackupStore,
    path: &Path,
    path_str: &str,
    diff_margin: f64,
) -> Result<Outcome> {
    let before = stat(path)?;
    let content = std::fs::read(path)?;
    let after = stat(path)?;
    if before.size != after.size || before.mtime != after.mtime {
        return Err(EngineError::FileRace {
            path: PathBuf::from(path_str),
        }
        .into());
    }

    let sha = hasher::hash_bytes(&content);
    let prior = manifest.latest_entry(path_str)?;

    match &prior {
        None => new_base_entry(manifest, backup_store, path_str, &content, sha, &after)
            .map(|bytes| Outcome::New { bytes }),
        Some(prior) if prior.is_tombstone() => {
            new_base_entry(manifest, backup_store, path_str, &content, sha, &after)
                .map(|bytes| Outcome::New { bytes })
        }
        Some(prior) => {
            if prior.sha.as_deref() == Some(sha.as_str()) {
                if prior.mode != after.mode
                    || prior.uid != after.uid
                    || prior.gid != after.gid
                    || prior.mtime != after.mtime
                {
                    manifest.insert(Entry {
                        path: path_str.to_string(),
                        commit_time: 0,
                        sha: Some(sha),
                        mode: after.mode,
                        uid: after.uid,
                        gid: after.gid,
                        size: after.size,
                        mtime: after.mtime,
                    })?;
                    Ok(Outcome::MetadataOnly)
                } else {
                    Ok(Outcome::Unchanged)
                }
            } else {
                changed_entry(
                    manifest,
                    backup_store,
                    path_str,
                    &content,
                    sha,
                    prior.sha.clone().expect("non-tombstone prior has a sha"),
                    &after,
                    diff_margin,
                )
            }
        }
    }
}

fn new_base_entry(
    manifest: &mut Manifest,
    backup_store: &BackupStore,
    path_str: &str,
    content: &[u8],
    sha: String,
    meta: &FileStat,
) -> Result<u64> {
    if manifest.get_blob(&sha)?.is_none() {
        let (blob_addr, wrapped) = backup_store.save(content, BlobKind::Base)?;
        manifest.put_blob(&BlobRecord {
            sha: sha.clone(),
            blob_addr,
            is_diff: false,
            parent_sha: None,
            wrapped_key: wrapped.as_ref().map(|w| w.wrapped_key.clone()),
            iv: wrapped.as_ref().map(|w| w.iv.to_vec()),
        })?;
    } else {
        tracing::debug!(path = %path_str, sha = %sha, "content already known, deduplicating");
    }

    manifest.insert(Entry {
        path: path_str.to_string(),
        commit_time: 0,
        sha: Some(sha),
        mode: meta.mode,
        uid: meta.uid,
        gid: meta.gid,
        size: meta.size,
        mtime: meta.mtime,
    })?;
    Ok(content.len() as u64)
}

#[allow(clippy::too_many_arguments)]
fn changed_entry(
    manifest: &mut Manifest,
    backup_store: &BackupStore,
    path_str: &str,
    content: &[u8],
    sha: String,
    prior_sha: String,
    meta: &FileStat,
    diff_margin: f64,
) -> Result<Outcome> {
    if manifest.get_blob(&sha)?.is_some() {
        tracing::debug!(path = %path_str, sha = %sha, "changed content matches known blob, deduplicating");
        manifest.insert(Entry {
            path: path_str.to_string(),
            commit_time: 0,
            sha: Some(sha),
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            size: meta.size,
            mtime: meta.mtime,
        })?;
        return Ok(Outcome::ChangedBase { bytes: content.len() as u64 });
    }

    let prior_plaintext = chain::resolve_for_path(manifest, backup_store, &prior_sha, Some(path_str))?;
    let patch_bytes = diff::diff(&prior_plaintext, content)?;

    let outcome = if diff::worth_diffing(patch_bytes.len(), content.len(), diff_margin) {
        let (blob_addr, wrapped) = backup_store.save(&patch_bytes, BlobKind::Diff)?;
        manifest.put_blob(&BlobRecord {
            sha: sha.clone(),
            blob_addr,
            is_diff: true,
            parent_sha: Some(prior_sha),
            wrapped_key: wrapped.as_ref().map(|w| w.wrapped_key.clone()),
            iv: wrapped.as_ref().map(|w| w.iv.to_vec()),
        })?;
        Outcome::ChangedDiff { bytes: content.len() as u64 }
    } else {
        let (blob_addr, wrapped) = backup_store.save(content, BlobKind::Base)?;
        manifest.put_blob(&BlobRecord {
            sha: sha.clone(),
            blob_addr,
            is_diff: false,
            parent_sha: None,
            wrapped_key: wrapped.as_ref().map(|w| w.wrapped_key.clone()),
            iv: wrapped.as_ref().map(|w| w.iv.to_vec()),
        })?;
        Outcome::ChangedBase { bytes: content.len() as u64 }
    };

    manifest.insert(Entry {
        path: path_str.to_string(),
        commit_time: 0,
        sha: Some(sha),
        mode: meta.mode,
        uid: meta.uid,
        gid: meta.gid,
        size: meta.size,
        mtime: meta.mtime,
    })?;

    Ok(outcome)
}

fn is_excluded(path: &str, exclusions: &[Regex]) -> bool {
    exclusions.iter().any(|re| re.is_match(path))
}

fn should_checkpoint(
    files_since: usize,
    last_checkpoint: Instant,
    every_files: usize,
    every_secs: u64,
) -> bool {
    (every_files > 0 && files_since >= every_files)
        || (every_secs > 0 && last_checkpoint.elapsed() >= Duration::from_secs(every_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::config::{BackendConfig, BackupOptions, BackupSetConfig, CompressionKind};
    use std::fs;

    fn set_config(dir: &Path) -> BackupSetConfig {
        BackupSetConfig {
            private_key_filename: None,
            exclusions: vec![r".*\.skip$".to_string()],
            directories: vec![dir.to_path_buf()],
            protocol: BackendConfig::Local {
                location: dir.join("store"),
            },
            options: BackupOptions {
                max_manifest_versions: 10,
                use_encryption: false,
                use_compression: false,
                compression: CompressionKind::None,
                zstd_level: 3,
                diff_margin: diff::DEFAULT_DIFF_MARGIN,
                checkpoint_every_files: 0,
                checkpoint_every_secs: 0,
            },
        }
    }

    fn harness() -> (tempfile::TempDir, LocalBackend, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("store");
        let backend = LocalBackend::new(&store_dir).unwrap();
        (dir, backend, store_dir)
    }

    #[test]
    fn first_run_creates_base_entries_and_second_run_dedups() {
        let (dir, backend, _store_dir) = harness();
        fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        fs::write(dir.path().join("skip.skip"), b"ignored").unwrap();

        let set = set_config(dir.path());
        let scratch = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::open(&backend, scratch.path()).unwrap();
        let backup_store = BackupStore::new(&backend, &set.options, None, None, Default::default());
        let cancel = AtomicBool::new(false);

        let stats = run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();
        assert_eq!(stats.files_new, 1);
        assert_eq!(stats.files_scanned, 1);

        let stats2 = run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();
        assert_eq!(stats2.files_unchanged, 1);
    }

    #[test]
    fn content_change_produces_diff_entry() {
        let (dir, backend, _store_dir) = harness();
        let path = dir.path().join("a.txt");
        fs::write(&path, vec![b'a'; 4096]).unwrap();

        let set = set_config(dir.path());
        let scratch = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::open(&backend, scratch.path()).unwrap();
        let backup_store = BackupStore::new(&backend, &set.options, None, None, Default::default());
        let cancel = AtomicBool::new(false);

        run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();

        let mut changed = vec![b'a'; 4096];
        changed[0] = b'b';
        fs::write(&path, &changed).unwrap();

        let stats = run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();
        assert_eq!(stats.files_changed_diff, 1);

        let path_str = path.to_string_lossy().to_string();
        let entry = manifest.latest_entry(&path_str).unwrap().unwrap();
        let record = manifest.get_blob(entry.sha.as_deref().unwrap()).unwrap().unwrap();
        assert!(record.is_diff);
    }

    #[test]
    fn deleted_file_is_tombstoned() {
        let (dir, backend, _store_dir) = harness();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"content").unwrap();

        let set = set_config(dir.path());
        let scratch = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::open(&backend, scratch.path()).unwrap();
        let backup_store = BackupStore::new(&backend, &set.options, None, None, Default::default());
        let cancel = AtomicBool::new(false);

        run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();
        fs::remove_file(&path).unwrap();

        let stats = run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();
        assert_eq!(stats.files_deleted, 1);

        let path_str = path.to_string_lossy().to_string();
        let entry = manifest.latest_entry(&path_str).unwrap().unwrap();
        assert!(entry.is_tombstone());
    }
}
