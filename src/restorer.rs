//! # Restorer
//!
//! Reconstructs historical files from the manifest: finds matching entries
//! at a point in time, resolves each one's diff chain via the Backup
//! Store, writes the recovered plaintext, and reapplies the recorded
//! mode/uid/gid/mtime. Per-path failures are logged and don't abort the
//! rest of the restore — a missing or corrupt blob for one path shouldn't
//! keep the rest of the batch from restoring.

use crate::backup_store::BackupStore;
use crate::chain;
use crate::error::Result;
use crate::manifest::{Entry, Manifest};
use filetime::FileTime;
use regex::Regex;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    pub matched: u64,
    pub restored: u64,
    pub skipped_tombstones: u64,
    pub failed: u64,
}

/// One restored (or attempted) path, reported back to the CLI for
/// per-path status lines.
pub struct RestoreOutcome {
    pub path: String,
    pub result: Result<()>,
}

/// Restores every live entry matching `pattern` at instant `at` into
/// `dest_dir`, preserving the entries' original absolute-path structure
/// relative to `dest_dir`.
pub fn restore(
    manifest: &Manifest,
    backup_store: &BackupStore,
    pattern: &Regex,
    at: i64,
    dest_dir: &Path,
) -> Result<(RestoreStats, Vec<RestoreOutcome>)> {
    let mut stats = RestoreStats::default();
    let mut outcomes = Vec::new();

    for entry in manifest.search(pattern, at)? {
        stats.matched += 1;

        if entry.is_tombstone() {
            stats.skipped_tombstones += 1;
            continue;
        }

        let result = restore_one(manifest, backup_store, &entry, dest_dir);
        match &result {
            Ok(()) => stats.restored += 1,
            Err(e) => {
                tracing::warn!(path = %entry.path, error = %e, "failed to restore path");
                stats.failed += 1;
            }
        }
        outcomes.push(RestoreOutcome {
            path: entry.path.clone(),
            result,
        });
    }

    Ok((stats, outcomes))
}

fn restore_one(
    manifest: &Manifest,
    backup_store: &BackupStore,
    entry: &Entry,
    dest_dir: &Path,
) -> Result<()> {
    let sha = entry.sha.as_deref().expect("non-tombstone entry has a sha");
    let plaintext = chain::resolve_for_path(manifest, backup_store, sha, Some(&entry.path))?;

    let dest_path = dest_dir.join(relative_path(&entry.path));
    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&dest_path, &plaintext)?;
    apply_metadata(&dest_path, entry)?;

    Ok(())
}

fn relative_path(absolute: &str) -> PathBuf {
    let path = Path::new(absolute);
    path.strip_prefix("/").map(Path::to_path_buf).unwrap_or(path.to_path_buf())
}

#[cfg(unix)]
fn apply_metadata(path: &Path, entry: &Entry) -> Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, Permissions::from_mode(entry.mode))?;
    std::os::unix::fs::chown(path, Some(entry.uid), Some(entry.gid))?;

    let mtime = FileTime::from_unix_time(entry.mtime, 0);
    filetime::set_file_mtime(path, mtime)?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_metadata(path: &Path, entry: &Entry) -> Result<()> {
    let mtime = FileTime::from_unix_time(entry.mtime, 0);
    filetime::set_file_mtime(path, mtime)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::config::{BackendConfig, BackupOptions, BackupSetConfig, CompressionKind};
    use crate::diff;
    use crate::snapshotter;
    use std::fs;
    use std::sync::atomic::AtomicBool;

    fn set_config(dir: &Path, store: &Path) -> BackupSetConfig {
        BackupSetConfig {
            private_key_filename: None,
            exclusions: vec![],
            directories: vec![dir.to_path_buf()],
            protocol: BackendConfig::Local {
                location: store.to_path_buf(),
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

    #[test]
    fn restores_base_then_diffed_content() {
        let source = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(store_dir.path()).unwrap();
        let set = set_config(source.path(), store_dir.path());

        let scratch = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::open(&backend, scratch.path()).unwrap();
        let backup_store =
            BackupStore::new(&backend, &set.options, None, None, Default::default());
        let cancel = AtomicBool::new(false);

        let file_path = source.path().join("doc.txt");
        fs::write(&file_path, vec![b'x'; 2048]).unwrap();
        snapshotter::run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();

        let mut changed = vec![b'x'; 2048];
        changed[0] = b'y';
        fs::write(&file_path, &changed).unwrap();
        snapshotter::run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let pattern = Regex::new(&regex::escape(&file_path.to_string_lossy())).unwrap();
        let (stats, _outcomes) =
            restore(&manifest, &backup_store, &pattern, i64::MAX, dest.path()).unwrap();

        assert_eq!(stats.restored, 1);
        let restored_path = dest.path().join(relative_path(&file_path.to_string_lossy()));
        let restored_bytes = fs::read(restored_path).unwrap();
        assert_eq!(restored_bytes, changed);
    }

    #[test]
    fn tombstoned_path_is_skipped() {
        let source = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(store_dir.path()).unwrap();
        let set = set_config(source.path(), store_dir.path());

        let scratch = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::open(&backend, scratch.path()).unwrap();
        let backup_store =
            BackupStore::new(&backend, &set.options, None, None, Default::default());
        let cancel = AtomicBool::new(false);

        let file_path = source.path().join("doc.txt");
        fs::write(&file_path, b"content").unwrap();
        snapshotter::run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();
        fs::remove_file(&file_path).unwrap();
        snapshotter::run(&mut manifest, &backend, &backup_store, &set, "t", &cancel).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let pattern = Regex::new(&regex::escape(&file_path.to_string_lossy())).unwrap();
        let (stats, _outcomes) =
            restore(&manifest, &backup_store, &pattern, i64::MAX, dest.path()).unwrap();

        assert_eq!(stats.matched, 1);
        assert_eq!(stats.skipped_tombstones, 1);
        assert_eq!(stats.restored, 0);
    }
}
