//! # Local Filesystem Backend
//!
//! Blobs live under `<location>/blobs/<sha[0:2]>/<sha[2:]>`; manifests live
//! under `<location>/manifests/manifest.<unix-nanos>` with a `latest`
//! symlink pointing at the newest one. Every publish stages to a
//! temporary file in the same directory and renames into place — `rename(2)`
//! is atomic within a filesystem, so a crash mid-write leaves only an
//! orphaned temp file, never a half-written blob visible under its final
//! name.

use super::{manifest_name_instant, shard, BlobStore, LockGuard};
use crate::error::{EngineError, RepoError, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("manifests"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, sha: &str) -> PathBuf {
        let (prefix, suffix) = shard(sha);
        self.root.join("blobs").join(prefix).join(suffix)
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        self.root.join("manifests").join(name)
    }

    fn latest_link(&self) -> PathBuf {
        self.root.join("manifests").join("latest")
    }

    /// Writes `data` to a temp file beside `dest`, then renames atomically.
    fn stage_then_rename(&self, dest: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut staged = tempfile::NamedTempFile::new_in(dest.parent().unwrap())?;
        staged.write_all(data)?;
        staged.flush()?;
        staged
            .persist(dest)
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(())
    }
}

impl BlobStore for LocalBackend {
    fn exists(&self, sha: &str) -> Result<bool> {
        Ok(self.blob_path(sha).exists())
    }

    fn put(&self, sha: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(sha);
        if path.exists() {
            let existing = fs::read(&path)?;
            if existing == data {
                return Ok(());
            }
            return Err(EngineError::Corrupt(format!(
                "blob {sha} already exists with different content"
            ))
            .into());
        }
        self.stage_then_rename(&path, data)
    }

    fn get(&self, sha: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(sha);
        fs::read(&path).map_err(|_| EngineError::NotFound(format!("blob {sha}")).into())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs_dir = self.root.join("blobs");
        let mut out = Vec::new();
        if !blobs_dir.exists() {
            return Ok(out);
        }
        for shard_entry in fs::read_dir(&blobs_dir)? {
            let shard_entry = shard_entry?;
            if !shard_entry.file_type()?.is_dir() {
                continue;
            }
            let shard_name = shard_entry.file_name().to_string_lossy().to_string();
            for file_entry in fs::read_dir(shard_entry.path())? {
                let file_entry = file_entry?;
                let sha = format!("{shard_name}{}", file_entry.file_name().to_string_lossy());
                if sha.starts_with(prefix) {
                    out.push(sha);
                }
            }
        }
        Ok(out)
    }

    fn delete(&self, sha: &str) -> Result<()> {
        let path = self.blob_path(sha);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn manifest_put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.manifest_path(name);
        self.stage_then_rename(&path, data)?;

        let link = self.latest_link();
        let tmp_link = self.root.join("manifests").join(".latest.tmp");
        let _ = fs::remove_file(&tmp_link);
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(name, &tmp_link)?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&tmp_link, name)?;
        }
        fs::rename(&tmp_link, &link)?;
        Ok(())
    }

    fn manifest_get(&self, name: &str) -> Result<Vec<u8>> {
        fs::read(self.manifest_path(name))
            .map_err(|_| EngineError::NotFound(format!("manifest {name}")).into())
    }

    fn manifest_list(&self) -> Result<Vec<String>> {
        let dir = self.root.join("manifests");
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if manifest_name_instant(&name).is_some() {
                names.push(name);
            }
        }
        names.sort_by_key(|n| manifest_name_instant(n).unwrap_or_default());
        Ok(names)
    }

    fn manifest_delete(&self, name: &str) -> Result<()> {
        let path = self.manifest_path(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn manifest_latest(&self) -> Result<Option<String>> {
        let link = self.latest_link();
        if !link.exists() {
            return Ok(None);
        }
        #[cfg(unix)]
        {
            let target = fs::read_link(&link)?;
            Ok(Some(target.to_string_lossy().to_string()))
        }
        #[cfg(not(unix))]
        {
            Ok(Some(fs::read_to_string(&link)?))
        }
    }

    fn acquire_lock(&self) -> Result<Box<dyn LockGuard>> {
        let lock_path = self.root.join("lock");
        let file = File::create(&lock_path)?;
        file.try_lock_exclusive()
            .map_err(|_| RepoError::Locked(lock_path.clone()))?;
        Ok(Box::new(LocalLockGuard {
            _file: file,
            _path: lock_path,
        }))
    }
}

struct LocalLockGuard {
    _file: File,
    _path: PathBuf,
}

impl LockGuard for LocalLockGuard {}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (LocalBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        (backend, dir)
    }

    #[test]
    fn put_then_exists_then_get() {
        let (backend, _dir) = backend();
        backend.put("abc123", b"payload").unwrap();
        assert!(backend.exists("abc123").unwrap());
        assert_eq!(backend.get("abc123").unwrap(), b"payload");
    }

    #[test]
    fn idempotent_put_same_content() {
        let (backend, _dir) = backend();
        backend.put("abc123", b"payload").unwrap();
        backend.put("abc123", b"payload").unwrap();
        assert_eq!(backend.get("abc123").unwrap(), b"payload");
    }

    #[test]
    fn put_conflicting_content_is_corrupt() {
        let (backend, _dir) = backend();
        backend.put("abc123", b"payload").unwrap();
        assert!(backend.put("abc123", b"different").is_err());
    }

    #[test]
    fn get_missing_is_not_found() {
        let (backend, _dir) = backend();
        assert!(backend.get("doesnotexist").is_err());
    }

    #[test]
    fn manifest_roundtrip_and_alias() {
        let (backend, _dir) = backend();
        backend.manifest_put("manifest.100", b"v1").unwrap();
        backend.manifest_put("manifest.200", b"v2").unwrap();
        assert_eq!(backend.manifest_latest().unwrap().unwrap(), "manifest.200");
        assert_eq!(backend.manifest_get("manifest.100").unwrap(), b"v1");
        let names = backend.manifest_list().unwrap();
        assert_eq!(names, vec!["manifest.100", "manifest.200"]);
    }

    #[test]
    fn lock_rejects_second_holder() {
        let (backend, _dir) = backend();
        let _guard = backend.acquire_lock().unwrap();
        assert!(backend.acquire_lock().is_err());
    }
}
