//! # Object Store Backend
//!
//! A second [`BlobStore`] implementor behind the same trait as the local
//! backend, built on the `object_store` crate so any of its supported
//! providers (S3, GCS, Azure Blob, or a local filesystem shim for testing)
//! can back a set. Atomicity here is not stage-then-rename — it relies on
//! the backend's single-object PUT being atomic, so no partial object is
//! ever visible to a concurrent reader.
//!
//! The engine's own loop is synchronous; `object_store`'s API is async.
//! Rather than infect the whole engine with async, this module hides
//! a small current-thread-friendly Tokio runtime behind the synchronous
//! `BlobStore` contract and blocks on it — the same shape commonly used to
//! wrap an async SDK behind a blocking facade.

use super::{manifest_name_instant, shard, BlobStore, LockGuard};
use crate::error::{EngineError, RepoError, Result};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use std::sync::Arc;
use tokio::runtime::Runtime;

pub struct ObjectBackend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    rt: Arc<Runtime>,
}

impl ObjectBackend {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Result<Self> {
        let rt = Runtime::new().map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self {
            store,
            prefix: prefix.into(),
            rt: Arc::new(rt),
        })
    }

    fn blob_key(&self, sha: &str) -> ObjectPath {
        let (prefix, suffix) = shard(sha);
        ObjectPath::from(format!("{}/blobs/{prefix}/{suffix}", self.prefix))
    }

    fn manifest_key(&self, name: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/manifests/{name}", self.prefix))
    }

    fn latest_key(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/manifests/latest", self.prefix))
    }

    fn lock_key(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/lock", self.prefix))
    }

    fn get_bytes(&self, key: &ObjectPath) -> Result<Vec<u8>> {
        self.rt.block_on(async {
            let result = self
                .store
                .get(key)
                .await
                .map_err(|e| EngineError::NotFound(e.to_string()))?;
            let bytes = result
                .bytes()
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            Ok(bytes.to_vec())
        })
    }

    fn put_bytes(&self, key: &ObjectPath, data: &[u8]) -> Result<()> {
        self.rt.block_on(async {
            self.store
                .put(key, PutPayload::from(data.to_vec()))
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            Ok(())
        })
    }

    fn exists_key(&self, key: &ObjectPath) -> Result<bool> {
        self.rt.block_on(async {
            match self.store.head(key).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(EngineError::Transport(e.to_string()).into()),
            }
        })
    }
}

impl BlobStore for ObjectBackend {
    fn exists(&self, sha: &str) -> Result<bool> {
        self.exists_key(&self.blob_key(sha))
    }

    fn put(&self, sha: &str, data: &[u8]) -> Result<()> {
        let key = self.blob_key(sha);
        if self.exists_key(&key)? {
            let existing = self.get_bytes(&key)?;
            if existing == data {
                return Ok(());
            }
            return Err(EngineError::Corrupt(format!(
                "blob {sha} already exists with different content"
            ))
            .into());
        }
        self.put_bytes(&key, data)
    }

    fn get(&self, sha: &str) -> Result<Vec<u8>> {
        self.get_bytes(&self.blob_key(sha))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs_prefix = ObjectPath::from(format!("{}/blobs", self.prefix));
        self.rt.block_on(async {
            use futures::TryStreamExt;
            let mut stream = self.store.list(Some(&blobs_prefix));
            let mut out = Vec::new();
            while let Some(meta) = stream
                .try_next()
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?
            {
                let parts: Vec<_> = meta.location.parts().collect();
                if parts.len() < 2 {
                    continue;
                }
                let sha = format!(
                    "{}{}",
                    parts[parts.len() - 2].as_ref(),
                    parts[parts.len() - 1].as_ref()
                );
                if sha.starts_with(prefix) {
                    out.push(sha);
                }
            }
            Ok(out)
        })
    }

    fn delete(&self, sha: &str) -> Result<()> {
        let key = self.blob_key(sha);
        self.rt.block_on(async {
            match self.store.delete(&key).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(EngineError::Transport(e.to_string()).into()),
            }
        })
    }

    fn manifest_put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.put_bytes(&self.manifest_key(name), data)?;
        self.put_bytes(&self.latest_key(), name.as_bytes())
    }

    fn manifest_get(&self, name: &str) -> Result<Vec<u8>> {
        self.get_bytes(&self.manifest_key(name))
    }

    fn manifest_list(&self) -> Result<Vec<String>> {
        let manifests_prefix = ObjectPath::from(format!("{}/manifests", self.prefix));
        self.rt.block_on(async {
            use futures::TryStreamExt;
            let mut stream = self.store.list(Some(&manifests_prefix));
            let mut names = Vec::new();
            while let Some(meta) = stream
                .try_next()
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?
            {
                if let Some(name) = meta.location.filename() {
                    if manifest_name_instant(name).is_some() {
                        names.push(name.to_string());
                    }
                }
            }
            names.sort_by_key(|n| manifest_name_instant(n).unwrap_or_default());
            Ok(names)
        })
    }

    fn manifest_delete(&self, name: &str) -> Result<()> {
        let key = self.manifest_key(name);
        self.rt.block_on(async {
            match self.store.delete(&key).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(EngineError::Transport(e.to_string()).into()),
            }
        })
    }

    fn manifest_latest(&self) -> Result<Option<String>> {
        let key = self.latest_key();
        if !self.exists_key(&key)? {
            return Ok(None);
        }
        let bytes = self.get_bytes(&key)?;
        Ok(Some(String::from_utf8_lossy(&bytes).to_string()))
    }

    fn acquire_lock(&self) -> Result<Box<dyn LockGuard>> {
        let key = self.lock_key();
        self.rt.block_on(async {
            let opts = PutOptions {
                mode: PutMode::Create,
                ..Default::default()
            };
            self.store
                .put_opts(&key, PutPayload::from(Vec::new()), opts)
                .await
                .map_err(|_| RepoError::Locked(std::path::PathBuf::from(key.as_ref())))
        })?;
        Ok(Box::new(ObjectLockGuard {
            store: self.store.clone(),
            rt: self.rt.clone(),
            key,
        }))
    }
}

struct ObjectLockGuard {
    store: Arc<dyn ObjectStore>,
    rt: Arc<Runtime>,
    key: ObjectPath,
}

impl LockGuard for ObjectLockGuard {}

impl Drop for ObjectLockGuard {
    fn drop(&mut self) {
        let store = self.store.clone();
        let key = self.key.clone();
        self.rt.block_on(async move {
            let _ = store.delete(&key).await;
        });
    }
}
