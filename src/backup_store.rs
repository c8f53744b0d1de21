//! # Backup Store
//!
//! Facade over the Blob Store Interface that owns the compress→encrypt→
//! address pipeline. Callers (Snapshotter, Restorer) deal only in
//! plaintext bytes and SHA-256 addresses; this module is the one place
//! that knows how a blob's bytes are actually laid out on the backend.
//!
//! Cross-path deduplication creates a subtlety: if two different paths
//! have identical plaintext, their content SHA is the same, but `put`
//! requires the *stored* payload to be byte-identical on a repeat write —
//! and AES-256-GCM's random nonce means re-encrypting identical plaintext
//! never reproduces the same ciphertext. So on a dedup hit we never
//! re-encrypt: we reuse the wrapped key already on record for that SHA,
//! sourced from the manifest at open time and cached here for the rest of
//! the run.

use crate::backend::BlobStore;
use crate::compress;
use crate::config::{BackupOptions, CompressionKind};
use crate::crypto::{self, WrappedKey};
use crate::error::{CryptoError, EngineError, Result};
use crate::hasher;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::cell::RefCell;
use std::collections::HashMap;

/// Advisory hint for how a blob was produced; does not affect storage, only
/// logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Base,
    Diff,
}

type KeyCacheEntry = (Option<Vec<u8>>, Option<Vec<u8>>);

pub struct BackupStore<'a> {
    backend: &'a dyn BlobStore,
    public_key: Option<RsaPublicKey>,
    private_key: Option<RsaPrivateKey>,
    use_encryption: bool,
    use_compression: bool,
    compression: CompressionKind,
    zstd_level: i32,
    key_cache: RefCell<HashMap<String, KeyCacheEntry>>,
}

impl<'a> BackupStore<'a> {
    /// Builds a store bound to `backend` for one run. `known_keys` should be
    /// seeded from [`crate::manifest::Manifest::known_blob_wraps`] (keyed by
    /// blob address, i.e. the SHA of the bytes actually `put` — the file's
    /// content SHA for a base blob, the patch's SHA for a diff) so dedup
    /// against content from a *previous* snapshot also avoids re-encrypting.
    pub fn new(
        backend: &'a dyn BlobStore,
        options: &BackupOptions,
        public_key: Option<RsaPublicKey>,
        private_key: Option<RsaPrivateKey>,
        known_keys: HashMap<String, KeyCacheEntry>,
    ) -> Self {
        Self {
            backend,
            public_key,
            private_key,
            use_encryption: options.use_encryption,
            use_compression: options.use_compression,
            compression: options.compression,
            zstd_level: options.zstd_level,
            key_cache: RefCell::new(known_keys),
        }
    }

    /// Computes the plaintext SHA, then streams compress→encrypt→`put` if
    /// the blob isn't already durable. Returns `(sha, wrapped_key)` for
    /// manifest insertion.
    pub fn save(&self, plaintext: &[u8], kind: BlobKind) -> Result<(String, Option<WrappedKey>)> {
        let sha = hasher::hash_bytes(plaintext);

        if let Some((wrapped_key, iv)) = self.key_cache.borrow().get(&sha).cloned() {
            tracing::debug!(sha = %sha, ?kind, "blob already known, skipping re-encode");
            return Ok((sha, zip_wrapped(wrapped_key, iv)));
        }

        if self.backend.exists(&sha)? {
            if self.use_encryption {
                // An address can exist without a known wrap only if it's a
                // dangling blob left by a run that crashed between `put`
                // and the manifest commit that would have recorded the
                // wrap. Nothing committed can reference it, so replacing
                // it is safe — equivalent to GC reclaiming it first, just
                // done inline.
                tracing::warn!(sha = %sha, "replacing dangling blob with no recorded wrap");
                self.backend.delete(&sha)?;
            } else {
                self.key_cache.borrow_mut().insert(sha.clone(), (None, None));
                return Ok((sha, None));
            }
        }

        let effective_kind = if self.use_compression {
            self.compression
        } else {
            CompressionKind::None
        };
        let staged = compress::compress(plaintext, effective_kind, self.zstd_level)?;

        let (payload, wrapped) = if self.use_encryption {
            let public_key = self.public_key.as_ref().ok_or(CryptoError::MissingKey)?;
            let (ciphertext, wrapped) = crypto::encrypt_blob(&staged, public_key)?;
            (ciphertext, Some(wrapped))
        } else {
            (staged, None)
        };

        self.backend.put(&sha, &payload)?;

        let cache_entry = wrapped
            .as_ref()
            .map(|w| (Some(w.wrapped_key.clone()), Some(w.iv.to_vec())))
            .unwrap_or((None, None));
        self.key_cache.borrow_mut().insert(sha.clone(), cache_entry);

        tracing::debug!(sha = %sha, ?kind, bytes = payload.len(), "saved blob");
        Ok((sha, wrapped))
    }

    /// Inverse of [`Self::save`]: reads, decrypts, decompresses, and
    /// verifies the recovered plaintext hashes back to `sha`.
    pub fn load(&self, sha: &str, wrapped_key: Option<&[u8]>, iv: Option<&[u8]>) -> Result<Vec<u8>> {
        let raw = self.backend.get(sha)?;

        let post_decrypt = if self.use_encryption && wrapped_key.is_some() {
            let private_key = self.private_key.as_ref().ok_or(CryptoError::MissingKey)?;
            let iv_bytes: [u8; crypto::IV_LEN] = iv
                .ok_or(CryptoError::MissingKey)?
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength)?;
            let wrapped = WrappedKey {
                wrapped_key: wrapped_key.unwrap().to_vec(),
                iv: iv_bytes,
            };
            crypto::decrypt_blob(&raw, &wrapped, private_key)?
        } else {
            raw
        };

        let plaintext = if self.use_compression {
            compress::decompress(&post_decrypt, self.compression)?
        } else {
            post_decrypt
        };

        let actual_sha = hasher::hash_bytes(&plaintext);
        if actual_sha != sha {
            return Err(EngineError::Corrupt(format!(
                "blob {sha} decoded to content addressed by {actual_sha} instead"
            ))
            .into());
        }

        Ok(plaintext)
    }
}

fn zip_wrapped(wrapped_key: Option<Vec<u8>>, iv: Option<Vec<u8>>) -> Option<WrappedKey> {
    let (wrapped_key, iv) = (wrapped_key?, iv?);
    if iv.len() != crypto::IV_LEN {
        return None;
    }
    let mut arr = [0u8; crypto::IV_LEN];
    arr.copy_from_slice(&iv);
    Some(WrappedKey { wrapped_key, iv: arr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use rand::rngs::OsRng;

    fn options(use_encryption: bool, use_compression: bool) -> BackupOptions {
        BackupOptions {
            max_manifest_versions: 10,
            use_encryption,
            use_compression,
            compression: CompressionKind::Zstd,
            zstd_level: 3,
            diff_margin: crate::diff::DEFAULT_DIFF_MARGIN,
            checkpoint_every_files: 500,
            checkpoint_every_secs: 60,
        }
    }

    #[test]
    fn roundtrip_plaintext_no_crypto_no_compression() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let store = BackupStore::new(&backend, &options(false, false), None, None, HashMap::new());

        let (sha, wrapped) = store.save(b"hello world", BlobKind::Base).unwrap();
        assert!(wrapped.is_none());
        let loaded = store.load(&sha, None, None).unwrap();
        assert_eq!(loaded, b"hello world");
    }

    #[test]
    fn roundtrip_with_compression_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let store = BackupStore::new(&backend, &options(false, true), None, None, HashMap::new());

        let plaintext = vec![7u8; 4096];
        let (sha, _wrapped) = store.save(&plaintext, BlobKind::Base).unwrap();
        let loaded = store.load(&sha, None, None).unwrap();
        assert_eq!(loaded, plaintext);
    }

    #[test]
    fn roundtrip_with_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = crypto::public_key_of(&private);

        let store = BackupStore::new(
            &backend,
            &options(true, true),
            Some(public),
            Some(private),
            HashMap::new(),
        );

        let (sha, wrapped) = store.save(b"top secret plaintext", BlobKind::Base).unwrap();
        let wrapped = wrapped.unwrap();
        let loaded = store
            .load(&sha, Some(&wrapped.wrapped_key), Some(&wrapped.iv))
            .unwrap();
        assert_eq!(loaded, b"top secret plaintext");
    }

    #[test]
    fn dedup_reuses_cached_key_without_reencrypting() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = crypto::public_key_of(&private);

        let store = BackupStore::new(
            &backend,
            &options(true, false),
            Some(public),
            Some(private),
            HashMap::new(),
        );

        let (sha_a, wrapped_a) = store.save(b"dup content", BlobKind::Base).unwrap();
        let (sha_b, wrapped_b) = store.save(b"dup content", BlobKind::Base).unwrap();
        assert_eq!(sha_a, sha_b);
        assert_eq!(
            wrapped_a.unwrap().wrapped_key,
            wrapped_b.unwrap().wrapped_key
        );
    }

    #[test]
    fn tampered_stored_blob_fails_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let store = BackupStore::new(&backend, &options(false, false), None, None, HashMap::new());

        let (sha, _) = store.save(b"original content", BlobKind::Base).unwrap();
        backend.delete(&sha).unwrap();
        std::fs::create_dir_all(dir.path().join("blobs").join(&sha[..2])).unwrap();
        std::fs::write(
            dir.path().join("blobs").join(&sha[..2]).join(&sha[2..]),
            b"tampered",
        )
        .unwrap();

        let result = store.load(&sha, None, None);
        assert!(result.is_err());
    }
}
