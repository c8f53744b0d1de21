//! # Cryptographic Operations
//!
//! Implements the hybrid encryption pipeline: each blob gets a fresh
//! random AES-256-GCM key and 96-bit nonce; the key is wrapped with
//! the backup set's RSA-4096 public key using OAEP padding. The wrapped key
//! and nonce travel with the manifest entry, never inside the blob itself —
//! so a leaked blob reveals nothing without either the manifest row or the
//! private key.
//!
//! When a backup set has encryption disabled, [`encrypt_blob`] and
//! [`decrypt_blob`] are not called at all; the backup store writes/reads
//! the (optionally compressed) plaintext directly.
//!
//! ## Wire format
//!
//! ```text
//! blob on disk:           ciphertext ‖ auth tag (AES-256-GCM, 16B suffix)
//! manifest entry carries:  wrapped_key (RSA-OAEP(SHA-256) of the AES key)
//!                          iv          (12-byte GCM nonce)
//! ```

use crate::error::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng as AesOsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;
use zeroize::Zeroizing;

/// Length in bytes of an AES-256 key.
const KEY_LEN: usize = 32;
/// Length in bytes of an AES-GCM nonce (96 bits), reused as the manifest's "IV".
pub const IV_LEN: usize = 12;
/// RSA modulus size used for backup-set keypairs.
pub const RSA_KEY_BITS: usize = 4096;

/// A per-blob AES-256 key wrapped under a backup set's RSA public key, plus
/// the nonce used for that blob's AES-256-GCM encryption. This is the tuple
/// the manifest entry carries alongside each blob record.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    pub wrapped_key: Vec<u8>,
    pub iv: [u8; IV_LEN],
}

/// Generates a fresh RSA-4096 keypair, for `vaultkeep init --encrypt`.
pub fn generate_keypair() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| CryptoError::KeyWrap(e.to_string()).into())
}

/// Loads a PKCS#8 PEM-encoded RSA private key from disk.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    RsaPrivateKey::read_pkcs8_pem_file(path)
        .map_err(|e| CryptoError::KeyWrap(format!("reading {}: {e}", path.display())).into())
}

/// Writes a PKCS#8 PEM-encoded RSA private key to disk.
pub fn write_private_key(key: &RsaPrivateKey, path: &Path) -> Result<()> {
    key.write_pkcs8_pem_file(path, LineEnding::LF)
        .map_err(|e| CryptoError::KeyWrap(format!("writing {}: {e}", path.display())).into())
}

/// Derives the public half of a keypair, used to wrap per-blob symmetric keys.
pub fn public_key_of(private: &RsaPrivateKey) -> RsaPublicKey {
    RsaPublicKey::from(private)
}

/// Encrypts `plaintext` (already compressed, if applicable) under a fresh
/// random AES-256-GCM key, then wraps that key with `public_key` via RSA-OAEP.
///
/// Returns the ciphertext and the [`WrappedKey`] to be stored in the
/// manifest entry.
pub fn encrypt_blob(plaintext: &[u8], public_key: &RsaPublicKey) -> Result<(Vec<u8>, WrappedKey)> {
    let key = Aes256Gcm::generate_key(&mut AesOsRng);
    let key = Zeroizing::new(key);
    let cipher = Aes256Gcm::new(&key);

    let nonce = Aes256Gcm::generate_nonce(&mut AesOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::InvalidKeyLength)?;

    let wrapped_key = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_slice())
        .map_err(|e| CryptoError::KeyWrap(e.to_string()))?;

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&nonce);

    Ok((ciphertext, WrappedKey { wrapped_key, iv }))
}

/// Inverse of [`encrypt_blob`]: unwraps the per-blob key with the set's RSA
/// private key, then decrypts and authenticates the ciphertext.
///
/// Returns [`CryptoError::DecryptionFailed`] on authentication failure
/// (corrupted ciphertext, wrong key, or tampering).
pub fn decrypt_blob(
    ciphertext: &[u8],
    wrapped: &WrappedKey,
    private_key: &RsaPrivateKey,
) -> Result<Vec<u8>> {
    let key_bytes = private_key
        .decrypt(Oaep::new::<Sha256>(), &wrapped.wrapped_key)
        .map_err(|e| CryptoError::KeyWrap(e.to_string()))?;
    let key_bytes = Zeroizing::new(key_bytes);

    if key_bytes.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength.into());
    }

    let cipher =
        Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CryptoError::InvalidKeyLength)?;
    let nonce = Nonce::from_slice(&wrapped.iv);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> RsaPrivateKey {
        // A real 4096-bit keygen is slow to run per test; use a smaller
        // modulus here purely to exercise the encrypt/decrypt plumbing.
        RsaPrivateKey::new(&mut OsRng, 1024).unwrap()
    }

    #[test]
    fn roundtrip_encryption() {
        let private = test_key();
        let public = public_key_of(&private);
        let plaintext = b"Hello, vaultkeep encryption!";

        let (ciphertext, wrapped) = encrypt_blob(plaintext, &public).unwrap();
        assert_ne!(ciphertext.as_slice(), plaintext);

        let decrypted = decrypt_blob(&ciphertext, &wrapped, &private).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let private_a = test_key();
        let private_b = test_key();
        let public_a = public_key_of(&private_a);

        let (ciphertext, wrapped) = encrypt_blob(b"secret data", &public_a).unwrap();
        let result = decrypt_blob(&ciphertext, &wrapped, &private_b);
        assert!(result.is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let private = test_key();
        let public = public_key_of(&private);
        let (mut ciphertext, wrapped) = encrypt_blob(b"secret data", &public).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;

        let result = decrypt_blob(&ciphertext, &wrapped, &private);
        assert!(result.is_err());
    }

    #[test]
    fn unique_nonces_per_blob() {
        let private = test_key();
        let public = public_key_of(&private);
        let (a, wrapped_a) = encrypt_blob(b"data", &public).unwrap();
        let (b, wrapped_b) = encrypt_blob(b"data", &public).unwrap();
        assert_ne!(wrapped_a.iv, wrapped_b.iv);
        assert_ne!(a, b);
    }
}
