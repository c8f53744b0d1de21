//! # Diff Codec
//!
//! Binary diff/patch between two arbitrary byte sequences, used by the
//! snapshotter to store a changed file as a patch against its prior
//! version instead of a fresh full copy. Built on `qbsdiff`'s bsdiff/bspatch
//! implementation, which is deterministic and accepts arbitrary binary input.
//!
//! `patch(old, diff(old, new)) == new` for all `old`, `new` — this identity
//! is what lets chain resolution apply patches forward and trust the
//! result without re-diffing.

use crate::error::Result;
use qbsdiff::{Bsdiff, Bspatch};

/// Computes a patch that transforms `old` into `new`.
pub fn diff(old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
    let mut patch = Vec::new();
    Bsdiff::new(old, new)
        .compare(&mut patch)
        .map_err(|e| anyhow::anyhow!("diff encoding failed: {e}"))?;
    Ok(patch)
}

/// Applies `patch` (produced by [`diff`]) to `old`, reconstructing `new`.
pub fn patch(old: &[u8], patch_bytes: &[u8]) -> Result<Vec<u8>> {
    let patcher = Bspatch::new(patch_bytes)
        .map_err(|e| anyhow::anyhow!("malformed patch: {e}"))?;
    let mut out = Vec::with_capacity(patcher.hint_target_size() as usize);
    patcher
        .apply(old, &mut out)
        .map_err(|e| anyhow::anyhow!("patch application failed: {e}"))?;
    Ok(out)
}

/// Default margin: a diff is only worth keeping if it's smaller than the
/// new plaintext by at least this fraction. Below that, a fresh base blob
/// compresses just as well and avoids growing the diff chain.
pub const DEFAULT_DIFF_MARGIN: f64 = 0.10;

/// Decides whether a computed patch is worth storing in place of a base
/// blob, given the size of the new plaintext it reconstructs.
pub fn worth_diffing(patch_len: usize, new_plaintext_len: usize, margin: f64) -> bool {
    if new_plaintext_len == 0 {
        return false;
    }
    (patch_len as f64) <= (new_plaintext_len as f64) * (1.0 - margin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_text() {
        let old = b"hello".to_vec();
        let new = b"hellothere".to_vec();
        let p = diff(&old, &new).unwrap();
        let reconstructed = patch(&old, &p).unwrap();
        assert_eq!(reconstructed, new);
    }

    #[test]
    fn roundtrip_binary() {
        let old: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let mut new = old.clone();
        new[1000] = 0xFF;
        new.extend_from_slice(b"appended tail");
        let p = diff(&old, &new).unwrap();
        let reconstructed = patch(&old, &p).unwrap();
        assert_eq!(reconstructed, new);
    }

    #[test]
    fn roundtrip_empty_old() {
        let old: Vec<u8> = Vec::new();
        let new = b"brand new content".to_vec();
        let p = diff(&old, &new).unwrap();
        let reconstructed = patch(&old, &p).unwrap();
        assert_eq!(reconstructed, new);
    }

    #[test]
    fn heuristic_rejects_incompressible_diff() {
        // A patch that barely shrinks the payload isn't worth a diff chain link.
        assert!(!worth_diffing(950, 1000, DEFAULT_DIFF_MARGIN));
        assert!(worth_diffing(500, 1000, DEFAULT_DIFF_MARGIN));
    }

    proptest::proptest! {
        #[test]
        fn patch_of_diff_is_identity(old in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..2048),
                                      new in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..2048)) {
            let p = diff(&old, &new).unwrap();
            let reconstructed = patch(&old, &p).unwrap();
            proptest::prop_assert_eq!(reconstructed, new);
        }
    }
}
