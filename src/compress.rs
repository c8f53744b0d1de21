//! # Compression Pipeline
//!
//! Optional streaming compression applied before encryption.
//! The content SHA used for blob addressing is always computed over the
//! pre-compression plaintext (see `hasher`), so toggling `use_compression`
//! on an existing backup set never breaks deduplication — only what gets
//! written to the blob store changes, not what a blob is addressed by.

use crate::config::CompressionKind;
use crate::error::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compresses a byte slice using the specified algorithm.
///
/// Returns the compressed bytes. For `CompressionKind::None`, the input is
/// returned unchanged.
pub fn compress(data: &[u8], kind: CompressionKind, level: i32) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Zstd => compress_zstd(data, level),
        CompressionKind::Gzip => compress_gzip(data),
        CompressionKind::None => Ok(data.to_vec()),
    }
}

/// Decompresses a byte slice using the specified algorithm.
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Zstd => decompress_zstd(data),
        CompressionKind::Gzip => decompress_gzip(data),
        CompressionKind::None => Ok(data.to_vec()),
    }
}

// ─── Zstandard ──────────────────────────────────────────────────────────────

/// Compresses data using Zstandard at the specified level (1–22).
///
/// Zstd offers an excellent compression ratio / speed tradeoff and is the
/// default backend. Level 3 provides a good balance; levels 19+ trade
/// significant CPU time for marginal ratio improvements.
fn compress_zstd(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    Ok(compressed)
}

fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

// ─── Gzip ───────────────────────────────────────────────────────────────────

/// Compresses data using gzip (DEFLATE, via `flate2`).
///
/// Included for compatibility with systems that expect standard gzip
/// archives. For new backup sets, Zstd is recommended for its superior
/// speed and ratio.
fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Returns the file extension conventionally associated with a compression kind.
#[allow(dead_code)]
pub fn extension(kind: CompressionKind) -> &'static str {
    match kind {
        CompressionKind::Zstd => "zst",
        CompressionKind::Gzip => "gz",
        CompressionKind::None => "raw",
    }
}

/// Estimates the compression ratio for display purposes.
pub fn ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 1.0;
    }
    compressed_size as f64 / original_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_roundtrip() {
        let data = b"Hello, zstd compression! This is a test string that should compress.";
        let compressed = compress(data, CompressionKind::Zstd, 3).unwrap();
        let decompressed = decompress(&compressed, CompressionKind::Zstd).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn none_passthrough() {
        let data = b"uncompressed data";
        let compressed = compress(data, CompressionKind::None, 0).unwrap();
        assert_eq!(compressed, data);
        let decompressed = decompress(&compressed, CompressionKind::None).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn gzip_roundtrip() {
        let data = b"gzip test data with enough content to actually compress";
        let compressed = compress(data, CompressionKind::Gzip, 0).unwrap();
        let decompressed = decompress(&compressed, CompressionKind::Gzip).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn zstd_actually_compresses() {
        let data = vec![0u8; 10000]; // highly compressible
        let compressed = compress(&data, CompressionKind::Zstd, 3).unwrap();
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn ratio_calculation() {
        assert!((ratio(1000, 500) - 0.5).abs() < f64::EPSILON);
        assert!((ratio(0, 100) - 1.0).abs() < f64::EPSILON);
    }
}
