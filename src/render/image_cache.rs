//! Shared image decode cache.
//!
//! Keyed by the SHA-256 of the encoded bytes and append-only: once decoded, an
//! image stays cached for the lifetime of the cache (one pipeline instance).
//! Decoding reads only the header (format and pixel size); drawing the pixels
//! is up to the presentation surface.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
}

/// A recognised image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    /// Hex SHA-256 of `bytes`
    pub hash: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Arc<[u8]>,
}

fn be_u16(b: &[u8], at: usize) -> Option<u32> {
    Some(u16::from_be_bytes([*b.get(at)?, *b.get(at + 1)?]) as u32)
}

fn le_u16(b: &[u8], at: usize) -> Option<u32> {
    Some(u16::from_le_bytes([*b.get(at)?, *b.get(at + 1)?]) as u32)
}

fn be_u32(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn le_i32(b: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn jpeg_size(b: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 9 < b.len() {
        if b[i] != 0xFF {
            return None;
        }
        let marker = b[i + 1];
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            return Some((be_u16(b, i + 7)?, be_u16(b, i + 5)?));
        }
        i += 2 + be_u16(b, i + 2)? as usize;
    }
    None
}

/// Read format and pixel size from an encoded image header.
pub fn probe(bytes: &[u8]) -> Result<(ImageFormat, u32, u32), String> {
    const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    let parsed = if bytes.starts_with(PNG_SIGNATURE) {
        be_u32(bytes, 16)
            .zip(be_u32(bytes, 20))
            .map(|(w, h)| (ImageFormat::Png, w, h))
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        jpeg_size(bytes).map(|(w, h)| (ImageFormat::Jpeg, w, h))
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        le_u16(bytes, 6)
            .zip(le_u16(bytes, 8))
            .map(|(w, h)| (ImageFormat::Gif, w, h))
    } else if bytes.starts_with(b"BM") {
        le_i32(bytes, 18)
            .zip(le_i32(bytes, 22))
            .map(|(w, h)| (ImageFormat::Bmp, w.unsigned_abs(), h.unsigned_abs()))
    } else {
        return Err("unrecognised image format".to_string());
    };

    parsed.ok_or_else(|| "truncated image header".to_string())
}

/// Content-addressed, append-only image cache.
#[derive(Debug, Default)]
pub struct ImageCache {
    entries: RwLock<HashMap<String, Arc<DecodedImage>>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash(bytes: &[u8]) -> String {
        Sha256::digest(bytes).iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Return the cached image for `bytes`, decoding it on first use.
    pub fn get_or_decode(&self, bytes: &[u8]) -> Result<Arc<DecodedImage>, String> {
        let hash = Self::hash(bytes);
        if let Some(image) = self.entries.read().get(&hash) {
            return Ok(image.clone());
        }

        let (format, width, height) = probe(bytes)?;
        let image = Arc::new(DecodedImage {
            hash: hash.clone(),
            format,
            width,
            height,
            bytes: Arc::from(bytes),
        });

        // A racing decoder may have inserted first; keep whichever landed.
        let mut entries = self.entries.write();
        let entry = entries.entry(hash).or_insert(image);
        tracing::trace!("Cached {:?} image {}x{}", entry.format, entry.width, entry.height);
        Ok(entry.clone())
    }

    pub fn get(&self, hash: &str) -> Option<Arc<DecodedImage>> {
        self.entries.read().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) fn tiny_png(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_png() {
        assert_eq!(probe(&tiny_png(32, 16)).unwrap(), (ImageFormat::Png, 32, 16));
    }

    #[test]
    fn test_probe_gif() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[10, 0, 20, 0]);
        assert_eq!(probe(&gif).unwrap(), (ImageFormat::Gif, 10, 20));
    }

    #[test]
    fn test_probe_jpeg() {
        let jpeg = [
            0xFF, 0xD8, // SOI
            0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00, // APP0 with 2 payload bytes
            0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x00, 0x30, 0x00, 0x40, 0x03, 0x00, 0x00,
        ];
        assert_eq!(probe(&jpeg).unwrap(), (ImageFormat::Jpeg, 64, 48));
    }

    #[test]
    fn test_probe_rejects_unknown() {
        assert!(probe(b"hello world").is_err());
        assert!(probe(&tiny_png(1, 1)[..12]).is_err());
    }

    #[test]
    fn test_cache_is_content_addressed() {
        let cache = ImageCache::new();
        let a = cache.get_or_decode(&tiny_png(4, 4)).unwrap();
        let b = cache.get_or_decode(&tiny_png(4, 4)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        cache.get_or_decode(&tiny_png(5, 4)).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a.hash).is_some());
    }
}
