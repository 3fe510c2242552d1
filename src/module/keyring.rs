//! Append-only set of public keys the user trusts.

use super::crypto::PublicKeyRecord;
use super::ModuleError;
use std::path::{Path, PathBuf};

/// Trusted keys, optionally persisted as a JSON array of key records.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeyRing {
    keys: Vec<PublicKeyRecord>,
    path: Option<PathBuf>,
}

impl TrustedKeyRing {
    /// In-memory ring that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the ring stored at `path`; a missing file yields an empty ring.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ModuleError> {
        let path = path.into();
        let keys: Vec<PublicKeyRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                ModuleError::Key(format!("Failed to parse key ring {:?}: {}", path, e))
            })?
        } else {
            Vec::new()
        };
        tracing::debug!("Loaded {} trusted keys from {:?}", keys.len(), path);
        Ok(Self {
            keys,
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[PublicKeyRecord] {
        &self.keys
    }

    pub fn contains(&self, key: &PublicKeyRecord) -> bool {
        self.keys.contains(key)
    }

    /// Trust `key`. Returns `false` if it was already trusted.
    ///
    /// The ring only grows; the new state is written through when persisted.
    pub fn trust(&mut self, key: PublicKeyRecord) -> Result<bool, ModuleError> {
        if self.contains(&key) {
            return Ok(false);
        }
        tracing::info!("Trusting key {}", key.fingerprint());
        self.keys.push(key);
        self.save()?;
        Ok(true)
    }

    /// The first trusted key that verifies `signature` over `text`.
    pub fn verify(&self, text: &str, signature: &str) -> Option<&PublicKeyRecord> {
        self.keys.iter().find(|k| k.verify(text, signature))
    }

    fn save(&self) -> Result<(), ModuleError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.keys)
            .map_err(|e| ModuleError::Key(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::crypto::test_keys;

    #[test]
    fn test_trust_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trusted_keys.json");
        let key = test_keys::pair(0).public.clone();

        let mut ring = TrustedKeyRing::load(&path).unwrap();
        assert!(ring.is_empty());
        assert!(ring.trust(key.clone()).unwrap());
        assert!(!ring.trust(key.clone()).unwrap());

        let reloaded = TrustedKeyRing::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains(&key));
    }

    #[test]
    fn test_verify_with_ring() {
        let pair = test_keys::pair(1);
        let mut ring = TrustedKeyRing::in_memory();
        let sig = pair.private.sign("text").unwrap();
        assert!(ring.verify("text", &sig).is_none());
        ring.trust(pair.public.clone()).unwrap();
        assert_eq!(ring.verify("text", &sig), Some(&pair.public));
    }
}
