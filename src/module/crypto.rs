//! Code-signing primitives.
//!
//! Signatures are RSA PKCS#1 v1.5 over the SHA-512 digest of the UTF-8 text,
//! base64 encoded. Keys travel as JSON records of base64 big-endian integers.

use super::ModuleError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::sync::OnceLock;

/// Modulus of the bundled first-party signing key.
const FIRST_PARTY_MODULUS: &str = "3HoAJagC/mZgRXIlLW8gX1CyM7EA1F90AGdSdo838SFsTA3bJufJ2b0WArQQBso9BEJgwJeCesfj4cHOEeiDowNWQ7yFD1LGZynLKyLiqWs2GB8YachvIkltTaP+rHnw7R5H6mSmWfNaPTcAmoUOHBy61h4fx2Slq/25Q/Q2HY1DCj3peqnj6o+qyDjQcPiyrIAoBuUtOb8fbTAEp7Wj5ciY8WmBUQFo+JsqHORfMKIjqe+HNKOzbOjIhVmACn2g9tbbzxTdf/9DVp9GYO0Vzx1iRb3EmqbHUvbQA2mBLGQY0KsKKP1TjKgPhyLobNhQFCtrQ/IauJHzmm442M+0j0PW8/0FT6ogmelgej4Vg3PGVd8K1qaqvHJ0RwbETCEx3RINexVPxSm1BVzIuT5L4bVJf3fwCwogTGJvxO2Hr4oGZFBERkiT/O4Hc4bbWm56UQqTtxqZ0STJG8//wvq6FIazKP+pj6cov6izseDHn8qtPiBgnS5wAGWHlwoxeUt2n5JnlGYE10mwC6wA+MbvNtQG6ETUQK1ezofqtZckSvqTT00hZCsJqHBoE8E9rYDMmoeOcDWdXpyz8JKVFRdv1irmDwLK9EAsTv7gKXX3yEBST1bFeiAoXfxwRoT0KhjaG0iSE+CZgeOYJS6xXVjCrWKjBPZYp+4Xtl2TevGW7gs=";
const FIRST_PARTY_EXPONENT: &str = "AQAB";

/// SHA-512 digest of `text`'s UTF-8 bytes.
pub fn digest(text: &str) -> Vec<u8> {
    Sha512::digest(text.as_bytes()).to_vec()
}

/// Hex prefix of the SHA-512 digest over `parts`, each terminated by a NUL.
pub fn short_digest(parts: &[&str]) -> String {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .take(16)
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn scheme() -> Pkcs1v15Sign {
    Pkcs1v15Sign::new::<Sha512>()
}

fn decode_uint(field: &str, value: &str) -> Result<BigUint, ModuleError> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| ModuleError::Key(format!("{} is not valid base64: {}", field, e)))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn encode_uint(value: &BigUint) -> String {
    BASE64.encode(value.to_bytes_be())
}

/// Public half of an RSA key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    pub exponent: String,
    pub modulus: String,
}

impl PublicKeyRecord {
    pub fn from_key(key: &RsaPublicKey) -> Self {
        Self {
            exponent: encode_uint(key.e()),
            modulus: encode_uint(key.n()),
        }
    }

    pub fn to_key(&self) -> Result<RsaPublicKey, ModuleError> {
        let n = decode_uint("modulus", &self.modulus)?;
        let e = decode_uint("exponent", &self.exponent)?;
        RsaPublicKey::new(n, e).map_err(|e| ModuleError::Key(e.to_string()))
    }

    /// Short stable identifier: hex SHA-256 of exponent and modulus bytes.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.exponent.as_bytes());
        hasher.update(b":");
        hasher.update(self.modulus.as_bytes());
        hasher
            .finalize()
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Check a base64 signature over `text`. Malformed input is simply unverified.
    pub fn verify(&self, text: &str, signature: &str) -> bool {
        let Ok(key) = self.to_key() else {
            return false;
        };
        let Ok(sig) = BASE64.decode(signature.trim()) else {
            return false;
        };
        key.verify(scheme(), &digest(text), &sig).is_ok()
    }
}

/// Private RSA key: public components plus `d` and the two primes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKeyRecord {
    pub exponent: String,
    pub modulus: String,
    pub d: String,
    pub p: String,
    pub q: String,
}

impl std::fmt::Debug for PrivateKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyRecord")
            .field("fingerprint", &self.public().fingerprint())
            .finish_non_exhaustive()
    }
}

impl PrivateKeyRecord {
    pub fn from_key(key: &RsaPrivateKey) -> Result<Self, ModuleError> {
        let primes = key.primes();
        if primes.len() != 2 {
            return Err(ModuleError::Key(format!(
                "expected a two-prime key, found {} primes",
                primes.len()
            )));
        }
        Ok(Self {
            exponent: encode_uint(key.e()),
            modulus: encode_uint(key.n()),
            d: encode_uint(key.d()),
            p: encode_uint(&primes[0]),
            q: encode_uint(&primes[1]),
        })
    }

    pub fn to_key(&self) -> Result<RsaPrivateKey, ModuleError> {
        let key = RsaPrivateKey::from_components(
            decode_uint("modulus", &self.modulus)?,
            decode_uint("exponent", &self.exponent)?,
            decode_uint("d", &self.d)?,
            vec![decode_uint("p", &self.p)?, decode_uint("q", &self.q)?],
        )
        .map_err(|e| ModuleError::Key(e.to_string()))?;
        key.validate().map_err(|e| ModuleError::Key(e.to_string()))?;
        Ok(key)
    }

    pub fn public(&self) -> PublicKeyRecord {
        PublicKeyRecord {
            exponent: self.exponent.clone(),
            modulus: self.modulus.clone(),
        }
    }

    /// Sign `text`, returning the base64 signature.
    pub fn sign(&self, text: &str) -> Result<String, ModuleError> {
        let key = self.to_key()?;
        let sig = key
            .sign(scheme(), &digest(text))
            .map_err(|e| ModuleError::Signature(format!("signing failed: {}", e)))?;
        Ok(BASE64.encode(sig))
    }
}

/// A freshly generated key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKeyRecord,
    pub private: PrivateKeyRecord,
}

impl KeyPair {
    /// Generate a key with a `bits`-bit modulus.
    pub fn generate(bits: usize) -> Result<Self, ModuleError> {
        let mut rng = rsa::rand_core::OsRng;
        let key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| ModuleError::Key(e.to_string()))?;
        let private = PrivateKeyRecord::from_key(&key)?;
        tracing::info!("Generated {}-bit signing key {}", bits, private.public().fingerprint());
        Ok(Self {
            public: private.public(),
            private,
        })
    }
}

/// Keys whose signatures establish author identity without user consent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstPartyKeys {
    keys: Vec<PublicKeyRecord>,
}

impl FirstPartyKeys {
    /// The keys compiled into this build.
    pub fn bundled() -> Self {
        static BUNDLED: OnceLock<Vec<PublicKeyRecord>> = OnceLock::new();
        let keys = BUNDLED.get_or_init(|| {
            vec![PublicKeyRecord {
                exponent: FIRST_PARTY_EXPONENT.to_string(),
                modulus: FIRST_PARTY_MODULUS.to_string(),
            }]
        });
        Self { keys: keys.clone() }
    }

    pub fn custom(keys: Vec<PublicKeyRecord>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[PublicKeyRecord] {
        &self.keys
    }

    pub fn contains(&self, key: &PublicKeyRecord) -> bool {
        self.keys.contains(key)
    }

    /// The first key that verifies `signature` over `text`.
    pub fn verify(&self, text: &str, signature: &str) -> Option<&PublicKeyRecord> {
        self.keys.iter().find(|k| k.verify(text, signature))
    }
}

impl Default for FirstPartyKeys {
    fn default() -> Self {
        Self::bundled()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let pair = test_keys::pair(0);
        let sig = pair.private.sign("fn transform(t, p) { t }").unwrap();
        assert!(pair.public.verify("fn transform(t, p) { t }", &sig));
        assert!(!pair.public.verify("fn transform(t, p) { () }", &sig));
    }

    #[test]
    fn test_other_key_does_not_verify() {
        let sig = test_keys::pair(0).private.sign("source").unwrap();
        assert!(!test_keys::pair(1).public.verify("source", &sig));
    }

    #[test]
    fn test_garbage_signature_is_unverified() {
        assert!(!test_keys::pair(0).public.verify("source", "!!not base64!!"));
        assert!(!test_keys::pair(0).public.verify("source", "AAAA"));
    }

    #[test]
    fn test_private_record_json_round_trip() {
        let pair = test_keys::pair(0);
        let json = serde_json::to_string(&pair.private).unwrap();
        let restored: PrivateKeyRecord = serde_json::from_str(&json).unwrap();
        assert!(restored.to_key().is_ok());
        let sig = restored.sign("x").unwrap();
        assert!(pair.public.verify("x", &sig));
    }

    #[test]
    fn test_bundled_key_parses() {
        let keys = FirstPartyKeys::bundled();
        assert_eq!(keys.keys().len(), 1);
        let key = keys.keys()[0].to_key().unwrap();
        assert_eq!(key.size(), 512);
    }

    #[test]
    fn test_first_party_verify_picks_matching_key() {
        let a = test_keys::pair(0);
        let b = test_keys::pair(1);
        let keys = FirstPartyKeys::custom(vec![a.public.clone(), b.public.clone()]);
        let sig = b.private.sign("text").unwrap();
        assert_eq!(keys.verify("text", &sig), Some(&b.public));
        assert_eq!(keys.verify("other", &sig), None);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let public = &test_keys::pair(0).public;
        assert_eq!(public.fingerprint(), public.clone().fingerprint());
        assert_eq!(public.fingerprint().len(), 32);
        assert_ne!(public.fingerprint(), test_keys::pair(1).public.fingerprint());
    }
}
