//! Serialized module metadata and source (`Module.json`).

use super::crypto::{PrivateKeyRecord, PublicKeyRecord};
use super::kind::ModuleKind;
use super::references::ResolvedReference;
use super::ModuleError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything needed to build a module, minus compiled bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    pub id: Uuid,
    pub kind: ModuleKind,
    pub name: String,
    pub source_code: String,
    #[serde(default)]
    pub additional_reference_ids: Vec<String>,
    #[serde(default)]
    pub source_signature: Option<String>,
    #[serde(default)]
    pub reference_signatures: Option<Vec<String>>,
    /// Key the author claims to have signed with
    #[serde(default)]
    pub signing_key: Option<PublicKeyRecord>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub help_text: String,
}

impl ModuleDescriptor {
    pub fn new(id: Uuid, kind: ModuleKind, name: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            source_code: source_code.into(),
            additional_reference_ids: Vec::new(),
            source_signature: None,
            reference_signatures: None,
            signing_key: None,
            author: String::new(),
            version: "1.0.0".to_string(),
            help_text: String::new(),
        }
    }

    pub fn with_references(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.additional_reference_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>, version: impl Into<String>) -> Self {
        self.author = author.into();
        self.version = version.into();
        self
    }

    pub fn is_signed(&self) -> bool {
        self.source_signature.is_some()
    }

    pub fn from_json(text: &str) -> Result<Self, ModuleError> {
        serde_json::from_str(text).map_err(|e| ModuleError::Descriptor(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ModuleError> {
        serde_json::to_string_pretty(self).map_err(|e| ModuleError::Descriptor(e.to_string()))
    }

    /// Sign the source and each reference with `key`.
    ///
    /// `reference_sources` must hold the text of every additional reference,
    /// in `additional_reference_ids` order.
    pub fn sign(&mut self, key: &PrivateKeyRecord, reference_sources: &[&str]) -> Result<(), ModuleError> {
        if reference_sources.len() != self.additional_reference_ids.len() {
            return Err(ModuleError::Signature(format!(
                "{} references declared but {} supplied for signing",
                self.additional_reference_ids.len(),
                reference_sources.len()
            )));
        }
        self.source_signature = Some(key.sign(&self.source_code)?);
        self.reference_signatures = if reference_sources.is_empty() {
            None
        } else {
            Some(
                reference_sources
                    .iter()
                    .map(|text| key.sign(text))
                    .collect::<Result<_, _>>()?,
            )
        };
        self.signing_key = Some(key.public());
        tracing::debug!("Signed module {} ({})", self.name, self.id);
        Ok(())
    }

    /// Find the key among `keys` that signed the source and every reference
    /// not bundled with the host.
    pub fn verify_signature<'k>(
        &self,
        keys: &'k [PublicKeyRecord],
        references: &[ResolvedReference],
    ) -> Result<&'k PublicKeyRecord, ModuleError> {
        let signature = self
            .source_signature
            .as_deref()
            .ok_or_else(|| ModuleError::Signature("module is not signed".to_string()))?;

        let key = keys
            .iter()
            .find(|k| k.verify(&self.source_code, signature))
            .ok_or_else(|| ModuleError::Signature("source signature not verified".to_string()))?;

        for (i, reference) in references.iter().enumerate() {
            if reference.location.is_host_bundled() {
                continue;
            }
            let sig = self
                .reference_signatures
                .as_ref()
                .and_then(|sigs| sigs.get(i))
                .ok_or_else(|| {
                    ModuleError::Signature(format!("reference {} is not signed", reference.id))
                })?;
            if !key.verify(&reference.source, sig) {
                return Err(ModuleError::Signature(format!(
                    "reference {} signature not verified",
                    reference.id
                )));
            }
        }

        Ok(key)
    }
}
