//! Resolve, verify, compile and bind one module.

use super::compile::compile_module;
use super::contracts::{LoadedModule, Provenance};
use super::crypto::{short_digest, FirstPartyKeys, PublicKeyRecord};
use super::descriptor::ModuleDescriptor;
use super::keyring::TrustedKeyRing;
use super::permission::{PermissionDecision, PermissionRequest, PermissionSession};
use super::references::{ReferenceResolver, ResolvedReference};
use super::{script, ModuleError};
use crate::scripting::ScriptEngine;
use parking_lot::RwLock;
use std::sync::Arc;

/// The verification tiers and the compile/bind steps, without any module table.
pub struct ModuleLoader {
    engine: Arc<ScriptEngine>,
    resolver: ReferenceResolver,
    first_party: FirstPartyKeys,
    key_ring: Arc<RwLock<TrustedKeyRing>>,
    permission: PermissionSession,
    trust_key_on_grant: bool,
}

impl ModuleLoader {
    pub fn new(
        engine: Arc<ScriptEngine>,
        resolver: ReferenceResolver,
        first_party: FirstPartyKeys,
        key_ring: TrustedKeyRing,
        permission: PermissionSession,
    ) -> Self {
        Self {
            engine,
            resolver,
            first_party,
            key_ring: Arc::new(RwLock::new(key_ring)),
            permission,
            trust_key_on_grant: false,
        }
    }

    /// Trust the signer's key on every grant, not only on `GrantedAndTrusted`.
    pub fn with_trust_key_on_grant(mut self, trust: bool) -> Self {
        self.trust_key_on_grant = trust;
        self
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        &self.engine
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    pub fn first_party(&self) -> &FirstPartyKeys {
        &self.first_party
    }

    pub fn key_ring(&self) -> &Arc<RwLock<TrustedKeyRing>> {
        &self.key_ring
    }

    pub fn permission(&self) -> &PermissionSession {
        &self.permission
    }

    /// Resolve references, verify, compile and bind `descriptor`.
    pub fn load(&self, descriptor: &ModuleDescriptor) -> Result<LoadedModule, ModuleError> {
        tracing::debug!("Loading module {} ({}, {})", descriptor.name, descriptor.id, descriptor.kind);
        let references = self.resolver.resolve_all(&descriptor.additional_reference_ids)?;
        let provenance = self.verify(descriptor, &references)?;
        self.build(descriptor, &references, provenance)
    }

    /// Compile and bind without any signature check. The caller vouches for
    /// `provenance`.
    pub fn build(
        &self,
        descriptor: &ModuleDescriptor,
        references: &[ResolvedReference],
        provenance: Provenance,
    ) -> Result<LoadedModule, ModuleError> {
        let compiled = compile_module(&self.engine, descriptor, references)?;
        for warning in compiled.warnings() {
            tracing::warn!("{}: {}", descriptor.name, warning);
        }
        let (implementation, default_settings) = script::bind(self.engine.clone(), descriptor, compiled)?;
        tracing::info!("Loaded module {} ({:?})", descriptor.name, provenance);
        Ok(LoadedModule {
            id: descriptor.id,
            name: descriptor.name.clone(),
            author: descriptor.author.clone(),
            version: descriptor.version.clone(),
            help_text: descriptor.help_text.clone(),
            provenance,
            default_settings,
            implementation,
        })
    }

    /// Decide whether `descriptor` may run.
    ///
    /// First-party keys, then the trusted ring, then the permission callback.
    /// Fails with [`ModuleError::Signature`] only when permission is refused.
    pub fn verify(
        &self,
        descriptor: &ModuleDescriptor,
        references: &[ResolvedReference],
    ) -> Result<Provenance, ModuleError> {
        let reason = match descriptor.verify_signature(self.first_party.keys(), references) {
            Ok(key) => {
                tracing::debug!("{} signed by first-party key {}", descriptor.name, key.fingerprint());
                return Ok(Provenance::FirstParty);
            }
            Err(e) => e.to_string(),
        };

        if let Ok(key) = descriptor.verify_signature(self.key_ring.read().keys(), references) {
            tracing::debug!("{} signed by trusted key {}", descriptor.name, key.fingerprint());
            return Ok(Provenance::TrustedKey);
        }

        // A claimed key only identifies the signer once it verifies the signature
        let signer = descriptor
            .signing_key
            .as_ref()
            .filter(|key| {
                descriptor
                    .verify_signature(std::slice::from_ref(*key), references)
                    .is_ok()
            })
            .cloned();
        let request = PermissionRequest {
            subject: descriptor.name.clone(),
            module_id: Some(descriptor.id),
            public_key: signer.clone(),
            code_digest: module_digest(descriptor, references),
            reason: reason.clone(),
        };
        let decision = self.permission.ask(&request);
        if !decision.is_granted() {
            tracing::warn!("Refusing to load {}: {}", descriptor.name, reason);
            return Err(ModuleError::Signature(reason));
        }

        if let Some(key) = signer {
            if self.should_trust(decision) {
                self.key_ring.write().trust(key)?;
            }
        }
        Ok(Provenance::UserPermitted)
    }

    /// Verify a signed document (such as a serialized pipeline) with the
    /// same tiers as modules.
    ///
    /// `signed` carries the signature and the key it claims. Returns `None`
    /// when the document is not verified and permission was refused.
    pub fn verify_document(
        &self,
        subject: &str,
        text: &str,
        signed: Option<(&str, &PublicKeyRecord)>,
    ) -> Result<Option<Provenance>, ModuleError> {
        if let Some((signature, _)) = signed {
            if self.first_party.verify(text, signature).is_some() {
                return Ok(Some(Provenance::FirstParty));
            }
            if self.key_ring.read().verify(text, signature).is_some() {
                return Ok(Some(Provenance::TrustedKey));
            }
        }

        let signer = signed
            .filter(|(signature, key)| key.verify(text, signature))
            .map(|(_, key)| key.clone());
        let request = PermissionRequest {
            subject: subject.to_string(),
            module_id: None,
            public_key: signer.clone(),
            code_digest: short_digest(&[text]),
            reason: if signed.is_some() {
                "signature not verified by any trusted key".to_string()
            } else {
                "not signed".to_string()
            },
        };
        let decision = self.permission.ask(&request);
        if !decision.is_granted() {
            return Ok(None);
        }
        if let Some(key) = signer {
            if self.should_trust(decision) {
                self.key_ring.write().trust(key)?;
            }
        }
        Ok(Some(Provenance::UserPermitted))
    }

    fn should_trust(&self, decision: PermissionDecision) -> bool {
        decision == PermissionDecision::GrantedAndTrusted || (self.trust_key_on_grant && decision.is_granted())
    }
}

/// Digest of everything a module would execute: its source and every reference.
fn module_digest(descriptor: &ModuleDescriptor, references: &[ResolvedReference]) -> String {
    let mut parts = vec![descriptor.source_code.as_str()];
    parts.extend(references.iter().map(|r| r.source.as_str()));
    short_digest(&parts)
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("first_party", &self.first_party.keys().len())
            .field("trusted", &self.key_ring.read().len())
            .field("trust_key_on_grant", &self.trust_key_on_grant)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleRoots;
    use crate::module::crypto::test_keys;
    use crate::module::kind::ModuleKind;
    use crate::module::permission::{DenyAll, MockCodePermission};
    use uuid::Uuid;

    const SOURCE: &str = "fn get_parameters(tree) { [] } fn transform(tree, params) { tree }";

    fn loader(dir: &std::path::Path, callback: Arc<dyn super::super::CodePermission>) -> ModuleLoader {
        let roots = ModuleRoots::with_executable_dir(dir.join("data"), dir.join("bin"));
        ModuleLoader::new(
            Arc::new(ScriptEngine::new()),
            ReferenceResolver::new(roots),
            FirstPartyKeys::custom(vec![test_keys::pair(0).public.clone()]),
            TrustedKeyRing::in_memory(),
            PermissionSession::new(callback),
        )
    }

    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new(Uuid::new_v4(), ModuleKind::FurtherTransformation, "Identity", SOURCE)
    }

    #[test]
    fn test_first_party_needs_no_permission() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission().never();
        let loader = loader(dir.path(), Arc::new(mock));

        let mut d = descriptor();
        d.sign(&test_keys::pair(0).private, &[]).unwrap();
        let module = loader.load(&d).unwrap();
        assert_eq!(module.provenance, Provenance::FirstParty);
        assert!(module.as_further_transformation().is_some());
    }

    #[test]
    fn test_denied_unsigned_module_fails_with_signature_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), Arc::new(DenyAll));
        let err = loader.load(&descriptor()).unwrap_err();
        assert!(matches!(err, ModuleError::Signature(_)));
    }

    #[test]
    fn test_granted_and_trusted_skips_prompt_next_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission()
            .times(1)
            .returning(|_| PermissionDecision::GrantedAndTrusted);
        let loader = loader(dir.path(), Arc::new(mock));

        let third_party = &test_keys::pair(1).private;
        let mut first = descriptor();
        first.sign(third_party, &[]).unwrap();
        assert_eq!(loader.load(&first).unwrap().provenance, Provenance::UserPermitted);
        assert_eq!(loader.key_ring().read().len(), 1);

        loader.permission().reset();
        let mut second = descriptor();
        second.sign(third_party, &[]).unwrap();
        assert_eq!(loader.load(&second).unwrap().provenance, Provenance::TrustedKey);
    }

    #[test]
    fn test_forged_key_claim_is_not_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission()
            .returning(|_| PermissionDecision::GrantedAndTrusted);
        let loader = loader(dir.path(), Arc::new(mock));

        let mut d = descriptor();
        d.sign(&test_keys::pair(1).private, &[]).unwrap();
        d.source_code.push_str("\nfn extra() { 1 }");
        assert_eq!(loader.load(&d).unwrap().provenance, Provenance::UserPermitted);
        assert!(loader.key_ring().read().is_empty());
    }

    #[test]
    fn test_claimed_key_does_not_reuse_grant() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission()
            .times(1)
            .withf(|request| request.public_key.is_some())
            .returning(|_| PermissionDecision::Granted);
        mock.expect_ask_for_code_permission()
            .times(1)
            .withf(|request| request.public_key.is_none())
            .returning(|_| PermissionDecision::Denied);
        let loader = loader(dir.path(), Arc::new(mock));

        let signer = test_keys::pair(1);
        let mut genuine = descriptor();
        genuine.sign(&signer.private, &[]).unwrap();
        assert_eq!(loader.load(&genuine).unwrap().provenance, Provenance::UserPermitted);

        let mut forged = ModuleDescriptor::new(
            Uuid::new_v4(),
            ModuleKind::FurtherTransformation,
            "Forged",
            "fn get_parameters(tree) { [] } fn transform(tree, params) { tree.set_name(tree.root(), \"x\"); tree }",
        );
        forged.signing_key = Some(signer.public.clone());
        assert!(matches!(loader.load(&forged), Err(ModuleError::Signature(_))));
    }

    #[test]
    fn test_granted_document_does_not_cover_other_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockCodePermission::new();
        mock.expect_ask_for_code_permission()
            .times(2)
            .returning(|_| PermissionDecision::Granted);
        let loader = loader(dir.path(), Arc::new(mock));
        let signer = test_keys::pair(1);
        let signature = signer.private.sign("first").unwrap();

        let first = loader
            .verify_document("pipeline", "first", Some((&signature, &signer.public)))
            .unwrap();
        assert_eq!(first, Some(Provenance::UserPermitted));
        // Same claimed key, but the signature does not cover this text
        let second = loader
            .verify_document("pipeline", "second", Some((&signature, &signer.public)))
            .unwrap();
        assert_eq!(second, Some(Provenance::UserPermitted));
        assert!(loader.key_ring().read().is_empty());
    }

    #[test]
    fn test_compile_error_is_fatal_even_when_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), Arc::new(DenyAll));
        let mut d = ModuleDescriptor::new(Uuid::new_v4(), ModuleKind::Action, "Broken", "fn perform(t) {");
        d.sign(&test_keys::pair(0).private, &[]).unwrap();
        assert!(matches!(loader.load(&d), Err(ModuleError::Compile(_))));
    }

    #[test]
    fn test_missing_reference_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), Arc::new(DenyAll));
        let d = descriptor().with_references(vec!["missing.rhai".to_string()]);
        assert!(matches!(loader.load(&d), Err(ModuleError::ReferenceNotFound(_))));
    }

    #[test]
    fn test_verify_document_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), Arc::new(DenyAll));
        let text = "[[\"pipeline\"]]";
        let first_party = test_keys::pair(0);
        let signature = first_party.private.sign(text).unwrap();

        let verified = loader
            .verify_document("pipeline", text, Some((&signature, &first_party.public)))
            .unwrap();
        assert_eq!(verified, Some(Provenance::FirstParty));
        assert_eq!(loader.verify_document("pipeline", text, None).unwrap(), None);
    }
}
