//! The explicit module table shared by the loader and the pipeline engine.

use super::contracts::LoadedModule;
use super::crypto::FirstPartyKeys;
use super::descriptor::ModuleDescriptor;
use super::keyring::TrustedKeyRing;
use super::kind::ModuleKind;
use super::loader::ModuleLoader;
use super::package::install_package;
use super::permission::{CodePermission, PermissionSession};
use super::references::ReferenceResolver;
use super::ModuleError;
use crate::config::{AppConfig, GlobalSettings, ModuleRoots};
use crate::scripting::ScriptEngine;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Loaded modules by id, the global settings namespace and the loader.
///
/// One registry lives for the lifetime of the host process and is shared by
/// every pipeline through an `Arc`.
pub struct Registry {
    modules: RwLock<BTreeMap<Uuid, Arc<LoadedModule>>>,
    settings: RwLock<GlobalSettings>,
    loader: ModuleLoader,
    roots: ModuleRoots,
}

impl Registry {
    pub fn new(loader: ModuleLoader, roots: ModuleRoots) -> Self {
        Self {
            modules: RwLock::new(BTreeMap::new()),
            settings: RwLock::new(GlobalSettings::new()),
            loader,
            roots,
        }
    }

    /// Registry for `roots` with the bundled first-party keys and the
    /// persisted key ring.
    pub fn open(
        roots: ModuleRoots,
        permission: Arc<dyn CodePermission>,
        config: &AppConfig,
    ) -> Result<Self, ModuleError> {
        let key_ring = TrustedKeyRing::load(&roots.key_ring_path)?;
        let loader = ModuleLoader::new(
            Arc::new(ScriptEngine::new()),
            ReferenceResolver::new(roots.clone()),
            FirstPartyKeys::bundled(),
            key_ring,
            PermissionSession::new(permission),
        )
        .with_trust_key_on_grant(config.security.trust_key_on_grant);
        Ok(Self::new(loader, roots))
    }

    /// Register every built-in module.
    pub fn with_builtins(self) -> Self {
        for module in crate::builtin::all() {
            self.register_builtin(module);
        }
        self
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        self.loader.engine()
    }

    pub fn roots(&self) -> &ModuleRoots {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<LoadedModule>> {
        self.modules.read().get(&id).cloned()
    }

    /// The module `id`, which must be of `kind`.
    pub fn require(&self, id: Uuid, kind: ModuleKind) -> Result<Arc<LoadedModule>, ModuleError> {
        let module = self.get(id).ok_or(ModuleError::NotLoaded(id))?;
        if module.kind() != kind {
            return Err(ModuleError::WrongKind {
                id,
                expected: kind,
                actual: module.kind(),
            });
        }
        Ok(module)
    }

    pub fn modules_of_kind(&self, kind: ModuleKind) -> Vec<Arc<LoadedModule>> {
        self.modules
            .read()
            .values()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    /// The file type module most confident it can read `file_name`.
    pub fn file_type_for(&self, file_name: &str, header: &str) -> Option<Arc<LoadedModule>> {
        self.modules_of_kind(ModuleKind::FileType)
            .into_iter()
            .filter_map(|m| {
                let score = m.as_file_type()?.is_supported(file_name, header);
                (score > 0).then_some((score, m))
            })
            .max_by_key(|(score, _)| *score)
            .map(|(_, m)| m)
    }

    /// Read access to the global settings namespace.
    pub fn settings(&self) -> parking_lot::RwLockReadGuard<'_, GlobalSettings> {
        self.settings.read()
    }

    pub fn set_setting(&self, namespace: &str, key: &str, value: serde_json::Value) {
        self.settings.write().set(namespace, key, value);
    }

    fn insert(&self, module: LoadedModule) -> Arc<LoadedModule> {
        if !module.default_settings.is_empty() {
            self.settings.write().merge_module_defaults(
                module.id,
                module.kind().settings_namespace(),
                module.default_settings.clone(),
            );
        }
        let module = Arc::new(module);
        if let Some(previous) = self.modules.write().insert(module.id, module.clone()) {
            tracing::debug!("Replaced module {} ({})", previous.name, previous.id);
        }
        module
    }

    /// Add a native module. Built-ins carry no signature and are never gated.
    pub fn register_builtin(&self, module: LoadedModule) -> Arc<LoadedModule> {
        tracing::trace!("Registering built-in {} ({})", module.name, module.kind());
        self.insert(module)
    }

    /// Load a script module and add it to the table.
    pub fn load(&self, descriptor: &ModuleDescriptor) -> Result<Arc<LoadedModule>, ModuleError> {
        let module = self.loader.load(descriptor).inspect_err(|e| {
            tracing::error!("Failed to load module {} ({}): {}", descriptor.name, descriptor.id, e);
        })?;
        Ok(self.insert(module))
    }

    /// Install a package into the module store and load it.
    pub fn install(&self, package: impl AsRef<Path>, verify: bool) -> Result<Arc<LoadedModule>, ModuleError> {
        let module = install_package(&self.loader, &self.roots, package, verify)?;
        Ok(self.insert(module))
    }

    /// Load every descriptor in the module store.
    ///
    /// A module that fails does not stop the others; failures are returned
    /// with the descriptor path.
    pub fn load_installed(&self) -> Vec<(PathBuf, ModuleError)> {
        let entries = match std::fs::read_dir(&self.roots.store_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => return vec![(self.roots.store_dir.clone(), e.into())],
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut failures = Vec::new();
        for path in paths {
            let result = std::fs::read_to_string(&path)
                .map_err(ModuleError::from)
                .and_then(|text| ModuleDescriptor::from_json(&text))
                .and_then(|descriptor| self.load(&descriptor));
            if let Err(e) = result {
                failures.push((path, e));
            }
        }
        tracing::info!(
            "Loaded installed modules: {} total, {} failed",
            self.len(),
            failures.len()
        );
        failures
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.len())
            .field("loader", &self.loader)
            .finish()
    }
}
