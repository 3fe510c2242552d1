//! Module package archives.
//!
//! A package is a zip file holding:
//!
//! - `Module.json`: the serialized [`ModuleDescriptor`]
//! - `references/<id>`: reference files named in `additionalReferenceIds`
//! - `assets/<name>`: arbitrary files copied to the module's data directory
//!
//! Installing verifies the signature (unless overridden), compiles once to
//! validate, then writes the references to the libraries cache, the assets to
//! `<module data>/<id>/assets` and the descriptor to `<store>/<id>.json`.

use super::contracts::{LoadedModule, Provenance};
use super::descriptor::ModuleDescriptor;
use super::loader::ModuleLoader;
use super::references::{ReferenceLocation, ResolvedReference};
use super::ModuleError;
use crate::config::ModuleRoots;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_FILE: &str = "Module.json";
const REFERENCES_DIR: &str = "references/";
const ASSETS_DIR: &str = "assets/";

/// In-memory contents of a package.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModulePackage {
    pub descriptor: Option<ModuleDescriptor>,
    /// Reference id to source text
    pub references: BTreeMap<String, String>,
    /// Asset name to bytes
    pub assets: BTreeMap<String, Vec<u8>>,
}

impl ModulePackage {
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor: Some(descriptor),
            ..Default::default()
        }
    }

    pub fn with_reference(mut self, id: impl Into<String>, source: impl Into<String>) -> Self {
        self.references.insert(id.into(), source.into());
        self
    }

    pub fn with_asset(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.assets.insert(name.into(), bytes.into());
        self
    }

    fn descriptor(&self) -> Result<&ModuleDescriptor, ModuleError> {
        self.descriptor
            .as_ref()
            .ok_or_else(|| ModuleError::Package(format!("missing {}", MANIFEST_FILE)))
    }

    /// Package references in descriptor order, as they will resolve once
    /// installed into the libraries cache.
    fn references_for(&self, descriptor: &ModuleDescriptor, roots: &ModuleRoots) -> Result<Vec<ResolvedReference>, ModuleError> {
        descriptor
            .additional_reference_ids
            .iter()
            .map(|id| {
                plain_name(id)?;
                let source = self
                    .references
                    .get(id)
                    .ok_or_else(|| ModuleError::ReferenceNotFound(id.clone()))?;
                Ok(ResolvedReference {
                    id: id.clone(),
                    path: roots.libraries_dir.join(id),
                    location: ReferenceLocation::Libraries,
                    source: source.clone(),
                })
            })
            .collect()
    }
}

fn zip_error(e: zip::result::ZipError) -> ModuleError {
    ModuleError::Package(e.to_string())
}

/// Reject names that could escape their target directory.
fn plain_name(name: &str) -> Result<&Path, ModuleError> {
    let path = Path::new(name);
    if name.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(ModuleError::Package(format!("invalid entry name {:?}", name)));
    }
    Ok(path)
}

/// Write `package` to `path` as a zip archive.
pub fn write_package(path: impl AsRef<Path>, package: &ModulePackage) -> Result<(), ModuleError> {
    let descriptor = package.descriptor()?;
    let file = std::fs::File::create(path.as_ref())?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file(MANIFEST_FILE, options).map_err(zip_error)?;
    writer.write_all(descriptor.to_json()?.as_bytes())?;

    for (id, source) in &package.references {
        plain_name(id)?;
        writer
            .start_file(format!("{}{}", REFERENCES_DIR, id), options)
            .map_err(zip_error)?;
        writer.write_all(source.as_bytes())?;
    }
    for (name, bytes) in &package.assets {
        plain_name(name)?;
        writer
            .start_file(format!("{}{}", ASSETS_DIR, name), options)
            .map_err(zip_error)?;
        writer.write_all(bytes)?;
    }

    writer.finish().map_err(zip_error)?;
    tracing::debug!("Wrote package for {} to {:?}", descriptor.name, path.as_ref());
    Ok(())
}

/// Read a package archive. Unknown entries are ignored.
pub fn read_package(path: impl AsRef<Path>) -> Result<ModulePackage, ModuleError> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut archive = ZipArchive::new(file).map_err(zip_error)?;
    let mut package = ModulePackage::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_error)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;

        if name == MANIFEST_FILE {
            let text = String::from_utf8(bytes)
                .map_err(|_| ModuleError::Package(format!("{} is not UTF-8", MANIFEST_FILE)))?;
            package.descriptor = Some(ModuleDescriptor::from_json(&text)?);
        } else if let Some(id) = name.strip_prefix(REFERENCES_DIR) {
            plain_name(id)?;
            let source = String::from_utf8(bytes)
                .map_err(|_| ModuleError::Package(format!("reference {} is not UTF-8", id)))?;
            package.references.insert(id.to_string(), source);
        } else if let Some(asset) = name.strip_prefix(ASSETS_DIR) {
            plain_name(asset)?;
            package.assets.insert(asset.to_string(), bytes);
        } else {
            tracing::trace!("Ignoring package entry {}", name);
        }
    }

    package.descriptor()?;
    Ok(package)
}

/// Path of the stored descriptor for module `id`.
pub fn store_path(roots: &ModuleRoots, id: uuid::Uuid) -> PathBuf {
    roots.store_dir.join(format!("{}.json", id))
}

/// Install the package at `path`.
///
/// With `verify` false the signature check is skipped and the module is
/// recorded as user-permitted. Nothing is written unless the module verifies,
/// compiles and binds.
pub fn install_package(
    loader: &ModuleLoader,
    roots: &ModuleRoots,
    path: impl AsRef<Path>,
    verify: bool,
) -> Result<LoadedModule, ModuleError> {
    let package = read_package(path.as_ref())?;
    let descriptor = package.descriptor()?;
    let references = package.references_for(descriptor, roots)?;

    let provenance = if verify {
        loader.verify(descriptor, &references)?
    } else {
        tracing::warn!("Installing {} without signature verification", descriptor.name);
        Provenance::UserPermitted
    };
    let module = loader.build(descriptor, &references, provenance)?;

    std::fs::create_dir_all(&roots.libraries_dir)?;
    std::fs::create_dir_all(&roots.store_dir)?;
    for reference in &references {
        if let Some(parent) = reference.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&reference.path, &reference.source)?;
    }
    if !package.assets.is_empty() {
        let assets_dir = roots.module_data_dir.join(descriptor.id.to_string()).join("assets");
        std::fs::create_dir_all(&assets_dir)?;
        for (name, bytes) in &package.assets {
            std::fs::write(assets_dir.join(plain_name(name)?), bytes)?;
        }
    }
    std::fs::write(store_path(roots, descriptor.id), descriptor.to_json()?)?;

    tracing::info!("Installed module {} ({})", descriptor.name, descriptor.id);
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::crypto::{test_keys, FirstPartyKeys};
    use crate::module::keyring::TrustedKeyRing;
    use crate::module::kind::ModuleKind;
    use crate::module::permission::{DenyAll, PermissionSession};
    use crate::module::references::ReferenceResolver;
    use crate::scripting::ScriptEngine;
    use std::sync::Arc;
    use uuid::Uuid;

    fn setup() -> (tempfile::TempDir, ModuleRoots, ModuleLoader) {
        let dir = tempfile::tempdir().unwrap();
        let roots = ModuleRoots::with_executable_dir(dir.path().join("data"), dir.path().join("bin"));
        let loader = ModuleLoader::new(
            Arc::new(ScriptEngine::new()),
            ReferenceResolver::new(roots.clone()),
            FirstPartyKeys::custom(vec![test_keys::pair(0).public.clone()]),
            TrustedKeyRing::in_memory(),
            PermissionSession::new(Arc::new(DenyAll)),
        );
        (dir, roots, loader)
    }

    fn signed_package() -> ModulePackage {
        let lib = "fn suffix(name) { name + \"!\" }";
        let mut descriptor = ModuleDescriptor::new(
            Uuid::new_v4(),
            ModuleKind::FurtherTransformation,
            "Exclaim",
            "fn get_parameters(t) { [] } fn transform(t, p) { t.set_name(t.root(), suffix(\"root\")); t }",
        )
        .with_references(["exclaim_lib.rhai"]);
        descriptor.sign(&test_keys::pair(0).private, &[lib]).unwrap();
        ModulePackage::new(descriptor)
            .with_reference("exclaim_lib.rhai", lib)
            .with_asset("readme.md", b"# Exclaim".to_vec())
    }

    #[test]
    fn test_write_then_read() {
        let (dir, _, _) = setup();
        let path = dir.path().join("exclaim.zip");
        let package = signed_package();
        write_package(&path, &package).unwrap();
        assert_eq!(read_package(&path).unwrap(), package);
    }

    #[test]
    fn test_install_persists_and_reloads() {
        let (dir, roots, loader) = setup();
        let path = dir.path().join("exclaim.zip");
        let package = signed_package();
        let id = package.descriptor.as_ref().unwrap().id;
        write_package(&path, &package).unwrap();

        let module = install_package(&loader, &roots, &path, true).unwrap();
        assert_eq!(module.provenance, Provenance::FirstParty);
        assert!(store_path(&roots, id).is_file());
        assert!(roots.libraries_dir.join("exclaim_lib.rhai").is_file());
        assert!(roots.module_data_dir.join(id.to_string()).join("assets/readme.md").is_file());

        let stored = std::fs::read_to_string(store_path(&roots, id)).unwrap();
        let reloaded = loader.load(&ModuleDescriptor::from_json(&stored).unwrap()).unwrap();
        assert_eq!(reloaded.provenance, Provenance::FirstParty);
    }

    #[test]
    fn test_tampered_reference_is_not_installed() {
        let (dir, roots, loader) = setup();
        let path = dir.path().join("exclaim.zip");
        let package = signed_package().with_reference("exclaim_lib.rhai", "fn suffix(n) { n }");
        let id = package.descriptor.as_ref().unwrap().id;
        write_package(&path, &package).unwrap();

        let err = install_package(&loader, &roots, &path, true).unwrap_err();
        assert!(matches!(err, ModuleError::Signature(_)));
        assert!(!store_path(&roots, id).exists());
    }

    #[test]
    fn test_override_skips_verification() {
        let (dir, roots, loader) = setup();
        let path = dir.path().join("unsigned.zip");
        let descriptor = ModuleDescriptor::new(Uuid::new_v4(), ModuleKind::Action, "Hello", "fn perform(t) { \"hi\" }");
        write_package(&path, &ModulePackage::new(descriptor)).unwrap();

        assert!(install_package(&loader, &roots, &path, true).is_err());
        let module = install_package(&loader, &roots, &path, false).unwrap();
        assert_eq!(module.provenance, Provenance::UserPermitted);
    }

    #[test]
    fn test_rejects_escaping_entry_names() {
        assert!(plain_name("../evil.rhai").is_err());
        assert!(plain_name("/etc/passwd").is_err());
        assert!(plain_name("lib/util.rhai").is_ok());
    }
}
