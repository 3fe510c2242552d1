//! Resolution of a module's additional reference files.
//!
//! Lookup order: beside the host executable, then the libraries cache (and any
//! configured extra library dirs), then the module data root. Files found
//! beside the executable ship with the host and need no per-file signature.

use super::ModuleError;
use crate::config::ModuleRoots;
use std::path::{Component, Path, PathBuf};

/// Where a reference was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceLocation {
    HostDirectory,
    Libraries,
    ModuleData,
}

impl ReferenceLocation {
    /// Whether the file is covered by the host's own provenance.
    pub fn is_host_bundled(self) -> bool {
        matches!(self, ReferenceLocation::HostDirectory)
    }
}

/// A reference file located and read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReference {
    pub id: String,
    pub path: PathBuf,
    pub location: ReferenceLocation,
    pub source: String,
}

/// Finds reference files under the configured roots.
#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    roots: ModuleRoots,
}

impl ReferenceResolver {
    pub fn new(roots: ModuleRoots) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &ModuleRoots {
        &self.roots
    }

    fn candidates(&self) -> Vec<(ReferenceLocation, &Path)> {
        let mut dirs = vec![(ReferenceLocation::HostDirectory, self.roots.executable_dir.as_path())];
        dirs.extend(
            self.roots
                .library_dirs()
                .map(|d| (ReferenceLocation::Libraries, d.as_path())),
        );
        dirs.push((ReferenceLocation::ModuleData, self.roots.module_data_dir.as_path()));
        dirs
    }

    /// Locate and read one reference.
    pub fn resolve(&self, id: &str) -> Result<ResolvedReference, ModuleError> {
        let relative = Path::new(id);
        let is_plain = !id.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(ModuleError::ReferenceNotFound(id.to_string()));
        }

        for (location, dir) in self.candidates() {
            let path = dir.join(relative);
            if path.is_file() {
                let source = std::fs::read_to_string(&path)?;
                tracing::trace!("Resolved reference {} at {:?} ({:?})", id, path, location);
                return Ok(ResolvedReference {
                    id: id.to_string(),
                    path,
                    location,
                    source,
                });
            }
        }

        Err(ModuleError::ReferenceNotFound(id.to_string()))
    }

    /// Resolve every id in order; the first missing one fails the whole set.
    pub fn resolve_all(&self, ids: &[String]) -> Result<Vec<ResolvedReference>, ModuleError> {
        ids.iter().map(|id| self.resolve(id)).collect()
    }
}
