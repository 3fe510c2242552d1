//! Secure Module Loader
//!
//! Turns a [`ModuleDescriptor`] into a capability-typed [`LoadedModule`]:
//!
//! 1. **Resolve** additional references ([`ReferenceResolver`])
//! 2. **Verify** the signature against first-party keys, then the trusted key
//!    ring, then ask the [`CodePermission`] callback
//! 3. **Compile** source and references into one Rhai AST ([`compile_module`])
//! 4. **Bind** the entry points of the declared [`ModuleKind`] ([`script::bind`])
//! 5. **Merge** declared default settings into the [`GlobalSettings`](crate::config::GlobalSettings)
//!
//! Native modules compiled into the host skip steps 1-4 and are registered
//! directly with [`Registry::register_builtin`].

pub mod compile;
pub mod contracts;
pub mod crypto;
pub mod descriptor;
pub mod keyring;
pub mod kind;
pub mod loader;
pub mod package;
pub mod permission;
pub mod references;
pub mod registry;
pub mod script;

pub use compile::{compile_module, CompiledModule, Diagnostic, Severity};
pub use contracts::{
    ActionModule, ActionOutcome, Attachments, Coordinates, CoordinatesModule, FileTypeModule,
    FurtherTransformationModule, LoadFileModule, LoadedModule, MenuActionModule, ModuleImpl, PlotActionModule,
    PlotContext, Progress, Provenance, SelectionActionModule, StageError, StageResult, TransformerModule,
};
pub use crypto::{FirstPartyKeys, KeyPair, PrivateKeyRecord, PublicKeyRecord};
pub use descriptor::ModuleDescriptor;
pub use keyring::TrustedKeyRing;
pub use kind::{EntryPoint, ModuleKind};
pub use loader::ModuleLoader;
pub use package::{install_package, read_package, write_package, ModulePackage};
pub use permission::{AllowAll, CodePermission, DenyAll, PermissionDecision, PermissionRequest, PermissionSession};
pub use references::{ReferenceLocation, ReferenceResolver, ResolvedReference};
pub use registry::Registry;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building, verifying, loading or installing a module.
///
/// Every variant is fatal to the affected module only. `Signature` is the one
/// the loader recovers from by asking for permission; it only surfaces when
/// permission was refused.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("compilation failed: {}", Diagnostic::summary(.0))]
    Compile(Vec<Diagnostic>),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("module '{module}' does not define required entry point {name}/{arity}")]
    MissingEntryPoint {
        module: String,
        name: String,
        arity: usize,
    },

    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("package error: {0}")]
    Package(String),

    #[error("invalid descriptor: {0}")]
    Descriptor(String),

    #[error("module {0} is not loaded")]
    NotLoaded(Uuid),

    #[error("module {id} is a {actual}, expected a {expected}")]
    WrongKind {
        id: Uuid,
        expected: ModuleKind,
        actual: ModuleKind,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModuleError {
    /// Compile diagnostics, if this is a compile error.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            ModuleError::Compile(d) => d,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_lists_every_diagnostic() {
        let err = ModuleError::Compile(vec![
            Diagnostic::error(Some("a.rhai"), "unexpected '}'"),
            Diagnostic::error(None, "unknown variable"),
        ]);
        let text = err.to_string();
        assert!(text.contains("a.rhai"));
        assert!(text.contains("unknown variable"));
        assert_eq!(err.diagnostics().len(), 2);
    }

    #[test]
    fn test_missing_entry_point_display() {
        let err = ModuleError::MissingEntryPoint {
            module: "Reroot".to_string(),
            name: "transform".to_string(),
            arity: 2,
        };
        assert_eq!(
            err.to_string(),
            "module 'Reroot' does not define required entry point transform/2"
        );
    }
}
