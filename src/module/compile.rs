//! Compilation of module source plus references into one Rhai AST.
//!
//! Every file is compiled before failing so the author sees all errors at
//! once. No partial module is produced on error.

use super::descriptor::ModuleDescriptor;
use super::kind::{EntryPoint, GLOBAL_SETTINGS};
use super::references::ResolvedReference;
use super::ModuleError;
use crate::scripting::ScriptEngine;
use rhai::AST;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// One compiler message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Source file the message is about; `None` for the module source
    pub file: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(file: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            file: file.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn warning(file: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            file: file.map(str::to_string),
            message: message.into(),
        }
    }

    /// `"; "`-joined rendering of `diagnostics`.
    pub fn summary(diagnostics: &[Diagnostic]) -> String {
        diagnostics
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match &self.file {
            Some(file) => write!(f, "{} in {}: {}", level, file, self.message),
            None => write!(f, "{}: {}", level, self.message),
        }
    }
}

/// Source and references merged into one executable AST.
#[derive(Clone)]
pub struct CompiledModule {
    ast: Arc<AST>,
    functions: HashSet<(String, usize)>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompiledModule {
    pub fn ast(&self) -> &Arc<AST> {
        &self.ast
    }

    /// Whether the AST defines `name` taking exactly `arity` parameters.
    pub fn defines(&self, name: &str, arity: usize) -> bool {
        self.functions.contains(&(name.to_string(), arity))
    }

    pub fn has_entry_point(&self, entry: &EntryPoint) -> bool {
        self.defines(entry.name, entry.arity)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Warning)
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("functions", &self.functions.len())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

/// Compile `descriptor`'s source together with its resolved references.
pub fn compile_module(
    engine: &ScriptEngine,
    descriptor: &ModuleDescriptor,
    references: &[ResolvedReference],
) -> Result<CompiledModule, ModuleError> {
    let mut diagnostics = Vec::new();
    let mut merged = AST::empty();

    for reference in references {
        if !reference.location.is_host_bundled() {
            diagnostics.push(Diagnostic::warning(
                Some(&reference.id),
                format!("resolved outside the host directory at {:?}", reference.path),
            ));
        }
        match engine.engine().compile(&reference.source) {
            Ok(ast) => merged = merged.merge(&ast),
            Err(e) => diagnostics.push(Diagnostic::error(Some(&reference.id), e.to_string())),
        }
    }

    match engine.engine().compile(&descriptor.source_code) {
        Ok(ast) => merged = merged.merge(&ast),
        Err(e) => diagnostics.push(Diagnostic::error(None, e.to_string())),
    }

    if diagnostics.iter().any(|d| d.severity == Severity::Error) {
        tracing::error!(
            "Compilation of module {} ({}) failed: {}",
            descriptor.name,
            descriptor.id,
            Diagnostic::summary(&diagnostics)
        );
        return Err(ModuleError::Compile(diagnostics));
    }

    let functions: HashSet<(String, usize)> = merged
        .iter_functions()
        .map(|f| (f.name.to_string(), f.params.len()))
        .collect();

    for entry in descriptor.kind.entry_points().iter().chain([&GLOBAL_SETTINGS]) {
        if !entry.required && !functions.contains(&(entry.name.to_string(), entry.arity)) {
            diagnostics.push(Diagnostic::warning(
                None,
                format!("optional entry point {}/{} not defined", entry.name, entry.arity),
            ));
        }
    }

    tracing::debug!(
        "Compiled module {} ({} functions, {} warnings)",
        descriptor.name,
        functions.len(),
        diagnostics.len()
    );

    Ok(CompiledModule {
        ast: Arc::new(merged),
        functions,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::kind::ModuleKind;
    use crate::module::references::ReferenceLocation;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn reference(id: &str, source: &str) -> ResolvedReference {
        ResolvedReference {
            id: id.to_string(),
            path: PathBuf::from(id),
            location: ReferenceLocation::Libraries,
            source: source.to_string(),
        }
    }

    #[test]
    fn test_merges_references() {
        let engine = ScriptEngine::new();
        let d = ModuleDescriptor::new(
            Uuid::new_v4(),
            ModuleKind::FurtherTransformation,
            "Uses lib",
            "fn get_parameters(tree) { [] } fn transform(tree, params) { helper(tree) }",
        );
        let compiled = compile_module(&engine, &d, &[reference("lib.rhai", "fn helper(t) { t }")]).unwrap();
        assert!(compiled.defines("helper", 1));
        assert!(compiled.defines("transform", 2));
        assert!(compiled.warnings().any(|w| w.file.as_deref() == Some("lib.rhai")));
        assert!(compiled.warnings().any(|w| w.message.contains("on_parameter_change")));
    }

    #[test]
    fn test_errors_from_every_file_are_aggregated() {
        let engine = ScriptEngine::new();
        let d = ModuleDescriptor::new(Uuid::new_v4(), ModuleKind::Action, "Broken", "fn perform(t) { ");
        let err = compile_module(&engine, &d, &[reference("bad.rhai", "fn (")]).unwrap_err();
        match err {
            ModuleError::Compile(diags) => {
                let errors: Vec<_> = diags.iter().filter(|d| d.severity == Severity::Error).collect();
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].file.as_deref(), Some("bad.rhai"));
                assert_eq!(errors[1].file, None);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
