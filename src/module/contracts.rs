//! Capability contracts, one trait per [`ModuleKind`].
//!
//! The engine only sees these traits. Whether a module is native code
//! compiled into the host or a Rhai script bound at load time is invisible to
//! it.

use super::kind::ModuleKind;
use crate::params::{ParameterChange, ParameterMap, ParameterSpec};
use crate::render::{ImageCache, LayerContent, Point};
use crate::scripting::ScriptEngine;
use crate::tree::{NodeIdx, Tree, TreeCollection};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Failure of one stage operation. Never fatal to the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<Box<rhai::EvalAltResult>> for StageError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        StageError::new(err.to_string())
    }
}

impl From<crate::error::TreeVisError> for StageError {
    fn from(err: crate::error::TreeVisError) -> Self {
        StageError::new(err.to_string())
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Advisory progress callback, fraction in `0.0..=1.0`.
pub type Progress<'a> = &'a dyn Fn(f64);

/// Node positions keyed by node id.
pub type Coordinates = BTreeMap<String, Point>;

/// Named binary blobs stored with a pipeline.
pub type Attachments = BTreeMap<String, Arc<[u8]>>;

/// Everything a plot stage may read.
pub struct PlotContext<'a> {
    pub tree: &'a Tree,
    pub coordinates: &'a Coordinates,
    pub attachments: &'a Attachments,
    pub images: &'a ImageCache,
    pub engine: &'a ScriptEngine,
}

/// What an action asks the host to do next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    /// Further transformations to append with their default parameters
    pub further_transformations: Vec<Uuid>,
    /// Text to show or copy
    pub message: Option<String>,
}

pub trait FileTypeModule: Send + Sync {
    fn extensions(&self) -> Vec<String>;

    /// Confidence that this module can read the file; 0 means no.
    fn is_supported(&self, file_name: &str, header: &str) -> i64;

    fn open(&self, file_name: &str, text: &str, progress: Progress<'_>) -> StageResult<Vec<Tree>>;
}

pub trait LoadFileModule: Send + Sync {
    fn get_parameters(&self, _file_name: &str) -> Vec<ParameterSpec> {
        Vec::new()
    }

    fn on_parameter_change(&self, _previous: &ParameterMap, _current: &ParameterMap) -> ParameterChange {
        ParameterChange::accept()
    }

    fn load(&self, trees: Vec<Tree>, params: &ParameterMap, progress: Progress<'_>) -> StageResult<TreeCollection>;
}

pub trait TransformerModule: Send + Sync {
    fn get_parameters(&self, trees: &TreeCollection) -> Vec<ParameterSpec>;

    fn on_parameter_change(
        &self,
        _trees: &TreeCollection,
        _previous: &ParameterMap,
        _current: &ParameterMap,
    ) -> ParameterChange {
        ParameterChange::accept()
    }

    fn transform(&self, trees: &TreeCollection, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Tree>;
}

pub trait FurtherTransformationModule: Send + Sync {
    fn get_parameters(&self, tree: &Tree) -> Vec<ParameterSpec>;

    fn on_parameter_change(&self, _tree: &Tree, _previous: &ParameterMap, _current: &ParameterMap) -> ParameterChange {
        ParameterChange::accept()
    }

    /// Mutate `tree` in place. On error the caller discards `tree`.
    fn execute(&self, tree: &mut Tree, params: &ParameterMap, progress: Progress<'_>) -> StageResult<()>;
}

pub trait CoordinatesModule: Send + Sync {
    fn get_parameters(&self, tree: &Tree) -> Vec<ParameterSpec>;

    fn on_parameter_change(&self, _tree: &Tree, _previous: &ParameterMap, _current: &ParameterMap) -> ParameterChange {
        ParameterChange::accept()
    }

    fn compute(&self, tree: &Tree, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Coordinates>;
}

pub trait PlotActionModule: Send + Sync {
    fn get_parameters(&self, tree: &Tree) -> Vec<ParameterSpec>;

    fn on_parameter_change(&self, _tree: &Tree, _previous: &ParameterMap, _current: &ParameterMap) -> ParameterChange {
        ParameterChange::accept()
    }

    fn plot(
        &self,
        context: &PlotContext<'_>,
        params: &ParameterMap,
        progress: Progress<'_>,
    ) -> StageResult<Arc<dyn LayerContent>>;
}

pub trait SelectionActionModule: Send + Sync {
    fn is_available(&self, _tree: &Tree, _node: NodeIdx) -> bool {
        true
    }

    fn perform(&self, tree: &Tree, node: NodeIdx) -> StageResult<ActionOutcome>;
}

pub trait ActionModule: Send + Sync {
    fn is_enabled(&self, _tree: Option<&Tree>) -> bool {
        true
    }

    fn perform(&self, tree: Option<&Tree>) -> StageResult<ActionOutcome>;
}

pub trait MenuActionModule: Send + Sync {
    fn is_enabled(&self, _tree: Option<&Tree>) -> bool {
        true
    }

    fn perform(&self, tree: Option<&Tree>) -> StageResult<ActionOutcome>;
}

/// The bound implementation of a module.
#[derive(Clone)]
pub enum ModuleImpl {
    FileType(Arc<dyn FileTypeModule>),
    LoadFile(Arc<dyn LoadFileModule>),
    Transformer(Arc<dyn TransformerModule>),
    FurtherTransformation(Arc<dyn FurtherTransformationModule>),
    Coordinates(Arc<dyn CoordinatesModule>),
    PlotAction(Arc<dyn PlotActionModule>),
    SelectionAction(Arc<dyn SelectionActionModule>),
    Action(Arc<dyn ActionModule>),
    MenuAction(Arc<dyn MenuActionModule>),
}

impl ModuleImpl {
    pub fn kind(&self) -> ModuleKind {
        match self {
            ModuleImpl::FileType(_) => ModuleKind::FileType,
            ModuleImpl::LoadFile(_) => ModuleKind::LoadFile,
            ModuleImpl::Transformer(_) => ModuleKind::Transformer,
            ModuleImpl::FurtherTransformation(_) => ModuleKind::FurtherTransformation,
            ModuleImpl::Coordinates(_) => ModuleKind::Coordinates,
            ModuleImpl::PlotAction(_) => ModuleKind::PlotAction,
            ModuleImpl::SelectionAction(_) => ModuleKind::SelectionAction,
            ModuleImpl::Action(_) => ModuleKind::Action,
            ModuleImpl::MenuAction(_) => ModuleKind::MenuAction,
        }
    }
}

/// How a module earned the right to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Native code compiled into the host
    BuiltIn,
    /// Verified against the bundled first-party keys
    FirstParty,
    /// Verified against the user's trusted key ring
    TrustedKey,
    /// Unverified, allowed by the permission callback
    UserPermitted,
}

/// A module ready for use by the engine.
#[derive(Clone)]
pub struct LoadedModule {
    pub id: Uuid,
    pub name: String,
    pub author: String,
    pub version: String,
    pub help_text: String,
    pub provenance: Provenance,
    /// Defaults merged into the global settings namespace on load
    pub default_settings: BTreeMap<String, serde_json::Value>,
    pub implementation: ModuleImpl,
}

macro_rules! accessor {
    ($name:ident, $variant:ident, $trait:ident) => {
        pub fn $name(&self) -> Option<&Arc<dyn $trait>> {
            match &self.implementation {
                ModuleImpl::$variant(m) => Some(m),
                _ => None,
            }
        }
    };
}

impl LoadedModule {
    /// A native module compiled into the host.
    pub fn builtin(id: Uuid, name: impl Into<String>, implementation: ModuleImpl) -> Self {
        Self {
            id,
            name: name.into(),
            author: "TreeVis".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            help_text: String::new(),
            provenance: Provenance::BuiltIn,
            default_settings: BTreeMap::new(),
            implementation,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help_text = help.into();
        self
    }

    pub fn with_default_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.default_settings.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> ModuleKind {
        self.implementation.kind()
    }

    accessor!(as_file_type, FileType, FileTypeModule);
    accessor!(as_load_file, LoadFile, LoadFileModule);
    accessor!(as_transformer, Transformer, TransformerModule);
    accessor!(as_further_transformation, FurtherTransformation, FurtherTransformationModule);
    accessor!(as_coordinates, Coordinates, CoordinatesModule);
    accessor!(as_plot_action, PlotAction, PlotActionModule);
    accessor!(as_selection_action, SelectionAction, SelectionActionModule);
    accessor!(as_action, Action, ActionModule);
    accessor!(as_menu_action, MenuAction, MenuActionModule);
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("provenance", &self.provenance)
            .finish()
    }
}
