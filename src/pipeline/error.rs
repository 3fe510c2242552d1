//! Pipeline-specific error types and the per-module error table.

use crate::module::ModuleError;
use crate::pipeline::id::StageIndex;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub use crate::module::StageError;

/// Errors that abort a pipeline operation.
///
/// Failures of individual further transformations and plots never surface
/// here; they go to the [`ErrorTable`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Stage {stage} ({module_id}) failed: {message}")]
    Stage {
        stage: StageIndex,
        module_id: Uuid,
        message: String,
    },

    #[error("No input file set")]
    NoInput,

    #[error("No file type module can read {0}")]
    UnsupportedFile(String),

    #[error("Stage {0} does not exist")]
    NoSuchStage(StageIndex),

    #[error("No node is selected")]
    NoSelection,

    #[error("{0} is not available")]
    ActionUnavailable(String),

    #[error("Action {module_id} failed: {message}")]
    Action { module_id: Uuid, message: String },

    #[error("Parameters rejected by stage {0}")]
    ParametersRejected(StageIndex),

    #[error("Invalid pipeline: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// The latest failure reported by one module.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub stage: StageIndex,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Latest failure per module id. A success clears that module's entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorTable {
    entries: BTreeMap<Uuid, StageFailure>,
}

impl ErrorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure, replacing any earlier one for `module_id`.
    pub fn record(&mut self, module_id: Uuid, stage: StageIndex, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("Stage {} ({}) failed: {}", stage, module_id, message);
        self.entries.insert(
            module_id,
            StageFailure {
                stage,
                message,
                at: Utc::now(),
            },
        );
    }

    /// Forget `module_id`'s failure. Returns whether there was one.
    pub fn clear(&mut self, module_id: Uuid) -> bool {
        self.entries.remove(&module_id).is_some()
    }

    pub fn get(&self, module_id: Uuid) -> Option<&StageFailure> {
        self.entries.get(&module_id)
    }

    /// Aggregate warning count surfaced to the host.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &StageFailure)> {
        self.entries.iter()
    }
}
