//! Error handling for TreeVis-RS
//!
//! This module defines the crate-wide error type and a Result alias. The
//! loader and the pipeline engine have their own error enums
//! ([`crate::module::ModuleError`], [`crate::pipeline::PipelineError`]) that
//! convert into [`TreeVisError`] at the crate boundary.

use crate::module::ModuleError;
use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for TreeVis-RS operations
#[derive(Error, Debug)]
pub enum TreeVisError {
    /// Errors raised while building, verifying, loading or installing a module
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    /// Errors raised by the pipeline engine
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to Rhai script execution
    #[error("Script error: {0}")]
    Script(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to tree parsing or lookup
    #[error("Tree error: {0}")]
    Tree(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<Box<rhai::EvalAltResult>> for TreeVisError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        TreeVisError::Script(err.to_string())
    }
}

impl From<serde_json::Error> for TreeVisError {
    fn from(err: serde_json::Error) -> Self {
        TreeVisError::Serialization(err.to_string())
    }
}

/// Result type alias for TreeVis-RS operations
pub type Result<T> = std::result::Result<T, TreeVisError>;
