//! Pipeline Execution Engine
//!
//! A pipeline is a fixed chain of module stages:
//!
//! ```text
//! [Load] ──► [Transform] ──► [Further 0] ─► … ─► [Further n-1] ──► [Coordinates] ──► [Plot 0]
//!                                                                                ├──► [Plot 1]
//!                                                                                └──► …
//! ```
//!
//! - **Incremental**: `run_from(stage)` recomputes only what depends on
//!   `stage`, reusing one cached tree snapshot per further transformation.
//! - **Isolated failures**: a failing further transformation or plot is
//!   recorded in the [`ErrorTable`] and skipped; the rest still renders.
//! - **Stable selection**: the selected node is found again in every new
//!   tree by id, then by the LCA of its leaf names.
//! - **Background runs**: [`WorkerPool`] workers execute runs; the host
//!   drains [`PipelineEvent`]s from a [`PipelineBridge`].

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod id;
pub mod selection;
pub mod worker;

pub use bridge::{ChannelObserver, NullObserver, PipelineBridge, PipelineEvent, PipelineObserver};
pub use config::{ParsedPipeline, PipelineConfig, StageConfig};
pub use engine::{ActionResult, InputFile, Pipeline, RunSummary};
pub use error::{ErrorTable, PipelineError, PipelineResult, StageFailure};
pub use id::StageIndex;
pub use selection::SelectionHandle;
pub use worker::WorkerPool;
