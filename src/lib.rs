//! # TreeVis-RS: modular phylogenetic tree pipeline
//!
//! Trees are read, transformed and drawn by a chain of modules. Modules are
//! either native code shipped with the host ([`builtin`]) or Rhai scripts that
//! must pass signature verification before they are compiled.
//!
//! ## Architecture
//!
//! - **Module loader** ([`module`]): resolves references, verifies RSA
//!   signatures against first-party keys and the user's trusted key ring,
//!   asks for permission otherwise, then compiles and binds entry points
//! - **Pipeline engine** ([`pipeline`]): runs Load → Transform → further
//!   transformations → Coordinates → Plots incrementally on background workers
//! - **Render coordinator** ([`render`]): coalesces layer updates from plot
//!   stages and presents them in one shared coordinate space, at most every
//!   33 ms
//! - **Communication**: crossbeam channels between workers and the host
//!
//! ## Configuration
//!
//! Host configuration and installed modules live in the platform data
//! directory under `dev.treevis.treevis-rs` (see [`config`]).
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use treevis_rs::{
//!     config::{AppConfig, ModuleRoots},
//!     module::{DenyAll, Registry},
//!     pipeline::{InputFile, Pipeline, StageIndex},
//! };
//!
//! let config = AppConfig::load_or_default();
//! let roots = ModuleRoots::from_config(&config)?;
//! let registry = Registry::open(roots, Arc::new(DenyAll), &config)?.with_builtins();
//!
//! let pipeline = Pipeline::new(Arc::new(registry));
//! pipeline.set_input(InputFile::new("primates.nwk", "((A,B),C);"));
//! let summary = pipeline.run_from(StageIndex::Load)?;
//! println!("{} stage(s), {} warning(s)", summary.stages_run, summary.warnings);
//! ```

pub mod builtin;
pub mod config;
pub mod error;
pub mod module;
pub mod params;
pub mod pipeline;
pub mod render;
pub mod scripting;
pub mod tree;

// Re-export commonly used types
pub use config::{AppConfig, GlobalSettings, ModuleRoots};
pub use error::{Result, TreeVisError};
pub use module::{LoadedModule, ModuleDescriptor, ModuleKind, ModuleLoader, Registry};
pub use pipeline::{InputFile, Pipeline, PipelineConfig, StageIndex};
pub use render::RenderCoordinator;
pub use scripting::ScriptEngine;
pub use tree::{Tree, TreeCollection};
