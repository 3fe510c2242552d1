//! Pipeline execution engine.
//!
//! Runs the fixed stage chain
//!
//! ```text
//! Load → Transform → Further(0..n) → Coordinates → Plot(0..m)
//! ```
//!
//! and keeps one [`Tree`] snapshot per further transformation so a parameter
//! change at stage `k` recomputes only from `k` onwards.
//!
//! ## Concurrency
//!
//! One run at a time: [`Pipeline::run_from`] holds `run_guard` for the whole
//! run. Cached results live in `state` behind a single coarse lock which is
//! taken briefly between stages, so readers never wait for a whole run.
//!
//! ## Snapshots
//!
//! After a completed run, `snapshots.len() == further.len()` and
//! `snapshots[i]` is the tree after stage `i`. A failed stage keeps the tree
//! it received. A stopped run truncates the snapshots to the stages it
//! finished; the next run resumes from the first missing one.

use crate::module::{
    ActionOutcome, Coordinates, LoadedModule, ModuleError, ModuleKind, PlotContext, Provenance, Registry, StageError,
    StageResult,
};
use crate::params::{ControlStatus, ParameterChange, ParameterMap, ParameterSpec};
use crate::pipeline::bridge::{NullObserver, PipelineEvent, PipelineObserver};
use crate::pipeline::config::{PipelineConfig, StageConfig};
use crate::pipeline::error::{ErrorTable, PipelineError, PipelineResult};
use crate::pipeline::id::StageIndex;
use crate::pipeline::selection::SelectionHandle;
use crate::pipeline::worker::WorkerPool;
use crate::render::{ImageCache, LayerContent, LayerSink};
use crate::tree::{NodeIdx, Tree, TreeCollection};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Characters of the input passed to file type modules for sniffing.
const HEADER_CHARS: usize = 1024;

/// The file a pipeline reads trees from.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFile {
    pub name: String,
    pub text: Arc<str>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, text: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    fn header(&self) -> String {
        self.text.chars().take(HEADER_CHARS).collect()
    }
}

/// Outcome of one [`Pipeline::run_from`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub requested: StageIndex,
    /// Where the run actually started; earlier than `requested` when a
    /// needed upstream result was missing
    pub started_from: StageIndex,
    pub stages_run: usize,
    /// Stages that failed during this run
    pub failures: usize,
    /// Modules with a recorded error after this run
    pub warnings: usize,
    pub stopped: bool,
    /// A load or transform failure ended the run early
    pub aborted: bool,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

/// Result of running an action module.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub outcome: ActionOutcome,
    /// First appended further transformation, to be passed to `run_from`
    pub run_from: Option<StageIndex>,
}

#[derive(Default)]
struct RunStats {
    stages_run: usize,
    failures: usize,
    stopped: bool,
}

#[derive(Default)]
struct PipelineState {
    config: PipelineConfig,
    input: Option<InputFile>,
    opened: Option<Vec<Tree>>,
    loaded: Option<TreeCollection>,
    transformed: Option<Tree>,
    snapshots: Vec<Tree>,
    coordinates: Option<Arc<Coordinates>>,
    errors: ErrorTable,
    attributes: Vec<String>,
    selection: Option<SelectionHandle>,
    control_status: BTreeMap<StageIndex, BTreeMap<String, ControlStatus>>,
    layer_count: usize,
}

impl PipelineState {
    fn final_tree(&self) -> Option<&Tree> {
        match self.config.further.len() {
            0 => self.transformed.as_ref(),
            n if self.snapshots.len() == n => self.snapshots.last(),
            _ => None,
        }
    }

    /// Tree entering further transformation `i`.
    fn tree_before(&self, i: usize) -> Option<&Tree> {
        if i == 0 {
            self.transformed.as_ref()
        } else {
            self.snapshots.get(i - 1)
        }
    }

    /// Earliest stage at or before `requested` whose inputs are cached.
    fn resume_point(&self, requested: StageIndex) -> StageIndex {
        if requested == StageIndex::Load || self.loaded.is_none() {
            return StageIndex::Load;
        }
        if requested == StageIndex::Transform || self.transformed.is_none() {
            return StageIndex::Transform;
        }
        let complete = self.snapshots.len().min(self.config.further.len());
        match requested {
            StageIndex::Further(k) => StageIndex::Further(k.min(complete)),
            _ if complete < self.config.further.len() => StageIndex::Further(complete),
            StageIndex::Plot(_) if self.coordinates.is_none() => StageIndex::Coordinates,
            other => other,
        }
    }

    /// Drop every result derived from the transformed tree.
    fn invalidate_from_transform(&mut self) {
        self.transformed = None;
        self.snapshots.clear();
        self.coordinates = None;
    }

    /// Drop every cached result that `stage` contributes to.
    ///
    /// Plots own no cached tree, so editing one invalidates nothing.
    fn invalidate_from(&mut self, stage: StageIndex) {
        match stage {
            StageIndex::Load => {
                self.loaded = None;
                self.invalidate_from_transform();
            }
            StageIndex::Transform => self.invalidate_from_transform(),
            StageIndex::Further(i) => {
                self.snapshots.truncate(i);
                self.coordinates = None;
            }
            StageIndex::Coordinates => self.coordinates = None,
            StageIndex::Plot(_) => {}
        }
    }
}

/// Sink used until a renderer is attached.
struct DiscardLayers;

impl LayerSink for DiscardLayers {
    fn submit_layer(&self, index: usize, _content: Arc<dyn LayerContent>, _recompute_global_bounds: bool) {
        tracing::trace!("Discarding layer {}", index);
    }

    fn remove_layer(&self, _index: usize) {}
}

fn effective_parameters(specs: &[ParameterSpec], stored: &ParameterMap) -> ParameterMap {
    let mut params = stored.clone();
    params.fill_defaults(&ParameterSpec::defaults(specs));
    params
}

pub struct Pipeline {
    registry: Arc<Registry>,
    sink: Arc<dyn LayerSink>,
    observer: Arc<dyn PipelineObserver>,
    state: RwLock<PipelineState>,
    run_guard: Mutex<()>,
    stop_requested: AtomicBool,
    images: ImageCache,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sink: Arc::new(DiscardLayers),
            observer: Arc::new(NullObserver),
            state: RwLock::new(PipelineState::default()),
            run_guard: Mutex::new(()),
            stop_requested: AtomicBool::new(false),
            images: ImageCache::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LayerSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_config(self, config: PipelineConfig) -> Self {
        self.state.write().config = config;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // --- Configuration ---

    pub fn config(&self) -> PipelineConfig {
        self.state.read().config.clone()
    }

    /// Replace the whole stage chain. Everything after opening the input is
    /// recomputed on the next run.
    pub fn set_config(&self, config: PipelineConfig) {
        let mut state = self.state.write();
        state.config = config;
        state.loaded = None;
        state.invalidate_from_transform();
        state.control_status.clear();
    }

    /// Parse, authorize and install a serialized pipeline.
    pub fn load_config(&self, text: &str) -> PipelineResult<Option<Provenance>> {
        let (config, provenance) = PipelineConfig::from_json(text, self.registry.loader())?;
        tracing::info!(
            "Loaded pipeline with {} further transformation(s) and {} plot(s)",
            config.further.len(),
            config.plots.len()
        );
        self.set_config(config);
        Ok(provenance)
    }

    pub fn set_input(&self, input: InputFile) {
        tracing::info!("Input set to {} ({} bytes)", input.name, input.text.len());
        let mut state = self.state.write();
        state.input = Some(input);
        state.opened = None;
        state.loaded = None;
        state.invalidate_from_transform();
    }

    /// Insert a further transformation at `index`. Returns the stage to run from.
    pub fn insert_further(&self, index: usize, stage: StageConfig) -> PipelineResult<StageIndex> {
        let mut state = self.state.write();
        if index > state.config.further.len() {
            return Err(PipelineError::NoSuchStage(StageIndex::Further(index)));
        }
        state.config.further.insert(index, stage);
        state.invalidate_from(StageIndex::Further(index));
        Ok(StageIndex::Further(index))
    }

    /// Append a further transformation with default parameters.
    pub fn push_further(&self, module_id: Uuid) -> PipelineResult<StageIndex> {
        self.registry.require(module_id, ModuleKind::FurtherTransformation)?;
        let index = self.state.read().config.further.len();
        self.insert_further(index, StageConfig::new(module_id))
    }

    pub fn remove_further(&self, index: usize) -> PipelineResult<StageIndex> {
        let mut state = self.state.write();
        if index >= state.config.further.len() {
            return Err(PipelineError::NoSuchStage(StageIndex::Further(index)));
        }
        state.config.further.remove(index);
        state.invalidate_from(StageIndex::Further(index));
        state.control_status.retain(|stage, _| !matches!(stage, StageIndex::Further(i) if *i >= index));
        Ok(StageIndex::Further(index))
    }

    pub fn push_plot(&self, stage: StageConfig) -> StageIndex {
        let mut state = self.state.write();
        state.config.plots.push(stage);
        StageIndex::Plot(state.config.plots.len() - 1)
    }

    /// Remove plot `index`. Later plots shift down, so every layer is redrawn.
    pub fn remove_plot(&self, index: usize) -> PipelineResult<StageIndex> {
        let mut state = self.state.write();
        if index >= state.config.plots.len() {
            return Err(PipelineError::NoSuchStage(StageIndex::Plot(index)));
        }
        state.config.plots.remove(index);
        state.control_status.retain(|stage, _| !matches!(stage, StageIndex::Plot(j) if *j >= index));
        Ok(StageIndex::Coordinates)
    }

    pub fn add_attachment(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.state.write().config.attachments.insert(name.into(), bytes.into());
    }

    pub fn remove_attachment(&self, name: &str) -> bool {
        self.state.write().config.attachments.remove(name).is_some()
    }

    /// Apply a parameter edit from the host.
    ///
    /// The stage's module may veto the edit, rewrite other parameters and set
    /// control status. Results cached at or after the stage are dropped but
    /// nothing is recomputed; pass the stage to [`run_from`](Self::run_from)
    /// afterwards.
    pub fn update_parameters(&self, index: StageIndex, parameters: ParameterMap) -> PipelineResult<ParameterChange> {
        let (module_id, previous) = {
            let state = self.state.read();
            let stage = state.config.stage(index).ok_or(PipelineError::NoSuchStage(index))?;
            (stage.module_id, stage.parameters.clone())
        };

        let change = self
            .parameter_change(index, module_id, &previous, &parameters)
            .map_err(|e| PipelineError::Stage {
                stage: index,
                module_id,
                message: e.message,
            })?;
        if !change.valid {
            tracing::debug!("Stage {} rejected parameter change", index);
            return Err(PipelineError::ParametersRejected(index));
        }

        let mut updated = parameters;
        updated.apply(&change.parameters_to_change);
        updated.authorize_formatters(self.registry.engine(), true);
        {
            let mut state = self.state.write();
            if let Some(stage) = state.config.stage_mut(index) {
                stage.parameters = updated;
            }
            state.invalidate_from(index);
            state.control_status.insert(index, change.control_status.clone());
        }
        self.observer.notify(PipelineEvent::ControlStatus {
            stage: index,
            status: change.control_status.clone(),
        });
        Ok(change)
    }

    fn parameter_change(
        &self,
        index: StageIndex,
        module_id: Uuid,
        previous: &ParameterMap,
        current: &ParameterMap,
    ) -> StageResult<ParameterChange> {
        let state = self.state.read();
        let accept = || Ok(ParameterChange::accept());
        match index {
            StageIndex::Load => self
                .resolve(index, module_id, LoadedModule::as_load_file)
                .map(|m| m.on_parameter_change(previous, current)),
            StageIndex::Transform => match &state.loaded {
                Some(trees) => self
                    .resolve(index, module_id, LoadedModule::as_transformer)
                    .map(|m| m.on_parameter_change(trees, previous, current)),
                None => accept(),
            },
            StageIndex::Further(i) => match state.tree_before(i) {
                Some(tree) => self
                    .resolve(index, module_id, LoadedModule::as_further_transformation)
                    .map(|m| m.on_parameter_change(tree, previous, current)),
                None => accept(),
            },
            StageIndex::Coordinates => match state.final_tree() {
                Some(tree) => self
                    .resolve(index, module_id, LoadedModule::as_coordinates)
                    .map(|m| m.on_parameter_change(tree, previous, current)),
                None => accept(),
            },
            StageIndex::Plot(_) => match state.final_tree() {
                Some(tree) => self
                    .resolve(index, module_id, LoadedModule::as_plot_action)
                    .map(|m| m.on_parameter_change(tree, previous, current)),
                None => accept(),
            },
        }
    }

    /// Parameter specs of a stage for its current input, or `None` if the
    /// input has not been computed yet.
    pub fn parameter_specs(&self, index: StageIndex) -> PipelineResult<Option<Vec<ParameterSpec>>> {
        let state = self.state.read();
        let stage = state.config.stage(index).ok_or(PipelineError::NoSuchStage(index))?;
        let id = stage.module_id;
        let to_pipeline = |e: StageError| PipelineError::Stage {
            stage: index,
            module_id: id,
            message: e.message,
        };
        let specs = match index {
            StageIndex::Load => match &state.input {
                Some(input) => Some(
                    self.resolve(index, id, LoadedModule::as_load_file)
                        .map_err(to_pipeline)?
                        .get_parameters(&input.name),
                ),
                None => None,
            },
            StageIndex::Transform => match &state.loaded {
                Some(trees) => Some(
                    self.resolve(index, id, LoadedModule::as_transformer)
                        .map_err(to_pipeline)?
                        .get_parameters(trees),
                ),
                None => None,
            },
            StageIndex::Further(i) => match state.tree_before(i) {
                Some(tree) => Some(
                    self.resolve(index, id, LoadedModule::as_further_transformation)
                        .map_err(to_pipeline)?
                        .get_parameters(tree),
                ),
                None => None,
            },
            StageIndex::Coordinates => match state.final_tree() {
                Some(tree) => Some(
                    self.resolve(index, id, LoadedModule::as_coordinates)
                        .map_err(to_pipeline)?
                        .get_parameters(tree),
                ),
                None => None,
            },
            StageIndex::Plot(_) => match state.final_tree() {
                Some(tree) => Some(
                    self.resolve(index, id, LoadedModule::as_plot_action)
                        .map_err(to_pipeline)?
                        .get_parameters(tree),
                ),
                None => None,
            },
        };
        Ok(specs)
    }

    // --- Results ---

    pub fn loaded_trees(&self) -> Option<TreeCollection> {
        self.state.read().loaded.clone()
    }

    pub fn transformed_tree(&self) -> Option<Tree> {
        self.state.read().transformed.clone()
    }

    pub fn snapshots(&self) -> Vec<Tree> {
        self.state.read().snapshots.clone()
    }

    pub fn snapshot(&self, index: usize) -> Option<Tree> {
        self.state.read().snapshots.get(index).cloned()
    }

    /// The tree the coordinates and plots are computed from.
    pub fn final_tree(&self) -> Option<Tree> {
        self.state.read().final_tree().cloned()
    }

    pub fn coordinates(&self) -> Option<Arc<Coordinates>> {
        self.state.read().coordinates.clone()
    }

    pub fn errors(&self) -> ErrorTable {
        self.state.read().errors.clone()
    }

    pub fn warning_count(&self) -> usize {
        self.state.read().errors.len()
    }

    pub fn attributes(&self) -> Vec<String> {
        self.state.read().attributes.clone()
    }

    pub fn control_status(&self, index: StageIndex) -> BTreeMap<String, ControlStatus> {
        self.state.read().control_status.get(&index).cloned().unwrap_or_default()
    }

    /// Whether every further transformation has a current snapshot.
    pub fn is_consistent(&self) -> bool {
        let state = self.state.read();
        state.snapshots.len() == state.config.further.len()
    }

    // --- Selection ---

    /// Select `node` of the final tree.
    pub fn select(&self, node: NodeIdx) -> Option<SelectionHandle> {
        let mut state = self.state.write();
        let handle = state.final_tree().and_then(|tree| SelectionHandle::from_node(tree, node));
        state.selection = handle.clone();
        handle
    }

    pub fn clear_selection(&self) {
        self.state.write().selection = None;
    }

    pub fn selection(&self) -> Option<SelectionHandle> {
        self.state.read().selection.clone()
    }

    /// The selected node in the final tree.
    pub fn selected_node(&self) -> Option<NodeIdx> {
        let state = self.state.read();
        let tree = state.final_tree()?;
        state.selection.as_ref()?.resolve(tree)
    }

    // --- Actions ---

    /// Run a selection action on the selected node.
    pub fn perform_selection_action(&self, module_id: Uuid) -> PipelineResult<ActionResult> {
        let module = self.registry.require(module_id, ModuleKind::SelectionAction)?;
        let Some(action) = module.as_selection_action() else {
            return Err(PipelineError::ActionUnavailable(module.name.clone()));
        };
        let (tree, node) = {
            let state = self.state.read();
            let tree = state.final_tree().cloned().ok_or(PipelineError::NoSelection)?;
            let node = state
                .selection
                .as_ref()
                .and_then(|h| h.resolve(&tree))
                .ok_or(PipelineError::NoSelection)?;
            (tree, node)
        };
        if !action.is_available(&tree, node) {
            return Err(PipelineError::ActionUnavailable(module.name.clone()));
        }
        let outcome = action
            .perform(&tree, node)
            .map_err(|e| PipelineError::Action {
                module_id,
                message: e.message,
            })?;
        self.apply_outcome(outcome)
    }

    /// Run an action or menu action against the final tree.
    pub fn perform_action(&self, module_id: Uuid) -> PipelineResult<ActionResult> {
        let module = self.registry.get(module_id).ok_or(ModuleError::NotLoaded(module_id))?;
        let tree = self.final_tree();
        let result = match (module.as_action(), module.as_menu_action()) {
            (Some(action), _) => action
                .is_enabled(tree.as_ref())
                .then(|| action.perform(tree.as_ref())),
            (_, Some(action)) => action
                .is_enabled(tree.as_ref())
                .then(|| action.perform(tree.as_ref())),
            _ => {
                return Err(ModuleError::WrongKind {
                    id: module_id,
                    expected: ModuleKind::Action,
                    actual: module.kind(),
                }
                .into())
            }
        };
        let outcome = result
            .ok_or_else(|| PipelineError::ActionUnavailable(module.name.clone()))?
            .map_err(|e| PipelineError::Action {
                module_id,
                message: e.message,
            })?;
        self.apply_outcome(outcome)
    }

    fn apply_outcome(&self, outcome: ActionOutcome) -> PipelineResult<ActionResult> {
        let mut run_from = None;
        for id in &outcome.further_transformations {
            let index = self.push_further(*id)?;
            run_from.get_or_insert(index);
        }
        if let Some(message) = &outcome.message {
            tracing::info!("Action message: {}", message);
        }
        Ok(ActionResult { outcome, run_from })
    }

    // --- Execution ---

    /// Ask the current run to stop between stages.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Hand a run to a background worker and return immediately.
    pub fn run_in_background(self: &Arc<Self>, pool: &WorkerPool, index: StageIndex) -> PipelineResult<()> {
        let pipeline = Arc::clone(self);
        pool.submit(move || {
            if let Err(e) = pipeline.run_from(index) {
                tracing::error!("Run from {} failed: {}", index, e);
            }
        })
    }

    /// Recompute from `requested` to the end of the chain.
    ///
    /// `Plot(j)` only redraws layer `j`. Blocks while another run is active.
    pub fn run_from(&self, requested: StageIndex) -> PipelineResult<RunSummary> {
        let _guard = self.run_guard.lock();
        self.stop_requested.store(false, Ordering::SeqCst);
        let started = Instant::now();

        let (config, start) = {
            let state = self.state.read();
            match requested {
                StageIndex::Further(k) if k > state.config.further.len() => {
                    return Err(PipelineError::NoSuchStage(requested))
                }
                StageIndex::Plot(j) if j >= state.config.plots.len() => {
                    return Err(PipelineError::NoSuchStage(requested))
                }
                _ => {}
            }
            (state.config.clone(), state.resume_point(requested))
        };
        if start != requested {
            tracing::debug!("Run from {} resumes at {}", requested, start);
        }

        let mut stats = RunStats::default();
        let result = self.execute(&config, start, &mut stats);

        let summary = RunSummary {
            requested,
            started_from: start,
            stages_run: stats.stages_run,
            failures: stats.failures,
            warnings: self.warning_count(),
            stopped: stats.stopped,
            aborted: result.is_err(),
            elapsed: started.elapsed(),
            finished_at: Utc::now(),
        };
        tracing::info!(
            "Run from {} finished in {:?}: {} stage(s), {} failure(s), {} warning(s){}",
            start,
            summary.elapsed,
            summary.stages_run,
            summary.failures,
            summary.warnings,
            if summary.stopped { ", stopped" } else { "" }
        );
        self.observer.notify(PipelineEvent::RunCompleted(summary.clone()));
        result.map(|()| summary)
    }

    fn execute(&self, config: &PipelineConfig, start: StageIndex, stats: &mut RunStats) -> PipelineResult<()> {
        if let StageIndex::Plot(j) = start {
            let (tree, coordinates) = {
                let state = self.state.read();
                (state.final_tree().cloned(), state.coordinates.clone())
            };
            if let (Some(tree), Some(coordinates)) = (tree, coordinates) {
                self.run_plot(config, j, &tree, &coordinates, stats);
            }
            return Ok(());
        }

        if start == StageIndex::Load {
            self.run_load(config, stats)?;
        }
        if start <= StageIndex::Transform {
            self.run_transform(config, stats)?;
        }
        if self.should_stop(stats) {
            return Ok(());
        }

        if start != StageIndex::Coordinates {
            let k = match start {
                StageIndex::Further(k) => k,
                _ => 0,
            };
            self.run_further(config, k, stats)?;
            if self.should_stop(stats) {
                return Ok(());
            }
            self.refresh_tree_views();
        }

        let Some(tree) = self.final_tree() else {
            return Ok(());
        };
        let Some(coordinates) = self.run_coordinates(config, &tree, stats) else {
            tracing::warn!("No coordinates; keeping previous layers");
            return Ok(());
        };

        for j in 0..config.plots.len() {
            if self.should_stop(stats) {
                return Ok(());
            }
            self.run_plot(config, j, &tree, &coordinates, stats);
        }

        let stale = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.layer_count, config.plots.len())
        };
        for index in config.plots.len()..stale {
            self.sink.remove_layer(index);
        }
        Ok(())
    }

    fn should_stop(&self, stats: &mut RunStats) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            if !stats.stopped {
                tracing::info!("Run stopped on request");
            }
            stats.stopped = true;
        }
        stats.stopped
    }

    fn resolve<T: ?Sized>(
        &self,
        stage: StageIndex,
        module_id: Uuid,
        pick: impl Fn(&LoadedModule) -> Option<&Arc<T>>,
    ) -> StageResult<Arc<T>> {
        let module = self
            .registry
            .require(module_id, stage.module_kind())
            .map_err(|e| StageError::new(e.to_string()))?;
        pick(&module)
            .cloned()
            .ok_or_else(|| StageError::new(format!("module {} is not a {}", module_id, stage.module_kind())))
    }

    fn progress(&self, stage: StageIndex) -> impl Fn(f64) + '_ {
        move |fraction| {
            self.observer.notify(PipelineEvent::Progress {
                stage,
                fraction: fraction.clamp(0.0, 1.0),
            })
        }
    }

    fn succeed(&self, stage: StageIndex, module_id: Uuid) {
        self.state.write().errors.clear(module_id);
        self.observer.notify(PipelineEvent::StageSucceeded { stage, module_id });
    }

    fn fail(&self, stage: StageIndex, module_id: Uuid, error: StageError, stats: &mut RunStats) -> PipelineError {
        stats.failures += 1;
        self.state.write().errors.record(module_id, stage, error.message.clone());
        self.observer.notify(PipelineEvent::StageFailed {
            stage,
            module_id,
            message: error.message.clone(),
        });
        PipelineError::Stage {
            stage,
            module_id,
            message: error.message,
        }
    }

    fn run_load(&self, config: &PipelineConfig, stats: &mut RunStats) -> PipelineResult<()> {
        let (input, cached) = {
            let state = self.state.read();
            (state.input.clone(), state.opened.clone())
        };
        let input = input.ok_or(PipelineError::NoInput)?;

        let trees = match cached {
            Some(trees) => trees,
            None => {
                let module = self
                    .registry
                    .file_type_for(&input.name, &input.header())
                    .ok_or_else(|| PipelineError::UnsupportedFile(input.name.clone()))?;
                stats.stages_run += 1;
                let progress = self.progress(StageIndex::Load);
                let opened = module
                    .as_file_type()
                    .ok_or_else(|| StageError::new(format!("{} is not a file type module", module.name)))
                    .and_then(|ft| ft.open(&input.name, &input.text, &progress));
                let trees = match opened {
                    Ok(trees) => trees,
                    Err(e) => return Err(self.fail(StageIndex::Load, module.id, e, stats)),
                };
                tracing::info!("{} opened {} with {} tree(s)", module.name, input.name, trees.len());
                self.succeed(StageIndex::Load, module.id);
                self.state.write().opened = Some(trees.clone());
                trees
            }
        };

        let stage = &config.load;
        stats.stages_run += 1;
        let progress = self.progress(StageIndex::Load);
        let loaded = self
            .resolve(StageIndex::Load, stage.module_id, LoadedModule::as_load_file)
            .and_then(|m| {
                let params = effective_parameters(&m.get_parameters(&input.name), &stage.parameters);
                m.load(trees, &params, &progress)
            });
        match loaded {
            Ok(collection) => {
                tracing::debug!("Loaded {} tree(s)", collection.len());
                {
                    let mut state = self.state.write();
                    state.loaded = Some(collection);
                    state.invalidate_from_transform();
                }
                self.succeed(StageIndex::Load, stage.module_id);
                Ok(())
            }
            Err(e) => Err(self.fail(StageIndex::Load, stage.module_id, e, stats)),
        }
    }

    fn run_transform(&self, config: &PipelineConfig, stats: &mut RunStats) -> PipelineResult<()> {
        let trees = self.state.read().loaded.clone().ok_or(PipelineError::NoInput)?;
        let stage = &config.transform;
        stats.stages_run += 1;
        let progress = self.progress(StageIndex::Transform);
        let transformed = self
            .resolve(StageIndex::Transform, stage.module_id, LoadedModule::as_transformer)
            .and_then(|m| {
                let params = effective_parameters(&m.get_parameters(&trees), &stage.parameters);
                m.transform(&trees, &params, &progress)
            });
        match transformed {
            Ok(tree) => {
                {
                    let mut state = self.state.write();
                    state.invalidate_from_transform();
                    state.transformed = Some(tree);
                }
                self.succeed(StageIndex::Transform, stage.module_id);
                Ok(())
            }
            Err(e) => Err(self.fail(StageIndex::Transform, stage.module_id, e, stats)),
        }
    }

    /// Run further transformations `k..`. Each executes on a clone of its
    /// input; a failure records the error and passes the input through.
    fn run_further(&self, config: &PipelineConfig, k: usize, stats: &mut RunStats) -> PipelineResult<()> {
        let base = {
            let mut state = self.state.write();
            state.snapshots.truncate(k);
            state.tree_before(k).cloned()
        };
        let mut working = base.ok_or(PipelineError::NoSuchStage(StageIndex::Further(k)))?;

        for (i, stage) in config.further.iter().enumerate().skip(k) {
            if self.should_stop(stats) {
                break;
            }
            let index = StageIndex::Further(i);
            stats.stages_run += 1;
            let progress = self.progress(index);
            let executed = self
                .resolve(index, stage.module_id, LoadedModule::as_further_transformation)
                .and_then(|m| {
                    let params = effective_parameters(&m.get_parameters(&working), &stage.parameters);
                    let mut candidate = working.clone();
                    m.execute(&mut candidate, &params, &progress).map(|()| candidate)
                });
            match executed {
                Ok(tree) => {
                    working = tree;
                    self.succeed(index, stage.module_id);
                }
                Err(e) => {
                    self.fail(index, stage.module_id, e, stats);
                }
            }
            self.state.write().snapshots.push(working.clone());
        }
        Ok(())
    }

    /// Rebuild the attribute index and recover the selection in the new
    /// final tree.
    fn refresh_tree_views(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            let Some(tree) = state.final_tree() else {
                return;
            };
            let attributes = tree.attribute_names();
            let recovered = state
                .selection
                .as_ref()
                .map(|handle| handle.resolve(tree).and_then(|idx| SelectionHandle::from_node(tree, idx)));

            if attributes != state.attributes {
                events.push(PipelineEvent::AttributesChanged(attributes.clone()));
                state.attributes = attributes;
            }
            if let Some(recovered) = recovered {
                if recovered.is_none() {
                    tracing::debug!("Selection could not be recovered; cleared");
                }
                events.push(PipelineEvent::SelectionChanged(recovered.clone()));
                state.selection = recovered;
            }
        }
        for event in events {
            self.observer.notify(event);
        }
    }

    fn run_coordinates(&self, config: &PipelineConfig, tree: &Tree, stats: &mut RunStats) -> Option<Arc<Coordinates>> {
        let stage = &config.coordinates;
        let index = StageIndex::Coordinates;
        stats.stages_run += 1;
        let progress = self.progress(index);
        let computed = self
            .resolve(index, stage.module_id, LoadedModule::as_coordinates)
            .and_then(|m| {
                let params = effective_parameters(&m.get_parameters(tree), &stage.parameters);
                m.compute(tree, &params, &progress)
            });
        let coordinates = match computed {
            Ok(coordinates) => {
                self.succeed(index, stage.module_id);
                Some(Arc::new(coordinates))
            }
            Err(e) => {
                self.fail(index, stage.module_id, e, stats);
                None
            }
        };
        self.state.write().coordinates = coordinates.clone();
        coordinates
    }

    fn run_plot(
        &self,
        config: &PipelineConfig,
        j: usize,
        tree: &Tree,
        coordinates: &Coordinates,
        stats: &mut RunStats,
    ) {
        let Some(stage) = config.plots.get(j) else {
            return;
        };
        let index = StageIndex::Plot(j);
        stats.stages_run += 1;
        let context = PlotContext {
            tree,
            coordinates,
            attachments: &config.attachments,
            images: &self.images,
            engine: self.registry.engine(),
        };
        let progress = self.progress(index);
        let plotted = self
            .resolve(index, stage.module_id, LoadedModule::as_plot_action)
            .and_then(|m| {
                let params = effective_parameters(&m.get_parameters(tree), &stage.parameters);
                m.plot(&context, &params, &progress)
            });
        match plotted {
            Ok(layer) => {
                self.sink.submit_layer(j, layer, true);
                self.succeed(index, stage.module_id);
            }
            Err(e) => {
                self.fail(index, stage.module_id, e, stats);
            }
        }
    }
}
