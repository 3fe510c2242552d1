//! Test data builders: hosts, pipelines and instrumented modules

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tempfile::TempDir;
use treevis_rs::{
    config::{AppConfig, ModuleRoots},
    module::{
        CodePermission, FurtherTransformationModule, LoadedModule, ModuleImpl, Progress, Registry, StageError,
        StageResult,
    },
    params::{ParameterMap, ParameterSpec},
    pipeline::{InputFile, Pipeline, PipelineBridge, PipelineConfig, StageConfig},
    render::{LayerContent, LayerSink, Primitive, Primitives},
    tree::Tree,
};
use uuid::Uuid;

pub const FAILING_ID: Uuid = Uuid::from_u128(0x7e57_0000_0000_0000_0000_0000_0000_0001);
pub const COUNTING_ID: Uuid = Uuid::from_u128(0x7e57_0000_0000_0000_0000_0000_0000_0002);
pub const STOPPING_ID: Uuid = Uuid::from_u128(0x7e57_0000_0000_0000_0000_0000_0000_0003);

/// Further transformation that always fails.
pub struct Failing;

impl FurtherTransformationModule for Failing {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        Vec::new()
    }

    fn execute(&self, tree: &mut Tree, _params: &ParameterMap, _progress: Progress<'_>) -> StageResult<()> {
        // Leave a mark so a leaked partial mutation would be visible
        let root = tree.root();
        tree.get_mut(root).expect("root").name = Some("corrupted".into());
        Err(StageError::new("always fails"))
    }
}

/// Further transformation that counts its executions and changes nothing.
#[derive(Default)]
pub struct Counting {
    pub calls: AtomicUsize,
}

impl Counting {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FurtherTransformationModule for Counting {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        Vec::new()
    }

    fn execute(&self, _tree: &mut Tree, _params: &ParameterMap, progress: Progress<'_>) -> StageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress(1.0);
        Ok(())
    }
}

/// Further transformation that asks its pipeline to stop.
#[derive(Default)]
pub struct Stopping {
    pub pipeline: OnceLock<Weak<Pipeline>>,
}

impl FurtherTransformationModule for Stopping {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        Vec::new()
    }

    fn execute(&self, _tree: &mut Tree, _params: &ParameterMap, _progress: Progress<'_>) -> StageResult<()> {
        if let Some(pipeline) = self.pipeline.get().and_then(Weak::upgrade) {
            pipeline.request_stop();
        }
        Ok(())
    }
}

/// Layer sink that records every submission.
#[derive(Default)]
pub struct RecordingSink {
    pub submitted: Mutex<Vec<(usize, Arc<dyn LayerContent>)>>,
    pub removed: Mutex<Vec<usize>>,
}

impl RecordingSink {
    pub fn count(&self, index: usize) -> usize {
        self.submitted.lock().iter().filter(|(i, _)| *i == index).count()
    }

    pub fn total(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn last(&self, index: usize) -> Option<Arc<dyn LayerContent>> {
        self.submitted
            .lock()
            .iter()
            .rev()
            .find(|(i, _)| *i == index)
            .map(|(_, c)| c.clone())
    }

    /// Text primitives of the latest content for `index`.
    pub fn texts(&self, index: usize) -> Vec<String> {
        let Some(content) = self.last(index) else {
            return Vec::new();
        };
        content
            .as_any()
            .downcast_ref::<Primitives>()
            .map(|p| {
                p.items
                    .iter()
                    .filter_map(|item| match item {
                        Primitive::Text { text, .. } => Some(text.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl LayerSink for RecordingSink {
    fn submit_layer(&self, index: usize, content: Arc<dyn LayerContent>, _recompute_global_bounds: bool) {
        self.submitted.lock().push((index, content));
    }

    fn remove_layer(&self, index: usize) {
        self.removed.lock().push(index);
    }
}

/// A registry rooted in a temporary directory, with the built-in modules and
/// the instrumented test modules registered.
pub struct TestHost {
    pub dir: TempDir,
    pub registry: Arc<Registry>,
    pub counting: Arc<Counting>,
    pub stopping: Arc<Stopping>,
}

impl TestHost {
    pub fn new(permission: Arc<dyn CodePermission>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let roots = ModuleRoots::with_executable_dir(dir.path().join("data"), dir.path().join("bin"));
        roots.ensure_dirs().expect("module dirs");
        let registry = Registry::open(roots, permission, &AppConfig::default())
            .expect("registry")
            .with_builtins();

        let counting = Arc::new(Counting::default());
        let stopping = Arc::new(Stopping::default());
        registry.register_builtin(LoadedModule::builtin(
            FAILING_ID,
            "Failing",
            ModuleImpl::FurtherTransformation(Arc::new(Failing)),
        ));
        registry.register_builtin(LoadedModule::builtin(
            COUNTING_ID,
            "Counting",
            ModuleImpl::FurtherTransformation(counting.clone()),
        ));
        registry.register_builtin(LoadedModule::builtin(
            STOPPING_ID,
            "Stopping",
            ModuleImpl::FurtherTransformation(stopping.clone()),
        ));

        Self {
            dir,
            registry: Arc::new(registry),
            counting,
            stopping,
        }
    }

    /// A pipeline over [`super::SAMPLE_NEWICK`] reporting to a recording sink.
    pub fn pipeline(&self, config: PipelineConfig) -> (Arc<Pipeline>, Arc<RecordingSink>, PipelineBridge) {
        let sink = Arc::new(RecordingSink::default());
        let (bridge, observer) = PipelineBridge::new();
        let pipeline = Arc::new(
            Pipeline::new(self.registry.clone())
                .with_sink(sink.clone())
                .with_observer(Arc::new(observer))
                .with_config(config),
        );
        pipeline.set_input(InputFile::new("sample.nwk", super::SAMPLE_NEWICK));
        let _ = self.stopping.pipeline.set(Arc::downgrade(&pipeline));
        (pipeline, sink, bridge)
    }
}

/// Builder for pipeline configurations on top of the built-in default.
pub struct ConfigBuilder {
    config: PipelineConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    pub fn further(mut self, module_id: Uuid, parameters: ParameterMap) -> Self {
        self.config
            .further
            .push(StageConfig::new(module_id).with_parameters(parameters));
        self
    }

    pub fn plot(mut self, module_id: Uuid, parameters: ParameterMap) -> Self {
        self.config
            .plots
            .push(StageConfig::new(module_id).with_parameters(parameters));
        self
    }

    pub fn plot_parameters(mut self, index: usize, parameters: ParameterMap) -> Self {
        self.config.plots[index].parameters = parameters;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .further(COUNTING_ID, ParameterMap::new())
            .further(FAILING_ID, ParameterMap::new())
            .build();
        assert_eq!(config.further.len(), 2);
        assert_eq!(config.plots.len(), 2);
    }
}
