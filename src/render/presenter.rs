//! The logically-serial presentation context.
//!
//! All layer application and transform rewrites go through one dedicated
//! thread that owns the [`PresentationSurface`]. Callers hand it closures and
//! block until they have run.

use super::geometry::{Point, Rect, Transform};
use super::layer::RenderLayer;
use crate::error::{Result, TreeVisError};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Summary of one coordinator pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub pass: u64,
    /// Layers applied or removed in this pass, ascending
    pub layers_updated: Vec<usize>,
    pub global_bounds: Option<Rect>,
    pub origin: Point,
}

/// Where layers are finally drawn.
pub trait PresentationSurface: Send {
    /// Create or replace a layer's drawable.
    fn apply_layer(&mut self, layer: &RenderLayer);

    /// Reposition an existing layer without redrawing its content.
    fn set_transform(&mut self, index: usize, transform: Transform);

    fn remove_layer(&mut self, index: usize);

    fn pass_completed(&mut self, _summary: &PassSummary) {}
}

type Job = Box<dyn FnOnce(&mut dyn PresentationSurface) + Send>;

/// Serial executor owning a presentation surface.
pub struct PresentationThread {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl PresentationThread {
    pub fn spawn(mut surface: Box<dyn PresentationSurface>) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let handle = std::thread::Builder::new()
            .name("treevis-present".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job(surface.as_mut());
                }
                tracing::trace!("Presentation thread exiting");
            })?;
        Ok(Self {
            jobs: Some(tx),
            handle: Some(handle),
        })
    }

    /// Run `f` on the presentation thread and wait for its result.
    pub fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn PresentationSurface) -> R + Send + 'static,
    {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| TreeVisError::Channel("presentation thread stopped".to_string()))?;
        let (reply_tx, reply_rx) = bounded(1);
        jobs.send(Box::new(move |surface: &mut dyn PresentationSurface| {
            let _ = reply_tx.send(f(surface));
        }))
        .map_err(|_| TreeVisError::Channel("presentation thread stopped".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| TreeVisError::Channel("presentation job panicked".to_string()))
    }
}

impl Drop for PresentationThread {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// What a [`HeadlessSurface`] currently shows.
#[derive(Debug, Clone, Default)]
pub struct HeadlessState {
    pub layers: BTreeMap<usize, RenderLayer>,
    /// Times each layer's content was applied
    pub apply_counts: BTreeMap<usize, usize>,
    pub passes: Vec<PassSummary>,
}

/// Surface that keeps layers in memory; used by the binary and tests.
#[derive(Debug, Clone, Default)]
pub struct HeadlessSurface {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the surface state, readable from any thread.
    pub fn state(&self) -> Arc<Mutex<HeadlessState>> {
        self.state.clone()
    }
}

impl PresentationSurface for HeadlessSurface {
    fn apply_layer(&mut self, layer: &RenderLayer) {
        let mut state = self.state.lock();
        *state.apply_counts.entry(layer.index).or_default() += 1;
        state.layers.insert(layer.index, layer.clone());
    }

    fn set_transform(&mut self, index: usize, transform: Transform) {
        if let Some(layer) = self.state.lock().layers.get_mut(&index) {
            layer.transform = transform;
        }
    }

    fn remove_layer(&mut self, index: usize) {
        self.state.lock().layers.remove(&index);
    }

    fn pass_completed(&mut self, summary: &PassSummary) {
        tracing::trace!("Pass {} updated layers {:?}", summary.pass, summary.layers_updated);
        self.state.lock().passes.push(summary.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::layer::Primitives;

    #[test]
    fn test_invoke_runs_on_presentation_thread() {
        let surface = HeadlessSurface::new();
        let state = surface.state();
        let presenter = PresentationThread::spawn(Box::new(surface)).unwrap();

        let name = presenter
            .invoke(|s| {
                s.apply_layer(&RenderLayer::new(2, Arc::new(Primitives::new())));
                std::thread::current().name().map(str::to_string)
            })
            .unwrap();

        assert_eq!(name.as_deref(), Some("treevis-present"));
        assert_eq!(state.lock().apply_counts.get(&2), Some(&1));
    }

    #[test]
    fn test_set_transform_on_missing_layer_is_ignored() {
        let mut surface = HeadlessSurface::new();
        surface.set_transform(9, Transform::translation(1.0, 1.0));
        assert!(surface.state().lock().layers.is_empty());
    }
}
