//! Render update coordinator.
//!
//! A single worker drains the [`UpdateQueue`], which holds one request per layer,
//! applies the surviving updates on the presentation thread and keeps every
//! layer aligned to one shared origin: the minimum corner of the global
//! bounding box. After each batch it reports a [`PassSummary`] and sleeps for
//! the configured minimum interval.

use super::geometry::{Point, Rect, Transform};
use super::layer::{LayerContent, RenderLayer};
use super::presenter::{PassSummary, PresentationSurface, PresentationThread};
use super::queue::{LayerUpdate, UpdateQueue, UpdateRequest};
use crate::error::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Capacity of the render event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events emitted by the coordinator worker.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    PassCompleted(PassSummary),
}

/// Destination for layers produced by plot stages.
pub trait LayerSink: Send + Sync {
    fn submit_layer(&self, index: usize, content: Arc<dyn LayerContent>, recompute_global_bounds: bool);

    fn remove_layer(&self, index: usize);
}

#[derive(Debug, Default)]
struct CoordinatorState {
    layers: BTreeMap<usize, RenderLayer>,
    global_bounds: Option<Rect>,
    origin: Point,
    pass: u64,
}

impl CoordinatorState {
    fn recompute_bounds(&mut self) {
        self.global_bounds = self
            .layers
            .values()
            .filter_map(|l| l.bounds)
            .reduce(Rect::union);
    }

    fn fold_bounds(&mut self, bounds: Option<Rect>) {
        if let Some(b) = bounds {
            self.global_bounds = Some(match self.global_bounds {
                Some(g) => g.union(b),
                None => b,
            });
        }
    }

    /// Move the origin to the global minimum corner, returning the transforms
    /// rewritten on layers other than `except`.
    fn realign(&mut self, except: usize) -> Vec<(usize, Transform)> {
        let new_origin = self.global_bounds.map(|b| b.min).unwrap_or(Point::ORIGIN);
        if new_origin == self.origin {
            return Vec::new();
        }
        let delta = self.origin - new_origin;
        self.origin = new_origin;
        tracing::trace!("Origin moved to ({}, {})", new_origin.x, new_origin.y);

        self.layers
            .iter_mut()
            .filter(|(index, _)| **index != except)
            .map(|(index, layer)| {
                layer.transform = layer.transform.then_translate(delta.x, delta.y);
                (*index, layer.transform)
            })
            .collect()
    }
}

/// Handle to the coordinator worker.
pub struct RenderCoordinator {
    queue: Arc<UpdateQueue>,
    state: Arc<Mutex<CoordinatorState>>,
    events: Receiver<RenderEvent>,
    worker: Option<JoinHandle<()>>,
}

impl RenderCoordinator {
    /// Spawn the presentation thread and the coordinator worker.
    pub fn start(surface: Box<dyn PresentationSurface>, min_pass_interval: Duration) -> Result<Self> {
        let presenter = PresentationThread::spawn(surface)?;
        let queue = Arc::new(UpdateQueue::new());
        let state = Arc::new(Mutex::new(CoordinatorState::default()));
        let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);

        let worker = {
            let queue = queue.clone();
            let state = state.clone();
            std::thread::Builder::new()
                .name("treevis-render".to_string())
                .spawn(move || run_worker(queue, state, presenter, event_tx, min_pass_interval))?
        };

        tracing::info!("Render coordinator started ({:?} minimum pass interval)", min_pass_interval);
        Ok(Self {
            queue,
            state,
            events: event_rx,
            worker: Some(worker),
        })
    }

    /// Queue new content for a layer.
    pub fn submit(&self, layer_index: usize, content: Arc<dyn LayerContent>, recompute_global_bounds: bool) -> bool {
        self.queue.push(UpdateRequest {
            layer_index,
            recompute_global_bounds,
            update: LayerUpdate::Content(content),
        })
    }

    /// Queue removal of a layer; global bounds are recomputed.
    pub fn remove(&self, layer_index: usize) -> bool {
        self.queue.push(UpdateRequest {
            layer_index,
            recompute_global_bounds: true,
            update: LayerUpdate::Remove,
        })
    }

    pub fn events(&self) -> Receiver<RenderEvent> {
        self.events.clone()
    }

    pub fn global_bounds(&self) -> Option<Rect> {
        self.state.lock().global_bounds
    }

    pub fn origin(&self) -> Point {
        self.state.lock().origin
    }

    pub fn layer_count(&self) -> usize {
        self.state.lock().layers.len()
    }

    pub fn layer_transform(&self, index: usize) -> Option<Transform> {
        self.state.lock().layers.get(&index).map(|l| l.transform)
    }

    pub fn passes(&self) -> u64 {
        self.state.lock().pass
    }

    /// Stop accepting updates, finish the pending batch and join the worker.
    pub fn shutdown(&mut self) {
        self.queue.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Render worker panicked");
            }
            tracing::info!("Render coordinator stopped");
        }
    }
}

impl Drop for RenderCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LayerSink for RenderCoordinator {
    fn submit_layer(&self, index: usize, content: Arc<dyn LayerContent>, recompute_global_bounds: bool) {
        if !self.submit(index, content, recompute_global_bounds) {
            tracing::warn!("Dropped update for layer {}: coordinator stopped", index);
        }
    }

    fn remove_layer(&self, index: usize) {
        self.remove(index);
    }
}

fn run_worker(
    queue: Arc<UpdateQueue>,
    state: Arc<Mutex<CoordinatorState>>,
    presenter: PresentationThread,
    events: Sender<RenderEvent>,
    min_pass_interval: Duration,
) {
    while let Some(requests) = queue.wait_batch() {
        if requests.is_empty() {
            continue;
        }
        tracing::trace!("Render pass with {} coalesced updates", requests.len());

        match process_batch(&requests, &state, &presenter) {
            Ok(summary) => {
                if events.try_send(RenderEvent::PassCompleted(summary)).is_err() {
                    tracing::trace!("Render event dropped: no listener keeping up");
                }
            }
            Err(e) => {
                tracing::error!("Render pass failed, stopping coordinator: {}", e);
                queue.close();
                break;
            }
        }

        std::thread::sleep(min_pass_interval);
    }
}

fn process_batch(
    requests: &[UpdateRequest],
    state: &Mutex<CoordinatorState>,
    presenter: &PresentationThread,
) -> Result<PassSummary> {
    let mut updated = Vec::with_capacity(requests.len());

    for request in requests {
        let index = request.layer_index;
        let (applied, rewrites) = {
            let mut st = state.lock();
            let applied = match &request.update {
                LayerUpdate::Content(content) => {
                    let layer = RenderLayer::new(index, content.clone());
                    let bounds = layer.bounds;
                    st.layers.insert(index, layer);
                    if request.recompute_global_bounds {
                        st.recompute_bounds();
                    } else {
                        st.fold_bounds(bounds);
                    }
                    true
                }
                LayerUpdate::Remove => {
                    st.layers.remove(&index);
                    st.recompute_bounds();
                    false
                }
            };
            let rewrites = st.realign(index);
            let origin = st.origin;
            let applied = if applied {
                st.layers.get_mut(&index).map(|layer| {
                    layer.transform = Transform::translation(-origin.x, -origin.y);
                    layer.clone()
                })
            } else {
                None
            };
            (applied, rewrites)
        };

        presenter.invoke(move |surface| {
            match &applied {
                Some(layer) => surface.apply_layer(layer),
                None => surface.remove_layer(index),
            }
            for (other, transform) in rewrites {
                surface.set_transform(other, transform);
            }
        })?;
        updated.push(index);
    }

    let summary = {
        let mut st = state.lock();
        st.pass += 1;
        PassSummary {
            pass: st.pass,
            layers_updated: updated,
            global_bounds: st.global_bounds,
            origin: st.origin,
        }
    };
    let reported = summary.clone();
    presenter.invoke(move |surface| surface.pass_completed(&reported))?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::layer::{Primitive, Primitives};
    use crate::render::presenter::HeadlessSurface;
    use crate::params::Colour;
    use serial_test::serial;

    fn dot(x: f64, y: f64) -> Arc<dyn LayerContent> {
        Arc::new(Primitives {
            items: vec![Primitive::Circle {
                centre: Point::new(x, y),
                radius: 0.0,
                colour: Colour::BLACK,
            }],
        })
    }

    fn next_pass(events: &Receiver<RenderEvent>) -> PassSummary {
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            RenderEvent::PassCompleted(summary) => summary,
        }
    }

    #[test]
    fn test_state_realign_rewrites_other_layers() {
        let mut st = CoordinatorState::default();
        st.layers.insert(0, RenderLayer::new(0, dot(0.0, 0.0)));
        st.fold_bounds(Some(Rect::new(Point::ORIGIN, Point::ORIGIN)));
        assert!(st.realign(0).is_empty());

        st.layers.insert(1, RenderLayer::new(1, dot(-2.0, -3.0)));
        st.fold_bounds(Some(Rect::new(Point::new(-2.0, -3.0), Point::new(-2.0, -3.0))));
        let rewrites = st.realign(1);
        assert_eq!(st.origin, Point::new(-2.0, -3.0));
        assert_eq!(rewrites.len(), 1);
        assert_eq!(rewrites[0].0, 0);
        // layer 0's point (0,0) now sits at (2,3) in shared space
        assert_eq!(rewrites[0].1.apply(Point::ORIGIN), Point::new(2.0, 3.0));
    }

    #[test]
    #[serial]
    fn test_layers_share_origin() {
        let surface = HeadlessSurface::new();
        let view = surface.state();
        let mut coordinator = RenderCoordinator::start(Box::new(surface), Duration::from_millis(1)).unwrap();
        let events = coordinator.events();

        coordinator.submit(0, dot(5.0, 5.0), false);
        next_pass(&events);
        coordinator.submit(1, dot(-1.0, 2.0), false);
        let summary = next_pass(&events);

        assert_eq!(summary.origin, Point::new(-1.0, 2.0));
        let state = view.lock();
        let t0 = state.layers[&0].transform;
        let t1 = state.layers[&1].transform;
        assert_eq!(t0.apply(Point::new(5.0, 5.0)), Point::new(6.0, 3.0));
        assert_eq!(t1.apply(Point::new(-1.0, 2.0)), Point::ORIGIN);
        drop(state);
        coordinator.shutdown();
    }

    #[test]
    #[serial]
    fn test_burst_is_coalesced_and_throttled() {
        let surface = HeadlessSurface::new();
        let view = surface.state();
        let interval = Duration::from_millis(250);
        let mut coordinator = RenderCoordinator::start(Box::new(surface), interval).unwrap();
        let events = coordinator.events();

        coordinator.submit(0, dot(0.0, 0.0), false);
        next_pass(&events);
        let started = std::time::Instant::now();

        // Worker is sleeping out its interval; these land in one batch.
        coordinator.submit(3, dot(1.0, 1.0), false);
        coordinator.submit(3, dot(2.0, 2.0), false);
        let summary = next_pass(&events);

        assert!(started.elapsed() >= interval / 2);
        assert_eq!(summary.layers_updated, vec![3]);
        assert_eq!(view.lock().apply_counts.get(&3), Some(&1));
        coordinator.shutdown();
    }

    #[test]
    #[serial]
    fn test_remove_recomputes_bounds() {
        let mut coordinator =
            RenderCoordinator::start(Box::new(HeadlessSurface::new()), Duration::from_millis(1)).unwrap();
        let events = coordinator.events();

        coordinator.submit(0, dot(0.0, 0.0), false);
        coordinator.submit(1, dot(10.0, 10.0), false);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(coordinator.layer_count(), 2);
        let _ = events.try_iter().count();

        coordinator.remove(1);
        let summary = next_pass(&events);

        assert_eq!(summary.global_bounds, Some(Rect::new(Point::ORIGIN, Point::ORIGIN)));
        assert_eq!(coordinator.layer_count(), 1);
        coordinator.shutdown();
    }
}
