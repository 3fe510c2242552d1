//! Coalescing update queue.
//!
//! Producers push [`UpdateRequest`]s from any thread. At most one request per
//! layer is pending: a push replaces the layer's previous request, so a burst
//! costs no more memory than the number of layers. The single consumer swaps
//! out everything pending. The swap and the reset of the wake flag happen
//! under the same lock as every push, so a request enqueued while the
//! consumer is draining always leaves the flag set for the next cycle.

use super::layer::LayerContent;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// New state for a layer.
#[derive(Debug, Clone)]
pub enum LayerUpdate {
    Content(Arc<dyn LayerContent>),
    Remove,
}

/// Request to refresh one layer.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub layer_index: usize,
    /// Recompute the global bounds from every layer instead of folding this one in
    pub recompute_global_bounds: bool,
    pub update: LayerUpdate,
}

/// Replace the pending request for the same layer, OR-ing the recompute flags.
fn merge(pending: &mut BTreeMap<usize, UpdateRequest>, request: UpdateRequest) {
    let recompute = request.recompute_global_bounds
        || pending
            .get(&request.layer_index)
            .is_some_and(|prev| prev.recompute_global_bounds);
    pending.insert(
        request.layer_index,
        UpdateRequest {
            recompute_global_bounds: recompute,
            ..request
        },
    );
}

/// Keep the last request per layer, OR-ing the recompute flags.
///
/// The result is sorted by layer index. Batches taken from an
/// [`UpdateQueue`] are already in this form.
pub fn coalesce(batch: Vec<UpdateRequest>) -> Vec<UpdateRequest> {
    let mut by_layer = BTreeMap::new();
    for request in batch {
        merge(&mut by_layer, request);
    }
    by_layer.into_values().collect()
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<usize, UpdateRequest>,
    signaled: bool,
    closed: bool,
}

/// Mailbox between producers and the coordinator worker.
#[derive(Default)]
pub struct UpdateQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue and signal. Returns `false` once the queue is closed.
    pub fn push(&self, request: UpdateRequest) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        merge(&mut state.pending, request);
        state.signaled = true;
        self.wake.notify_one();
        true
    }

    /// Wait until signaled, then take everything pending, sorted by layer.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn wait_batch(&self) -> Option<Vec<UpdateRequest>> {
        let mut state = self.state.lock();
        while !state.signaled && !state.closed {
            self.wake.wait(&mut state);
        }
        Self::take_locked(&mut state)
    }

    /// Like [`wait_batch`](Self::wait_batch) but gives up after `timeout`,
    /// returning an empty batch.
    pub fn wait_batch_timeout(&self, timeout: Duration) -> Option<Vec<UpdateRequest>> {
        let mut state = self.state.lock();
        if !state.signaled && !state.closed {
            let _ = self.wake.wait_for(&mut state, timeout);
        }
        if !state.signaled && !state.closed {
            return Some(Vec::new());
        }
        Self::take_locked(&mut state)
    }

    /// Take everything pending without waiting.
    pub fn try_batch(&self) -> Vec<UpdateRequest> {
        let mut state = self.state.lock();
        state.signaled = false;
        std::mem::take(&mut state.pending).into_values().collect()
    }

    fn take_locked(state: &mut QueueState) -> Option<Vec<UpdateRequest>> {
        if state.closed && state.pending.is_empty() {
            return None;
        }
        state.signaled = false;
        Some(std::mem::take(&mut state.pending).into_values().collect())
    }

    /// Number of layers with a pending request.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further pushes and wake the consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.wake.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::layer::Primitives;
    use proptest::prelude::*;

    fn request(layer_index: usize, recompute: bool) -> UpdateRequest {
        UpdateRequest {
            layer_index,
            recompute_global_bounds: recompute,
            update: LayerUpdate::Content(Arc::new(Primitives::new())),
        }
    }

    #[test]
    fn test_coalesce_keeps_last_per_layer() {
        let last = Arc::new(Primitives::new());
        let mut batch = vec![request(3, true), request(1, false), request(3, false)];
        batch.push(UpdateRequest {
            layer_index: 3,
            recompute_global_bounds: false,
            update: LayerUpdate::Content(last.clone()),
        });

        let out = coalesce(batch);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].layer_index, 1);
        assert_eq!(out[1].layer_index, 3);
        assert!(out[1].recompute_global_bounds);
        match &out[1].update {
            LayerUpdate::Content(c) => {
                let expected: Arc<dyn LayerContent> = last;
                assert!(Arc::ptr_eq(c, &expected));
            }
            LayerUpdate::Remove => panic!("expected content"),
        }
    }

    #[test]
    fn test_push_replaces_pending_request_for_layer() {
        let queue = UpdateQueue::new();
        for _ in 0..100 {
            queue.push(request(4, false));
        }
        queue.push(request(1, true));
        queue.push(request(4, true));
        queue.push(request(4, false));
        assert_eq!(queue.len(), 2);

        let batch = queue.try_batch();
        assert_eq!(batch.iter().map(|r| r.layer_index).collect::<Vec<_>>(), vec![1, 4]);
        assert!(batch.iter().all(|r| r.recompute_global_bounds));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_after_take_resignals() {
        let queue = UpdateQueue::new();
        queue.push(request(0, false));
        assert_eq!(queue.wait_batch().unwrap().len(), 1);
        queue.push(request(1, false));
        let batch = queue.wait_batch_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_timeout_returns_empty_batch() {
        let queue = UpdateQueue::new();
        let batch = queue.wait_batch_timeout(Duration::from_millis(5)).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_close_drains_then_ends() {
        let queue = UpdateQueue::new();
        queue.push(request(0, false));
        queue.close();
        assert!(!queue.push(request(1, false)));
        assert_eq!(queue.wait_batch().unwrap().len(), 1);
        assert!(queue.wait_batch().is_none());
    }

    #[test]
    fn test_producer_wakes_blocked_consumer() {
        let queue = Arc::new(UpdateQueue::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.wait_batch())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.push(request(2, false));
        let batch = consumer.join().unwrap().unwrap();
        assert_eq!(batch[0].layer_index, 2);
    }

    proptest! {
        #[test]
        fn prop_coalesce_one_per_layer(indices in proptest::collection::vec((0usize..8, any::<bool>()), 0..64)) {
            let batch: Vec<_> = indices.iter().map(|(i, r)| request(*i, *r)).collect();
            let out = coalesce(batch);

            let mut distinct: Vec<usize> = indices.iter().map(|(i, _)| *i).collect();
            distinct.sort();
            distinct.dedup();
            prop_assert_eq!(out.iter().map(|r| r.layer_index).collect::<Vec<_>>(), distinct);

            for r in &out {
                let any_recompute = indices.iter().any(|(i, f)| *i == r.layer_index && *f);
                prop_assert_eq!(r.recompute_global_bounds, any_recompute);
            }
        }
    }
}
