//! Thread boundary between the pipeline workers and the host.
//!
//! The engine reports through a [`PipelineObserver`]. Hosts that poll (a UI
//! frame loop, the headless runner) use [`PipelineBridge::new`] to get a
//! channel-backed observer and drain events at their own pace.

use crate::params::ControlStatus;
use crate::pipeline::engine::RunSummary;
use crate::pipeline::id::StageIndex;
use crate::pipeline::selection::SelectionHandle;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Notifications sent from pipeline workers to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Advisory progress of a running stage, `0.0..=1.0`.
    Progress { stage: StageIndex, fraction: f64 },

    /// A stage completed; any earlier error of its module is cleared.
    StageSucceeded { stage: StageIndex, module_id: Uuid },

    /// A stage failed; the error table now holds `message` for the module.
    StageFailed {
        stage: StageIndex,
        module_id: Uuid,
        message: String,
    },

    /// Control status returned by a module's parameter change handler.
    ControlStatus {
        stage: StageIndex,
        status: BTreeMap<String, ControlStatus>,
    },

    /// The attribute names present in the final tree changed.
    AttributesChanged(Vec<String>),

    /// The selection was recovered in a new tree, or cleared.
    SelectionChanged(Option<SelectionHandle>),

    /// A run finished, was stopped or aborted.
    RunCompleted(RunSummary),
}

/// Receives pipeline events. Called from worker threads.
#[cfg_attr(test, mockall::automock)]
pub trait PipelineObserver: Send + Sync {
    fn notify(&self, event: PipelineEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl PipelineObserver for NullObserver {
    fn notify(&self, _event: PipelineEvent) {}
}

/// Channel capacity for events (pipeline → host).
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Observer that forwards events into a bounded channel.
///
/// A full channel drops the event instead of blocking the worker.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: Sender<PipelineEvent>,
}

impl PipelineObserver for ChannelObserver {
    fn notify(&self, event: PipelineEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                if !matches!(event, PipelineEvent::Progress { .. }) {
                    tracing::warn!("Event channel full, dropped {:?}", event);
                }
            }
        }
    }
}

/// Host-side handle for pipeline events.
pub struct PipelineBridge {
    pub event_rx: Receiver<PipelineEvent>,
}

impl PipelineBridge {
    /// Create a bridge and the observer to hand to the pipeline.
    pub fn new() -> (Self, ChannelObserver) {
        let (tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        (Self { event_rx }, ChannelObserver { tx })
    }

    /// Drain all pending events.
    pub fn drain(&self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Try to receive a single event without blocking.
    pub fn try_recv(&self) -> Option<PipelineEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Block until the next [`PipelineEvent::RunCompleted`], collecting
    /// everything received before it.
    pub fn wait_for_run(&self, timeout: Duration) -> Option<(Vec<PipelineEvent>, RunSummary)> {
        let deadline = std::time::Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.event_rx.recv_timeout(remaining) {
                Ok(PipelineEvent::RunCompleted(summary)) => return Some((seen, summary)),
                Ok(event) => seen.push(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_in_order() {
        let (bridge, observer) = PipelineBridge::new();
        observer.notify(PipelineEvent::AttributesChanged(vec!["Name".into()]));
        observer.notify(PipelineEvent::SelectionChanged(None));

        let events = bridge.drain();
        assert_eq!(
            events,
            vec![
                PipelineEvent::AttributesChanged(vec!["Name".into()]),
                PipelineEvent::SelectionChanged(None),
            ]
        );
        assert!(bridge.try_recv().is_none());
    }

    #[test]
    fn test_full_channel_does_not_block() {
        let (bridge, observer) = PipelineBridge::new();
        for _ in 0..EVENT_CHANNEL_CAPACITY + 10 {
            observer.notify(PipelineEvent::Progress {
                stage: StageIndex::Load,
                fraction: 0.5,
            });
        }
        assert_eq!(bridge.drain().len(), EVENT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_dropped_bridge_ignored() {
        let (bridge, observer) = PipelineBridge::new();
        drop(bridge);
        observer.notify(PipelineEvent::SelectionChanged(None));
    }
}
