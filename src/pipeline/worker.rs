//! Background workers for pipeline runs.
//!
//! A fixed set of named threads pulls boxed jobs from a bounded channel.
//! Submitting returns as soon as the job is queued; the pipeline's own run
//! guard serializes the runs themselves.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pending jobs before `submit` starts blocking.
const JOB_CHANNEL_CAPACITY: usize = 64;

pub struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `threads` workers (at least one).
    pub fn new(threads: usize) -> PipelineResult<Self> {
        let (tx, rx) = bounded::<Job>(JOB_CHANNEL_CAPACITY);
        let mut handles = Vec::new();
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("treevis-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    tracing::debug!("Worker {} exiting", i);
                })?;
            handles.push(handle);
        }
        tracing::info!("Started {} pipeline worker(s)", handles.len());
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        })
    }

    /// Queue a job.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> PipelineResult<()> {
        let tx = self.tx.lock().clone().ok_or(PipelineError::ChannelSend)?;
        tx.send(Box::new(job)).map_err(|_| PipelineError::ChannelSend)
    }

    pub fn threads(&self) -> usize {
        self.handles.lock().len()
    }

    /// Stop accepting jobs, finish queued ones and join every worker.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("Pipeline worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_every_job() {
        let pool = WorkerPool::new(3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.threads(), 1);
        pool.shutdown();
        assert!(matches!(pool.submit(|| {}), Err(PipelineError::ChannelSend)));
    }
}
