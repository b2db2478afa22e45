//! Worker queues
//!
//! [`ChannelQueue`] feeds the in-process worker pool over a tokio channel.
//! [`RecordingQueue`] only records what was enqueued so tests can inspect
//! and drain it step by step.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use super::BackgroundJob;

/// Asynchronous work submission
pub trait WorkerQueue: Send + Sync {
    fn enqueue(&self, job: BackgroundJob);
    fn enqueue_in(&self, job: BackgroundJob, delay: Duration);
}

/// Unbounded channel drained by [`super::run_worker`]
#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<BackgroundJob>,
}

impl ChannelQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackgroundJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl WorkerQueue for ChannelQueue {
    fn enqueue(&self, job: BackgroundJob) {
        tracing::debug!(?job, "Enqueued background job");
        if let Err(err) = self.sender.send(job) {
            tracing::warn!(job = ?err.0, "Worker queue closed, dropping background job");
        }
    }

    fn enqueue_in(&self, job: BackgroundJob, delay: Duration) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = sender.send(job) {
                tracing::warn!(job = ?err.0, "Worker queue closed, dropping delayed job");
            }
        });
    }
}

/// Queue that keeps jobs until they are taken explicitly
#[derive(Default)]
pub struct RecordingQueue {
    ready: Mutex<VecDeque<BackgroundJob>>,
    delayed: Mutex<Vec<(BackgroundJob, Duration)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next job in submission order
    pub fn pop(&self) -> Option<BackgroundJob> {
        self.ready.lock().ok()?.pop_front()
    }

    /// Every job waiting to run, in submission order
    pub fn jobs(&self) -> Vec<BackgroundJob> {
        self.ready
            .lock()
            .map(|ready| ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn delayed(&self) -> Vec<(BackgroundJob, Duration)> {
        self.delayed
            .lock()
            .map(|delayed| delayed.clone())
            .unwrap_or_default()
    }

    /// Move delayed jobs to the ready queue as if their delay elapsed
    pub fn release_delayed(&self) {
        let released: Vec<_> = match self.delayed.lock() {
            Ok(mut delayed) => delayed.drain(..).map(|(job, _)| job).collect(),
            Err(_) => return,
        };
        if let Ok(mut ready) = self.ready.lock() {
            ready.extend(released);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut ready) = self.ready.lock() {
            ready.clear();
        }
        if let Ok(mut delayed) = self.delayed.lock() {
            delayed.clear();
        }
    }
}

impl WorkerQueue for RecordingQueue {
    fn enqueue(&self, job: BackgroundJob) {
        if let Ok(mut ready) = self.ready.lock() {
            ready.push_back(job);
        }
    }

    fn enqueue_in(&self, job: BackgroundJob, delay: Duration) {
        if let Ok(mut delayed) = self.delayed.lock() {
            delayed.push((job, delay));
        }
    }
}
