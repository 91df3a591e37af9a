use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::error::{JudgeError, Result};
use crate::model::JudgeRequest;

const DEFAULT_CAPACITY: usize = 64;

/// Requeues beyond this many attempts are logged as suspicious.
const WARN_ATTEMPTS: u32 = 3;

/// A request waiting for a worker, with the number of times it was handed
/// out and came back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub request: JudgeRequest,
    pub attempts: u32,
}

/// Shared pull-queue of pending judge requests.
///
/// Every worker stream pops from the same queue, so connected workers form a
/// load-balanced pool. Intake is bounded; requeued work always goes back to
/// the tail, even when the queue is full, so in-flight jobs are never lost.
#[derive(Debug)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<QueuedJob>>,
    ready: Notify,
    capacity: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            capacity,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<QueuedJob>> {
        // No critical section can leave the deque half-modified.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a fresh request. Fails when the queue is at capacity.
    pub fn push(&self, request: JudgeRequest) -> Result<()> {
        {
            let mut jobs = self.jobs();
            if jobs.len() >= self.capacity {
                return Err(JudgeError::QueueFull(jobs.len()));
            }
            jobs.push_back(QueuedJob {
                request,
                attempts: 0,
            });
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Put a dispatched request back at the tail after its stream failed.
    pub fn requeue(&self, mut job: QueuedJob) {
        job.attempts += 1;
        if job.attempts > WARN_ATTEMPTS {
            tracing::warn!(
                submission_id = %job.request.id,
                attempts = job.attempts,
                "Judge request keeps failing, requeueing again"
            );
        } else {
            tracing::info!(
                submission_id = %job.request.id,
                attempts = job.attempts,
                "Requeueing judge request"
            );
        }
        self.jobs().push_back(job);
        self.ready.notify_one();
    }

    /// Wait for the next request.
    ///
    /// Cancel safe: dropping the future before it completes never loses a
    /// request.
    pub async fn pop(&self) -> QueuedJob {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job) = self.try_pop() {
                return job;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<QueuedJob> {
        let mut jobs = self.jobs();
        let job = jobs.pop_front();
        if job.is_some() && !jobs.is_empty() {
            // Pass the wakeup on; another waiter may be parked.
            self.ready.notify_one();
        }
        job
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}
