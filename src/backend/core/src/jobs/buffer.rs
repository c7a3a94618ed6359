//! Pending buffer: bounded FIFO handoff between the Fetcher and the Dispatcher.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Job, JobId};

/// Result of offering a job to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Already buffered or still executing locally
    Duplicate,
    /// At capacity; the job stays queued in the store
    Full,
}

struct BufferState {
    queue: VecDeque<Job>,
    /// Ids from push until the executor releases them.
    tracked: HashSet<JobId>,
}

/// Non-authoritative local copy of claimable jobs.
///
/// A job id stays tracked after `pop` until `release` is called, so a job that
/// is executing is not fetched into the buffer a second time.
pub struct PendingBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    notify: Notify,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                tracked: HashSet::new(),
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, job: Job) -> PushOutcome {
        {
            let mut state = self.state.lock();
            if state.tracked.contains(&job.id) {
                return PushOutcome::Duplicate;
            }
            if state.queue.len() >= self.capacity {
                return PushOutcome::Full;
            }
            state.tracked.insert(job.id);
            state.queue.push_back(job);
        }
        self.notify.notify_one();
        PushOutcome::Queued
    }

    pub fn pop(&self) -> Option<Job> {
        self.state.lock().queue.pop_front()
    }

    /// Forget a job once its execution task is done with it.
    pub fn release(&self, job_id: JobId) {
        self.state.lock().tracked.remove(&job_id);
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.state.lock().tracked.contains(&job_id)
    }

    /// Jobs waiting to be dispatched.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolves after the next successful push (or immediately if one happened
    /// since the last wait).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Drop everything still waiting, returning how many jobs were discarded.
    /// They remain queued in the store.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let drained: Vec<Job> = state.queue.drain(..).collect();
        for job in &drained {
            state.tracked.remove(&job.id);
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobKind, JobStatus};
    use chrono::Utc;

    fn job() -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            kind: JobKind::Generic,
            priority: 0,
            run_at: now,
            max_attempts: 3,
            attempt: 0,
            dedupe_key: None,
            payload: serde_json::json!({}),
            status: JobStatus::Queued,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_fifo_order() {
        let buffer = PendingBuffer::new(10);
        let (a, b) = (job(), job());
        let (a_id, b_id) = (a.id, b.id);

        assert_eq!(buffer.push(a), PushOutcome::Queued);
        assert_eq!(buffer.push(b), PushOutcome::Queued);
        assert_eq!(buffer.pop().map(|j| j.id), Some(a_id));
        assert_eq!(buffer.pop().map(|j| j.id), Some(b_id));
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn test_rejects_duplicates_until_released() {
        let buffer = PendingBuffer::new(10);
        let first = job();
        let again = first.clone();

        assert_eq!(buffer.push(first), PushOutcome::Queued);
        assert_eq!(buffer.push(again.clone()), PushOutcome::Duplicate);

        let popped = buffer.pop().unwrap();
        assert_eq!(buffer.push(again.clone()), PushOutcome::Duplicate);

        buffer.release(popped.id);
        assert!(!buffer.contains(popped.id));
        assert_eq!(buffer.push(again), PushOutcome::Queued);
    }

    #[test]
    fn test_rejects_beyond_capacity() {
        let buffer = PendingBuffer::new(2);
        assert_eq!(buffer.push(job()), PushOutcome::Queued);
        assert_eq!(buffer.push(job()), PushOutcome::Queued);

        let overflow = job();
        let overflow_id = overflow.id;
        assert_eq!(buffer.push(overflow), PushOutcome::Full);
        assert!(!buffer.contains(overflow_id));
        assert_eq!(buffer.len(), 2);

        buffer.pop();
        assert_eq!(buffer.push(job()), PushOutcome::Queued);
    }

    #[test]
    fn test_drain_forgets_waiting_jobs() {
        let buffer = PendingBuffer::new(4);
        let waiting = job();
        let id = waiting.id;
        buffer.push(waiting);

        assert_eq!(buffer.drain(), 1);
        assert!(buffer.is_empty());
        assert!(!buffer.contains(id));
    }

    #[test]
    fn test_notified_pending_until_push() {
        let buffer = PendingBuffer::new(4);
        let mut waiting = tokio_test::task::spawn(buffer.notified());
        tokio_test::assert_pending!(waiting.poll());

        buffer.push(job());
        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let buffer = std::sync::Arc::new(PendingBuffer::new(4));
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer.notified().await;
                buffer.pop().is_some()
            })
        };

        tokio::task::yield_now().await;
        buffer.push(job());
        assert!(waiter.await.unwrap());
    }
}
