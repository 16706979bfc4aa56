//! Bounded FIFO of pending job requests.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::{QueueConfig, QueuePolicy};
use crate::error::{MediaJobError, Result};
use crate::job::{JobId, JobRequest};

struct QueueState {
    items: VecDeque<JobRequest>,
    closed: bool,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: QueuePolicy,
    available: Notify,
    space: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.capacity, config.policy)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a request, waiting for space or failing fast per the policy
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let mut request = Some(request);
        loop {
            let space = self.space.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(MediaJobError::QueueClosed);
                }
                if state.items.len() < self.capacity {
                    if let Some(request) = request.take() {
                        let id = request.id();
                        state.items.push_back(request);
                        debug!("Queued job {} ({} pending)", id, state.items.len());
                        drop(state);
                        self.available.notify_one();
                        return Ok(id);
                    }
                }
                if self.policy == QueuePolicy::FailFast {
                    return Err(MediaJobError::QueueFull(self.capacity));
                }
            }
            space.await;
        }
    }

    /// Next request in FIFO order; `None` once the queue is closed and drained
    pub async fn poll(&self) -> Option<JobRequest> {
        loop {
            let available = self.available.notified();
            {
                let mut state = self.lock();
                if let Some(request) = state.items.pop_front() {
                    let more = !state.items.is_empty();
                    drop(state);
                    self.space.notify_one();
                    if more {
                        self.available.notify_one();
                    }
                    return Some(request);
                }
                if state.closed {
                    return None;
                }
            }
            available.await;
        }
    }

    /// Take a still-pending request out of the queue
    pub fn remove(&self, id: JobId) -> Option<JobRequest> {
        let mut state = self.lock();
        let position = state.items.iter().position(|r| r.id() == id)?;
        let request = state.items.remove(position);
        drop(state);
        self.space.notify_one();
        request
    }

    /// Remove every pending request, e.g. for a non-graceful shutdown
    pub fn drain(&self) -> Vec<JobRequest> {
        let mut state = self.lock();
        let drained: Vec<_> = state.items.drain(..).collect();
        drop(state);
        self.space.notify_waiters();
        drained
    }

    /// Refuse new submissions; pollers drain what is left and then stop
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{MediaSource, Operation, RequesterId};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn request() -> JobRequest {
        JobRequest::new(MediaSource::local("clip.mp4"), Operation::Convert, RequesterId::new("tester"))
            .with_param("format", "webm")
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new(4, QueuePolicy::FailFast);
        let first = queue.submit(request()).await.unwrap();
        let second = queue.submit(request()).await.unwrap();

        assert_eq!(queue.poll().await.unwrap().id(), first);
        assert_eq!(queue.poll().await.unwrap().id(), second);
    }

    #[tokio::test]
    async fn test_fail_fast_when_full() {
        let queue = JobQueue::new(2, QueuePolicy::FailFast);
        queue.submit(request()).await.unwrap();
        queue.submit(request()).await.unwrap();

        let err = queue.submit(request()).await.unwrap_err();
        assert!(matches!(err, MediaJobError::QueueFull(2)));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let queue = JobQueue::new(1, QueuePolicy::Block);
        let first = queue.submit(request()).await.unwrap();

        let mut blocked = task::spawn(queue.submit(request()));
        assert_pending!(blocked.poll());

        assert_eq!(queue.poll().await.unwrap().id(), first);
        assert!(blocked.is_woken());
        let second = assert_ready_ok!(blocked.poll());
        drop(blocked);
        assert_eq!(queue.poll().await.unwrap().id(), second);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = JobQueue::new(4, QueuePolicy::FailFast);
        let id = queue.submit(request()).await.unwrap();
        queue.close();

        assert!(matches!(queue.submit(request()).await, Err(MediaJobError::QueueClosed)));
        assert_eq!(queue.poll().await.unwrap().id(), id);
        assert!(queue.poll().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_idle_pollers() {
        let queue = Arc::new(JobQueue::new(4, QueuePolicy::FailFast));
        let poller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.poll().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let polled = tokio::time::timeout(Duration::from_secs(1), poller).await.unwrap().unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn test_close_releases_blocked_submitters() {
        let queue = Arc::new(JobQueue::new(1, QueuePolicy::Block));
        queue.submit(request()).await.unwrap();
        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(request()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert!(matches!(result, Err(MediaJobError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_remove_pending() {
        let queue = JobQueue::new(4, QueuePolicy::FailFast);
        let first = queue.submit(request()).await.unwrap();
        let second = queue.submit(request()).await.unwrap();

        assert_eq!(queue.remove(first).unwrap().id(), first);
        assert!(queue.remove(first).is_none());
        assert_eq!(queue.poll().await.unwrap().id(), second);
    }
}
