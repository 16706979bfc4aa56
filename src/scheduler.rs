//! Fixed-size worker pool that drives jobs from the queue to a terminal state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLookup, Fingerprint, ResultCache};
use crate::config::{EngineConfig, SchedulerConfig};
use crate::error::{MediaJobError, Result};
use crate::job::{ErrorKind, JobId, JobRequest, JobResult, JobStatus, RequesterId};
use crate::media::{MediaEngine, OperationPlan};
use crate::queue::JobQueue;

/// Where a job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running { worker: usize },
    Finished(JobStatus),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

struct JobRecord {
    state: JobState,
    requester: RequesterId,
    cancel: CancellationToken,
    responder: Option<oneshot::Sender<JobResult>>,
    enqueued_at: Instant,
}

/// Receives the result of one submitted job
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    receiver: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job's terminal result
    pub async fn wait(self) -> JobResult {
        let id = self.id;
        self.receiver.await.unwrap_or_else(|_| {
            JobResult::failed(id, ErrorKind::InternalFault, "job was dropped without a result", Duration::ZERO)
        })
    }
}

struct Shared {
    queue: JobQueue,
    engine: Arc<dyn MediaEngine>,
    cache: Option<Arc<ResultCache>>,
    records: Mutex<HashMap<JobId, JobRecord>>,
    /// Finished job ids, oldest first; locked only while `records` is held
    finished: Mutex<VecDeque<JobId>>,
    config: SchedulerConfig,
    job_timeout: Duration,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        queue: JobQueue,
        engine: Arc<dyn MediaEngine>,
        cache: Option<Arc<ResultCache>>,
        config: SchedulerConfig,
        engine_config: &EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                engine,
                cache,
                records: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                config,
                job_timeout: engine_config.job_timeout(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `workers` worker tasks on the current runtime
    pub fn start(&self, workers: usize) {
        let mut handles = lock(&self.workers);
        let first = handles.len();
        for worker_id in first..first + workers.max(1) {
            let shared = Arc::clone(&self.shared);
            handles.push(tokio::spawn(async move {
                shared.worker_loop(worker_id).await;
            }));
        }
        info!("Started {} workers", workers.max(1));
    }

    /// Validate and enqueue a request.
    ///
    /// Validation failures and backpressure are returned here; the request
    /// never reaches the queue in that case.
    pub async fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        OperationPlan::from_request(&request)?;

        let id = request.id();
        let (responder, receiver) = oneshot::channel();
        {
            let mut records = self.shared.records();
            if records.contains_key(&id) {
                return Err(MediaJobError::InvalidParameters(format!("job id {} was already submitted", id)));
            }
            records.insert(
                id,
                JobRecord {
                    state: JobState::Queued,
                    requester: request.requester().clone(),
                    cancel: CancellationToken::new(),
                    responder: Some(responder),
                    enqueued_at: Instant::now(),
                },
            );
        }

        if let Err(e) = self.shared.queue.submit(request).await {
            self.shared.records().remove(&id);
            return Err(e);
        }

        debug!("Accepted job {}", id);
        Ok(JobHandle { id, receiver })
    }

    /// Cancel a queued or running job; false if it is unknown or already finished
    pub fn cancel(&self, id: JobId) -> bool {
        self.shared.cancel(id)
    }

    /// Cancel every unfinished job of one requester, returning how many were cancelled
    pub fn cancel_requester(&self, requester: &RequesterId) -> usize {
        let ids: Vec<JobId> = self
            .shared
            .records()
            .iter()
            .filter(|(_, r)| &r.requester == requester && !r.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| self.shared.cancel(*id)).count()
    }

    /// State of a known job. Finished jobs are forgotten once more than
    /// `finished_retention` newer jobs have finished.
    pub fn status(&self, id: JobId) -> Option<JobState> {
        self.shared.records().get(&id).map(|r| r.state)
    }

    /// Number of jobs not yet in a terminal state
    pub fn active_jobs(&self) -> usize {
        self.shared.records().values().filter(|r| !r.state.is_terminal()).count()
    }

    /// Stop accepting work and wait for the workers to exit.
    ///
    /// Graceful shutdown lets the workers drain the queue; otherwise queued
    /// jobs are cancelled and running jobs are told to stop.
    pub async fn shutdown(&self, graceful: bool) {
        info!("Shutting down scheduler (graceful: {})", graceful);
        if !graceful {
            for request in self.shared.queue.drain() {
                self.shared.finish(request.id(), |elapsed| JobResult::cancelled(request.id(), elapsed));
            }
            let running: Vec<JobId> = self
                .shared
                .records()
                .iter()
                .filter(|(_, r)| !r.state.is_terminal())
                .map(|(id, _)| *id)
                .collect();
            for id in running {
                self.shared.cancel(id);
            }
        }
        self.shared.queue.close();

        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn records(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        lock(&self.records)
    }

    fn cancel(&self, id: JobId) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(&id) else {
            return false;
        };
        let state = record.state;
        match state {
            JobState::Finished(_) => false,
            JobState::Queued => {
                record.cancel.cancel();
                drop(records);
                // Still in the queue: resolve here. Otherwise a worker has just taken
                // it and will see the token before dispatch.
                if self.queue.remove(id).is_some() {
                    self.finish(id, |elapsed| JobResult::cancelled(id, elapsed));
                }
                info!("Cancelled queued job {}", id);
                true
            }
            JobState::Running { worker } => {
                record.cancel.cancel();
                info!("Cancelling job {} on worker {}", id, worker);
                true
            }
        }
    }

    /// Move a dequeued job to running, unless it was cancelled meanwhile
    fn begin(&self, id: JobId, worker: usize) -> Option<CancellationToken> {
        let mut records = self.records();
        let record = records.get_mut(&id)?;
        if record.state != JobState::Queued {
            return None;
        }
        if record.cancel.is_cancelled() {
            drop(records);
            self.finish(id, |elapsed| JobResult::cancelled(id, elapsed));
            return None;
        }
        record.state = JobState::Running { worker };
        Some(record.cancel.clone())
    }

    /// Deliver the terminal result exactly once
    fn finish(&self, id: JobId, make_result: impl FnOnce(Duration) -> JobResult) {
        let mut records = self.records();
        let Some(record) = records.get_mut(&id) else {
            warn!("Result for unknown job {} dropped", id);
            return;
        };
        if record.state.is_terminal() {
            warn!("Job {} already finished; ignoring second result", id);
            return;
        }
        let mut result = make_result(record.enqueued_at.elapsed());
        result.job_id = id;
        record.state = JobState::Finished(result.status);
        let responder = record.responder.take();
        self.retire(&mut records, id);
        drop(records);

        info!("Job {} finished: {}", id, result.summary());
        if let Some(responder) = responder {
            if responder.send(result).is_err() {
                debug!("Requester of job {} is no longer listening", id);
            }
        }
    }

    /// Remember a finished job, forgetting the oldest beyond the retention limit
    fn retire(&self, records: &mut HashMap<JobId, JobRecord>, id: JobId) {
        let mut finished = lock(&self.finished);
        finished.push_back(id);
        while finished.len() > self.config.finished_retention {
            if let Some(oldest) = finished.pop_front() {
                records.remove(&oldest);
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("Worker {} started", worker_id);

        while let Some(request) = self.queue.poll().await {
            let id = request.id();
            let Some(cancel) = self.begin(id, worker_id) else {
                continue;
            };
            info!("Worker {} running job {} ({})", worker_id, id, request.operation());

            // Each job runs in its own task so a panic is contained to that job.
            let shared = Arc::clone(&self);
            let task = tokio::spawn(async move { shared.execute(request, cancel).await });
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Worker {} hit an internal fault on job {}: {}", worker_id, id, e);
                    JobResult::failed(id, ErrorKind::InternalFault, format!("worker fault: {}", e), Duration::ZERO)
                }
            };
            self.finish(id, move |elapsed| JobResult { duration: elapsed, ..result });
        }

        debug!("Worker {} stopped", worker_id);
    }

    /// Produce a job's result, sharing work with identical in-flight jobs
    async fn execute(self: Arc<Self>, request: JobRequest, cancel: CancellationToken) -> JobResult {
        let Some(cache) = self.cache.clone() else {
            return self.run_with_retries(&request, &cancel).await;
        };
        let fingerprint = match Fingerprint::of(&request) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                debug!("Job {} bypasses the cache: {}", request.id(), e);
                return self.run_with_retries(&request, &cancel).await;
            }
        };

        let started = Instant::now();
        loop {
            match cache.lookup_or_reserve(&fingerprint) {
                CacheLookup::Hit(result) => {
                    info!("Job {} served from cache", request.id());
                    return result.shared_with(request.id(), started.elapsed());
                }
                CacheLookup::InFlight(waiter) => {
                    debug!("Job {} waiting on identical job in flight", request.id());
                    tokio::select! {
                        shared = waiter.wait() => {
                            if let Some(result) = shared {
                                return result.shared_with(request.id(), started.elapsed());
                            }
                            // The leader did not succeed; try to take over.
                        }
                        _ = cancel.cancelled() => {
                            return JobResult::cancelled(request.id(), started.elapsed());
                        }
                    }
                }
                CacheLookup::Reserved(reservation) => {
                    let result = self.run_with_retries(&request, &cancel).await;
                    return match reservation.complete(result.clone()).await {
                        Ok(stored) => stored,
                        Err(e) => {
                            warn!("Failed to cache result of job {}: {}", request.id(), e);
                            result
                        }
                    };
                }
            }
        }
    }

    /// Run the engine, retrying only failures it marks retryable
    async fn run_with_retries(&self, request: &JobRequest, cancel: &CancellationToken) -> JobResult {
        let timeout = request.timeout().unwrap_or(self.job_timeout);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let deadline = Instant::now() + timeout;
            let mut result = self.engine.run(request, deadline, cancel.clone()).await;
            result.attempts = attempt;

            if !result.is_retryable() || attempt >= max_attempts || cancel.is_cancelled() {
                return result;
            }

            let delay = self.config.backoff(attempt);
            warn!(
                "Job {} attempt {}/{} failed ({}), retrying in {:?}",
                request.id(),
                attempt,
                max_attempts,
                result.summary(),
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    let mut cancelled = JobResult::cancelled(request.id(), result.duration);
                    cancelled.attempts = attempt;
                    return cancelled;
                }
            }
            attempt += 1;
        }
    }
}
