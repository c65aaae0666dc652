use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ad_radar_common::{QueueConfig, QueueStats, ScrapeError, ScrapeResult};

use crate::cancellation::CancellationExt;
use crate::job::{
    JobContext, JobHandler, JobId, JobKind, JobOutput, JobRequest, JobTicket, JobType,
};

/// Shared record for one submitted job. Lives in the queue, then in the
/// active set, and is dropped once its task finishes.
struct JobRecord {
    id: JobId,
    kind: JobKind,
    user_id: Option<String>,
    max_retries: u32,
    priority: AtomicI32,
    retries: AtomicU32,
    cancelled: AtomicBool,
    token: CancellationToken,
    completion: Mutex<Option<oneshot::Sender<ScrapeResult<JobOutput>>>>,
}

impl JobRecord {
    fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn belongs_to(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    /// Resolve the ticket. Only the first call has any effect.
    fn settle(&self, result: ScrapeResult<JobOutput>) -> bool {
        let sender = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            // The submitter may have dropped its ticket; that is not an error
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Flag, fire the token and reject. Returns false if already cancelled.
    fn cancel(&self, reason: &str) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        self.settle(Err(ScrapeError::cancelled(reason.to_string())));
        true
    }
}

struct QueueState {
    queued: VecDeque<Arc<JobRecord>>,
    active: HashMap<JobId, Arc<JobRecord>>,
    paused: bool,
    shut_down: bool,
}

impl QueueState {
    /// Insert after every job of equal or higher priority.
    fn enqueue(&mut self, job: Arc<JobRecord>) {
        let priority = job.priority();
        let position = self
            .queued
            .iter()
            .position(|queued| queued.priority() < priority)
            .unwrap_or(self.queued.len());
        self.queued.insert(position, job);
    }

    /// Insert before every job of equal or lower priority.
    fn enqueue_front_of_band(&mut self, job: Arc<JobRecord>) {
        let priority = job.priority();
        let position = self
            .queued
            .iter()
            .position(|queued| queued.priority() <= priority)
            .unwrap_or(self.queued.len());
        self.queued.insert(position, job);
    }
}

/// Lifetime counters, readable without locking the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

enum Disposition {
    Settle(ScrapeResult<JobOutput>),
    Retry,
    Discard,
}

struct Inner {
    state: Mutex<QueueState>,
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
    concurrency: usize,
    default_max_retries: u32,
    counters: Counters,
}

/// Priority job queue with a concurrency limit and per-user cancellation.
///
/// Dispatch happens inline on submit and on every completion: the queue
/// starts jobs while fewer than `concurrency` are active and never waits for
/// a job to finish. Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queued: VecDeque::new(),
                    active: HashMap::new(),
                    paused: false,
                    shut_down: false,
                }),
                handlers: RwLock::new(HashMap::new()),
                concurrency: config.concurrency.max(1),
                default_max_retries: config.default_max_retries,
                counters: Counters::default(),
            }),
        }
    }

    /// Route jobs of `job_type` to `handler`, replacing any previous one.
    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        info!("Registered '{}' handler for {} jobs", handler.name(), job_type);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type, handler);
    }

    pub fn submit(&self, request: JobRequest) -> JobTicket {
        let job_type = request.kind.job_type();
        let id = JobId::generate(job_type);
        let (tx, rx) = oneshot::channel();
        let ticket = JobTicket::new(id.clone(), rx);

        let job = Arc::new(JobRecord {
            id: id.clone(),
            kind: request.kind,
            user_id: request.user_id,
            max_retries: request.max_retries.unwrap_or(self.inner.default_max_retries),
            priority: AtomicI32::new(request.priority),
            retries: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            token: CancellationToken::new(),
            completion: Mutex::new(Some(tx)),
        });

        {
            let mut state = self.inner.lock_state();
            if state.shut_down {
                drop(state);
                job.cancel("queue is shutting down");
                return ticket;
            }
            state.enqueue(Arc::clone(&job));
            debug!(
                job_id = %id,
                priority = request.priority,
                queued = state.queued.len(),
                "Job submitted"
            );
        }
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

        self.inner.pump();
        ticket
    }

    /// Cancel every queued or active job owned by `user_id`. Other users'
    /// jobs are untouched. Returns how many jobs were cancelled.
    pub fn cancel_for_user(&self, user_id: &str) -> usize {
        // Flag under the lock so an active job cannot settle successfully
        // between selection and cancellation.
        let count = {
            let mut state = self.inner.lock_state();
            let mut targets = Vec::new();
            state.queued.retain(|job| {
                if job.belongs_to(user_id) {
                    targets.push(Arc::clone(job));
                    false
                } else {
                    true
                }
            });
            targets.extend(
                state
                    .active
                    .values()
                    .filter(|job| job.belongs_to(user_id))
                    .cloned(),
            );
            targets
                .iter()
                .filter(|job| job.cancel("superseded by a newer request"))
                .count()
        };

        if count > 0 {
            self.inner
                .counters
                .cancelled
                .fetch_add(count as u64, Ordering::Relaxed);
            info!(user_id = %user_id, "Cancelled {} outstanding jobs", count);
        }
        count
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock_state();
        QueueStats {
            queued: state.queued.len(),
            active: state.active.len(),
            concurrency_limit: self.inner.concurrency,
        }
    }

    pub fn counters(&self) -> QueueCounters {
        let c = &self.inner.counters;
        QueueCounters {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    /// Stop starting new jobs. Active jobs run to completion.
    pub fn pause(&self) {
        self.inner.lock_state().paused = true;
        info!("Job dispatch paused");
    }

    pub fn resume(&self) {
        self.inner.lock_state().paused = false;
        info!("Job dispatch resumed");
        self.inner.pump();
    }

    /// Reject new submissions and cancel everything outstanding.
    pub fn shutdown(&self) -> usize {
        let outstanding: Vec<Arc<JobRecord>> = {
            let mut state = self.inner.lock_state();
            state.shut_down = true;
            let mut jobs: Vec<_> = state.queued.drain(..).collect();
            jobs.extend(state.active.values().cloned());
            jobs
        };

        let count = outstanding
            .iter()
            .filter(|job| job.cancel("queue is shutting down"))
            .count();
        self.inner
            .counters
            .cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
        info!("Job queue shut down, {} outstanding jobs cancelled", count);
        count
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_type)
            .cloned()
    }

    /// Start queued jobs until the concurrency limit is reached.
    fn pump(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.lock_state();
            if state.paused || state.shut_down {
                return;
            }
            while state.active.len() < self.concurrency {
                let Some(job) = state.queued.pop_front() else {
                    break;
                };
                if job.is_cancelled() {
                    continue;
                }
                state.active.insert(job.id.clone(), Arc::clone(&job));
                started.push(job);
            }
        }

        for job in started {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.execute(job).await });
        }
    }

    async fn execute(self: Arc<Self>, job: Arc<JobRecord>) {
        let result = self.run(&job).await;

        let disposition = {
            let mut state = self.lock_state();
            state.active.remove(&job.id);

            if job.is_cancelled() {
                Disposition::Discard
            } else {
                match result {
                    Err(e)
                        if !e.is_cancelled()
                            && !e.is_fatal()
                            && job.retries.load(Ordering::Acquire) < job.max_retries
                            && !state.shut_down =>
                    {
                        let attempt = job.retries.fetch_add(1, Ordering::AcqRel) + 1;
                        let priority = job.priority.fetch_sub(1, Ordering::AcqRel) - 1;
                        warn!(
                            job_id = %job.id,
                            attempt = attempt,
                            max_retries = job.max_retries,
                            priority = priority,
                            "Job failed, retrying: {}",
                            e
                        );
                        state.enqueue_front_of_band(Arc::clone(&job));
                        Disposition::Retry
                    }
                    other => Disposition::Settle(other),
                }
            }
        };

        match disposition {
            Disposition::Settle(result) => {
                match &result {
                    Ok(_) => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        debug!(job_id = %job.id, "Job completed");
                    }
                    Err(e) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(job_id = %job.id, "Job failed: {}", e);
                    }
                }
                job.settle(result);
            }
            Disposition::Retry => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
            }
            Disposition::Discard => {
                debug!(job_id = %job.id, "Discarding result of cancelled job");
            }
        }

        self.pump();
    }

    async fn run(&self, job: &JobRecord) -> ScrapeResult<JobOutput> {
        if job.is_cancelled() {
            return Err(ScrapeError::cancelled(format!("job {} cancelled", job.id)));
        }

        let job_type = job.kind.job_type();
        let handler = self.handler(job_type).ok_or_else(|| {
            ScrapeError::Internal(format!("no handler registered for {}", job_type))
        })?;

        let context = JobContext {
            id: job.id.clone(),
            kind: job.kind.clone(),
            attempt: job.retries.load(Ordering::Acquire),
            user_id: job.user_id.clone(),
        };
        let label = job.id.to_string();
        let handler_name = handler.name().to_string();
        debug!(
            job_id = %job.id,
            handler = %handler_name,
            attempt = context.attempt,
            "Job started"
        );

        // Own task so a panic surfaces as a JoinError instead of leaving the
        // job active forever. On cancellation the task is detached, not
        // aborted: the handler sees its token and releases what it holds.
        let task = tokio::spawn({
            let token = job.token.clone();
            async move { handler.handle(&context, token).await }
        });
        let result = async {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    error!(job_id = %job.id, handler = %handler_name, "Job handler panicked");
                    Err(ScrapeError::Internal(format!(
                        "{} handler panicked",
                        handler_name
                    )))
                }
                Err(e) => Err(ScrapeError::Internal(format!(
                    "{} handler task failed: {}",
                    handler_name, e
                ))),
            }
        }
        .with_cancellation(&job.token, &label)
        .await;

        if job.is_cancelled() {
            return Err(ScrapeError::cancelled(format!("job {} cancelled", job.id)));
        }
        result
    }
}
