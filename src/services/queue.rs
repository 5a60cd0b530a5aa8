//! Single-flight generation queue.
//!
//! The queue owns its job list. At most one job is `processing` at a time;
//! every enqueue, completion, failure and cancellation ends with a `drain`
//! step that starts the oldest `pending` job when nothing is running. All
//! list mutations happen under one async mutex and are persisted to the
//! key-value store before subscribers are notified, so the serialized list is
//! the durable record of in-flight work.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use garde::Validate;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::models::job::{FailureKind, GenerationJob, GenerationSpec, JobId, JobStatus};
use crate::models::model_config::{ModelConfig, ModelRegistry, Quality};
use crate::models::request::{GenerationRequest, RequestError};
use crate::services::credentials::CredentialRotator;
use crate::services::credits::{CreditError, CreditLedger};
use crate::services::inference::{DispatchError, Dispatcher, RetryObserver, RetryProgress};
use crate::services::kv::{KvError, KvStore};
use crate::services::storage::PersistenceSink;

/// Wall-clock budget for one job once it starts processing.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Key prefix of persisted job lists; the owner follows it.
pub const STORAGE_KEY_PREFIX: &str = "generation_queue:";

/// Collaborators a queue drives.
#[derive(Clone)]
pub struct QueueServices {
    pub registry: Arc<ModelRegistry>,
    pub ledger: Arc<dyn CreditLedger>,
    pub credentials: CredentialRotator,
    pub dispatcher: Arc<Dispatcher>,
    pub sink: Arc<dyn PersistenceSink>,
    pub kv: Arc<dyn KvStore>,
}

/// Per-instance settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// User the queue generates for; charged for and owns the results.
    pub owner: String,
    /// Key under which the job list is persisted.
    pub storage_key: String,
    pub job_timeout: Duration,
}

impl QueueSettings {
    pub fn for_owner(owner: impl Into<String>) -> Self {
        let owner = owner.into();
        Self {
            storage_key: format!("{}{}", STORAGE_KEY_PREFIX, owner),
            owner,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

pub type SubscriptionId = u64;

type Subscriber = Arc<dyn Fn(&[GenerationJob]) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: SubscriptionId,
    callbacks: BTreeMap<SubscriptionId, Subscriber>,
}

struct InFlight {
    job_id: JobId,
    handle: AbortHandle,
    started: Instant,
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<GenerationJob>,
    in_flight: Option<InFlight>,
}

enum JobOutcome {
    Completed { path: String },
    Failed { kind: FailureKind, message: String },
}

struct QueueInner {
    services: QueueServices,
    settings: QueueSettings,
    state: Mutex<QueueState>,
    subscribers: StdMutex<Subscribers>,
    /// This queue's share of the process-wide depth gauge.
    reported_depth: AtomicUsize,
}

/// Handle to a queue instance. Clones share the same queue.
#[derive(Clone)]
pub struct GenerationQueue {
    inner: Arc<QueueInner>,
}

impl GenerationQueue {
    /// Open the queue, restoring any persisted job list.
    ///
    /// Jobs left `processing` by a previous run are put back to `pending`
    /// in place; their credit is still reserved.
    pub async fn open(services: QueueServices, settings: QueueSettings) -> Result<Self, QueueError> {
        let mut jobs = match services.kv.get(&settings.storage_key).await? {
            Some(json) => serde_json::from_str::<Vec<GenerationJob>>(&json).unwrap_or_else(|e| {
                tracing::warn!(
                    key = %settings.storage_key,
                    error = %e,
                    "Discarding unreadable persisted queue state"
                );
                Vec::new()
            }),
            None => Vec::new(),
        };

        let mut requeued = 0;
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Processing) {
            job.status = JobStatus::Pending;
            job.retry_count = 0;
            job.retry_reason = None;
            requeued += 1;
        }

        tracing::info!(
            owner = %settings.owner,
            restored = jobs.len(),
            requeued,
            "Generation queue opened"
        );

        let queue = Self {
            inner: Arc::new(QueueInner {
                services,
                settings,
                state: Mutex::new(QueueState {
                    jobs,
                    in_flight: None,
                }),
                subscribers: StdMutex::new(Subscribers::default()),
                reported_depth: AtomicUsize::new(0),
            }),
        };

        {
            let mut state = queue.inner.state.lock().await;
            if requeued > 0 {
                queue.commit(&state).await;
            }
            queue.drain(&mut state).await;
        }

        Ok(queue)
    }

    /// Admit one job. Charges credit before the job is added; nothing is
    /// added when the charge fails.
    pub async fn enqueue(&self, spec: GenerationSpec) -> Result<JobId, QueueError> {
        let model = self.model(&spec.model)?;
        if !model.supports(spec.quality) {
            return Err(RequestError::UnsupportedQuality {
                model: model.key.clone(),
                quality: spec.quality,
            }
            .into());
        }
        spec.validate().map_err(RequestError::from)?;

        self.reserve(spec.quality, 1).await?;

        let job = GenerationJob::new(spec);
        let job_id = job.id;
        self.admit(vec![job]).await;
        Ok(job_id)
    }

    /// Expand a request into one job per image and admit them together.
    pub async fn enqueue_request(&self, request: &GenerationRequest) -> Result<Vec<JobId>, QueueError> {
        let model = self.model(&request.model)?;
        let specs = request.expand(model)?;

        self.reserve(request.quality, specs.len() as u32).await?;

        let jobs: Vec<GenerationJob> = specs.into_iter().map(GenerationJob::new).collect();
        let ids = jobs.iter().map(|j| j.id).collect();
        self.admit(jobs).await;
        Ok(ids)
    }

    /// Remove a job whatever its status. Pending and processing jobs get
    /// their credit back. Returns `false` when the job is unknown.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let refund = {
            let mut state = self.inner.state.lock().await;
            let Some(position) = state.jobs.iter().position(|j| j.id == job_id) else {
                return false;
            };
            let job = state.jobs.remove(position);

            if state.in_flight.as_ref().is_some_and(|f| f.job_id == job_id) {
                if let Some(in_flight) = state.in_flight.take() {
                    in_flight.handle.abort();
                }
            }

            tracing::info!(job_id = %job_id, status = ?job.status, "Generation job cancelled");
            metrics::counter!("generation_jobs_cancelled").increment(1);

            self.commit(&state).await;
            self.drain(&mut state).await;

            matches!(job.status, JobStatus::Pending | JobStatus::Processing)
                .then_some(job.spec.quality)
        };

        if let Some(quality) = refund {
            self.refund(job_id, quality).await;
        }
        true
    }

    /// Register an observer called with the full job list after every
    /// mutation. Callbacks run while the queue is locked and must not call
    /// back into the queue.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&[GenerationJob]) + Send + Sync + 'static,
    {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.callbacks.insert(id, Arc::new(callback));
        id
    }

    /// Returns whether the subscription was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .remove(&id)
            .is_some()
    }

    /// True when no job is waiting or running and no other handle to this
    /// queue exists, so it can be dropped and reopened from persisted state.
    pub async fn is_evictable(&self) -> bool {
        if Arc::strong_count(&self.inner) > 1 {
            return false;
        }
        let state = self.inner.state.lock().await;
        state.in_flight.is_none() && state.jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Current job list in enqueue order.
    pub async fn snapshot(&self) -> Vec<GenerationJob> {
        self.inner.state.lock().await.jobs.clone()
    }

    pub async fn get(&self, job_id: JobId) -> Option<GenerationJob> {
        let state = self.inner.state.lock().await;
        state.jobs.iter().find(|j| j.id == job_id).cloned()
    }

    fn model(&self, key: &str) -> Result<&ModelConfig, QueueError> {
        self.inner
            .services
            .registry
            .get(key)
            .ok_or_else(|| QueueError::InvalidModel(key.to_string()))
    }

    async fn reserve(&self, quality: Quality, count: u32) -> Result<(), QueueError> {
        self.inner
            .services
            .ledger
            .reserve(&self.inner.settings.owner, quality, count)
            .await
            .map_err(|e| match e {
                CreditError::Insufficient { required } => QueueError::InsufficientCredits { required },
                other => QueueError::Ledger(other),
            })
    }

    async fn refund(&self, job_id: JobId, quality: Quality) {
        let owner = &self.inner.settings.owner;
        if let Err(e) = self.inner.services.ledger.refund(owner, quality, 1).await {
            tracing::error!(job_id = %job_id, owner = %owner, error = %e, "Credit refund failed");
        }
    }

    async fn admit(&self, jobs: Vec<GenerationJob>) {
        let mut state = self.inner.state.lock().await;
        for job in jobs {
            tracing::info!(
                job_id = %job.id,
                model = %job.spec.model,
                quality = %job.spec.quality,
                width = job.spec.width,
                height = job.spec.height,
                "Generation job queued"
            );
            metrics::counter!("generation_jobs_total").increment(1);
            state.jobs.push(job);
        }
        self.commit(&state).await;
        self.drain(&mut state).await;
    }

    /// Start the oldest pending job if nothing is processing.
    async fn drain(&self, state: &mut QueueState) {
        if state.jobs.iter().any(|j| j.status == JobStatus::Processing) {
            return;
        }
        let Some(job) = state.jobs.iter_mut().find(|j| j.status == JobStatus::Pending) else {
            return;
        };

        job.status = JobStatus::Processing;
        job.retry_count = 0;
        job.retry_reason = None;
        let job_id = job.id;
        let spec = job.spec.clone();

        tracing::info!(job_id = %job_id, model = %spec.model, "Generation job started");
        self.commit(state).await;

        let handle = self.spawn_job(job_id, spec);
        state.in_flight = Some(InFlight {
            job_id,
            handle,
            started: Instant::now(),
        });
    }

    fn spawn_job(&self, job_id: JobId, spec: GenerationSpec) -> AbortHandle {
        let queue = self.clone();
        let task: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(async move { queue.run_job(job_id, spec).await });
        tokio::spawn(task).abort_handle()
    }

    async fn run_job(self, job_id: JobId, spec: GenerationSpec) {
        let timeout = self.inner.settings.job_timeout;
        let outcome = match tokio::time::timeout(timeout, self.execute(job_id, &spec)).await {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::Failed {
                kind: FailureKind::GenerationTimedOut,
                message: format!("Generation timed out after {}s", timeout.as_secs()),
            },
        };
        self.finish(job_id, outcome).await;
    }

    async fn execute(&self, job_id: JobId, spec: &GenerationSpec) -> JobOutcome {
        let services = &self.inner.services;

        let Some(model) = services.registry.get(&spec.model) else {
            return JobOutcome::Failed {
                kind: FailureKind::InvalidModel,
                message: format!("Unknown model: {}", spec.model),
            };
        };

        let credential = match services.credentials.acquire().await {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "No usable API credential");
                let kind = FailureKind::NoCredentialAvailable;
                return JobOutcome::Failed {
                    kind,
                    message: kind.to_string(),
                };
            }
        };

        let observer = JobRetryObserver {
            queue: self.clone(),
            job_id,
        };
        let image = match services.dispatcher.run(model, spec, &credential, &observer).await {
            Ok(image) => image,
            Err(e) => {
                let kind = match e {
                    DispatchError::InvalidOutput => FailureKind::InvalidOutput,
                    _ => FailureKind::UpstreamError,
                };
                return JobOutcome::Failed {
                    kind,
                    message: e.to_string(),
                };
            }
        };

        match services
            .sink
            .store(&self.inner.settings.owner, job_id, spec, &image)
            .await
        {
            Ok(stored) => JobOutcome::Completed { path: stored.path },
            Err(e) => JobOutcome::Failed {
                kind: FailureKind::PersistenceError,
                message: e.to_string(),
            },
        }
    }

    /// Record a terminal outcome, then move on to the next job. Outcomes for
    /// jobs that were cancelled or already finished are dropped.
    async fn finish(&self, job_id: JobId, outcome: JobOutcome) {
        let refund = {
            let mut state = self.inner.state.lock().await;

            if state.in_flight.as_ref().is_some_and(|f| f.job_id == job_id) {
                if let Some(in_flight) = state.in_flight.take() {
                    metrics::histogram!("generation_processing_seconds")
                        .record(in_flight.started.elapsed().as_secs_f64());
                }
            }

            let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
                tracing::debug!(job_id = %job_id, "Outcome for job no longer queued, ignoring");
                return;
            };
            if job.status != JobStatus::Processing {
                tracing::debug!(job_id = %job_id, status = ?job.status, "Outcome for finished job, ignoring");
                return;
            }

            let refund = match outcome {
                JobOutcome::Completed { path } => {
                    tracing::info!(job_id = %job_id, path = %path, retry_count = job.retry_count, "Generation job completed");
                    metrics::counter!("generation_jobs_completed").increment(1);
                    job.status = JobStatus::Completed;
                    job.result_ref = Some(path);
                    None
                }
                JobOutcome::Failed { kind, message } => {
                    tracing::error!(
                        job_id = %job_id,
                        failure = %kind,
                        retry_count = job.retry_count,
                        error = %message,
                        "Generation job failed"
                    );
                    metrics::counter!("generation_jobs_failed").increment(1);
                    job.status = JobStatus::Failed;
                    job.error = Some(message);
                    job.failure = Some(kind);
                    kind.refunds_credit().then_some(job.spec.quality)
                }
            };

            self.commit(&state).await;
            self.drain(&mut state).await;
            refund
        };

        if let Some(quality) = refund {
            self.refund(job_id, quality).await;
        }
    }

    async fn apply_retry(&self, job_id: JobId, progress: RetryProgress) {
        let mut state = self.inner.state.lock().await;
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
            tracing::debug!(job_id = %job_id, "Retry progress for job no longer queued");
            return;
        };
        if job.status != JobStatus::Processing {
            tracing::debug!(job_id = %job_id, status = ?job.status, "Retry progress for job not processing");
            return;
        }

        job.retry_count = progress.retry_count;
        job.retry_reason = Some(progress.reason);
        self.commit(&state).await;
    }

    /// Persist then notify.
    async fn commit(&self, state: &QueueState) {
        self.persist(&state.jobs).await;
        self.notify(&state.jobs);
    }

    async fn persist(&self, jobs: &[GenerationJob]) {
        let pending = jobs.iter().filter(|j| j.status == JobStatus::Pending).count();
        self.report_depth(pending);

        let json = match serde_json::to_string(jobs) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize queue state");
                return;
            }
        };

        let key = &self.inner.settings.storage_key;
        if let Err(e) = self.inner.services.kv.set(key, &json).await {
            tracing::error!(key = %key, error = %e, "Failed to persist queue state");
        }
    }

    /// Move the shared depth gauge by the change in this queue's pending
    /// count, so the gauge holds the sum over all open queues.
    fn report_depth(&self, pending: usize) -> f64 {
        let previous = self.inner.reported_depth.swap(pending, Ordering::Relaxed);
        let delta = pending as f64 - previous as f64;
        if delta != 0.0 {
            metrics::gauge!("generation_queue_depth").increment(delta);
        }
        delta
    }

    fn notify(&self, jobs: &[GenerationJob]) {
        let callbacks: Vec<Subscriber> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .values()
            .cloned()
            .collect();

        for callback in callbacks {
            callback(jobs);
        }
    }
}

/// Feeds dispatcher retry progress back into the job record.
struct JobRetryObserver {
    queue: GenerationQueue,
    job_id: JobId,
}

#[async_trait]
impl RetryObserver for JobRetryObserver {
    async fn on_retry(&self, progress: RetryProgress) {
        self.queue.apply_retry(self.job_id, progress).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Insufficient credits: {required} required")]
    InsufficientCredits { required: u32 },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Credit ledger unavailable: {0}")]
    Ledger(CreditError),

    #[error("Queue state store error: {0}")]
    Persistence(#[from] KvError),
}
