//! In-memory collaborators for driving a queue without Postgres, Redis, R2 or
//! the inference API.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

use image_gen_queue::models::job::{GenerationJob, GenerationSpec, JobId};
use image_gen_queue::models::model_config::{ModelRegistry, Quality};
use image_gen_queue::models::result::{NewResultRecord, ResultRecord};
use image_gen_queue::services::credentials::{CredentialRotator, MemoryCredentialStore};
use image_gen_queue::services::credits::MemoryCreditLedger;
use image_gen_queue::services::inference::{
    DispatchError, Dispatcher, InferenceClient, InferenceRequest, InferenceResponse,
    RetryObserver, RetryProgress,
};
use image_gen_queue::services::kv::MemoryKvStore;
use image_gen_queue::services::queue::{GenerationQueue, QueueServices, QueueSettings};
use image_gen_queue::services::storage::{
    ObjectStore, ResultSink, ResultTable, StorageError,
};

pub const OWNER: &str = "user-1";

/// Smallest byte string `image::guess_format` recognises as PNG.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

/// What the scripted endpoint answers with.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Image,
    Status(u16),
    EmptyBody,
    Hang,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub url: String,
    pub api_key: String,
    pub request: InferenceRequest,
}

/// Inference endpoint that plays back a script, then answers with an image.
#[derive(Default)]
pub struct ScriptedInference {
    script: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call waits for a permit from `gate` before answering.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn push_n(&self, reply: Reply, n: usize) {
        for _ in 0..n {
            self.push(reply);
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn post(
        &self,
        url: &Url,
        api_key: &str,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, DispatchError> {
        self.calls.lock().unwrap().push(RecordedCall {
            at: Instant::now(),
            url: url.to_string(),
            api_key: api_key.to_string(),
            request: request.clone(),
        });

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Image);
        match reply {
            Reply::Image => Ok(InferenceResponse {
                status: 200,
                body: PNG_BYTES.to_vec(),
            }),
            Reply::Status(status) => Ok(InferenceResponse {
                status,
                body: format!(r#"{{"error": "scripted {}"}}"#, status).into_bytes(),
            }),
            Reply::EmptyBody => Ok(InferenceResponse {
                status: 200,
                body: Vec::new(),
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Object store keeping uploads in a map. Uploads fail while `failing` is set.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<bool>,
}

impl MemoryObjectStore {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        if *self.failing.lock().unwrap() {
            return Err(StorageError::Other("bucket unavailable".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryResultTable {
    rows: Mutex<Vec<ResultRecord>>,
}

impl MemoryResultTable {
    pub fn rows(&self) -> Vec<ResultRecord> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultTable for MemoryResultTable {
    async fn insert(&self, record: NewResultRecord) -> Result<ResultRecord, StorageError> {
        let row = ResultRecord {
            id: Uuid::new_v4(),
            record,
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<ResultRecord>, StorageError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.record.job_id == job_id)
            .cloned())
    }
}

/// Retry observer that keeps every notification.
#[derive(Default)]
pub struct RecordingObserver {
    pub progress: Mutex<Vec<RetryProgress>>,
}

#[async_trait]
impl RetryObserver for RecordingObserver {
    async fn on_retry(&self, progress: RetryProgress) {
        self.progress.lock().unwrap().push(progress);
    }
}

/// Everything a queue under test talks to, kept so tests can inspect it.
pub struct Harness {
    pub inference: Arc<ScriptedInference>,
    pub ledger: Arc<MemoryCreditLedger>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub results: Arc<MemoryResultTable>,
    pub kv: Arc<MemoryKvStore>,
}

impl Harness {
    pub fn new(credits: u32) -> Self {
        Self::with_inference(credits, ScriptedInference::new())
    }

    pub fn with_inference(credits: u32, inference: ScriptedInference) -> Self {
        Self {
            inference: Arc::new(inference),
            ledger: Arc::new(MemoryCreditLedger::with_balance(OWNER, credits)),
            credentials: Arc::new(MemoryCredentialStore::from_keys(["hf_key_a", "hf_key_b"])),
            objects: Arc::new(MemoryObjectStore::default()),
            results: Arc::new(MemoryResultTable::default()),
            kv: Arc::new(MemoryKvStore::new()),
        }
    }

    pub fn without_credentials(mut self) -> Self {
        self.credentials = Arc::new(MemoryCredentialStore::default());
        self
    }

    pub fn services(&self) -> QueueServices {
        QueueServices {
            registry: Arc::new(ModelRegistry::builtin().unwrap()),
            ledger: self.ledger.clone(),
            credentials: CredentialRotator::new(self.credentials.clone()),
            dispatcher: Arc::new(Dispatcher::new(self.inference.clone())),
            sink: Arc::new(ResultSink::new(self.objects.clone(), self.results.clone())),
            kv: self.kv.clone(),
        }
    }

    pub async fn open(&self) -> GenerationQueue {
        self.open_with(QueueSettings::for_owner(OWNER)).await
    }

    pub async fn open_with(&self, settings: QueueSettings) -> GenerationQueue {
        GenerationQueue::open(self.services(), settings).await.unwrap()
    }

    pub fn balance(&self) -> u32 {
        self.ledger.balance(OWNER)
    }
}

/// A valid HD spec for `model`.
pub fn spec(model: &str, prompt: &str) -> GenerationSpec {
    GenerationSpec {
        prompt: prompt.to_string(),
        negative_prompt: None,
        width: 1024,
        height: 1024,
        model: model.to_string(),
        quality: Quality::Hd,
        seed: 42,
        aspect_ratio: "1:1".to_string(),
        is_private: false,
    }
}

/// Poll the queue until `predicate` holds for its job list. Panics after
/// `limit` of (possibly paused) time.
pub async fn wait_until<F>(queue: &GenerationQueue, limit: Duration, predicate: F) -> Vec<GenerationJob>
where
    F: Fn(&[GenerationJob]) -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        let jobs = queue.snapshot().await;
        if predicate(&jobs) {
            return jobs;
        }
        if Instant::now() >= deadline {
            panic!("condition not reached within {:?}; jobs: {:#?}", limit, jobs);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait until every job is completed or failed.
pub async fn wait_idle(queue: &GenerationQueue, limit: Duration) -> Vec<GenerationJob> {
    wait_until(queue, limit, |jobs| jobs.iter().all(|j| j.status.is_terminal())).await
}
