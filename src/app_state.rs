use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::services::kv::KvStore;
use crate::services::queue::{
    GenerationQueue, QueueError, QueueServices, QueueSettings, STORAGE_KEY_PREFIX,
};
use crate::services::storage::ResultTable;

/// One queue per user, opened lazily from persisted state on first use.
pub struct QueueDirectory {
    services: QueueServices,
    job_timeout: Duration,
    queues: Mutex<HashMap<String, GenerationQueue>>,
}

impl QueueDirectory {
    pub fn new(services: QueueServices, job_timeout: Duration) -> Self {
        Self {
            services,
            job_timeout,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub async fn for_user(&self, user_id: &str) -> Result<GenerationQueue, QueueError> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(user_id) {
            return Ok(queue.clone());
        }

        let settings = QueueSettings::for_owner(user_id).with_job_timeout(self.job_timeout);
        let queue = GenerationQueue::open(self.services.clone(), settings).await?;
        queues.insert(user_id.to_string(), queue.clone());
        Ok(queue)
    }

    /// Open every queue with persisted state so interrupted work resumes
    /// without waiting for its owner to come back. Returns how many were opened.
    pub async fn resume_persisted(&self) -> Result<usize, QueueError> {
        let keys = self.services.kv.keys(STORAGE_KEY_PREFIX).await?;
        let mut opened = 0;
        for key in keys {
            let Some(owner) = key.strip_prefix(STORAGE_KEY_PREFIX) else {
                continue;
            };
            if owner.is_empty() {
                continue;
            }
            self.for_user(owner).await?;
            opened += 1;
        }
        tracing::info!(queues = opened, "Persisted queues resumed");
        Ok(opened)
    }

    /// Drop queues with nothing waiting or running that no request holds.
    /// Their state stays persisted and is reopened on next use.
    pub async fn evict_idle(&self) -> usize {
        let mut queues = self.queues.lock().await;
        let mut idle = Vec::new();
        for (owner, queue) in queues.iter() {
            if queue.is_evictable().await {
                idle.push(owner.clone());
            }
        }
        for owner in &idle {
            queues.remove(owner);
        }
        if !idle.is_empty() {
            tracing::debug!(evicted = idle.len(), open = queues.len(), "Idle queues evicted");
        }
        idle.len()
    }

    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.services.kv
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queues: Arc<QueueDirectory>,
    pub results: Arc<dyn ResultTable>,
    pub jwt_secret: Arc<str>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queues: QueueDirectory,
        results: Arc<dyn ResultTable>,
        jwt_secret: &str,
    ) -> Self {
        Self {
            db,
            queues: Arc::new(queues),
            results,
            jwt_secret: Arc::from(jwt_secret),
        }
    }
}
