use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::credential::Credential;

/// Backing store of upstream credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The active credential with the oldest `last_used_at` (never used first).
    async fn least_recently_used(&self) -> Result<Option<Credential>, CredentialError>;

    async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CredentialError>;
}

/// Spreads inference calls across credentials by least-recent use.
///
/// The read-then-write is not atomic across processes: two queue instances
/// may occasionally hand out the same credential.
#[derive(Clone)]
pub struct CredentialRotator {
    store: Arc<dyn CredentialStore>,
}

impl CredentialRotator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn acquire(&self) -> Result<Credential, CredentialError> {
        let mut credential = self
            .store
            .least_recently_used()
            .await?
            .ok_or(CredentialError::NoCredentialAvailable)?;

        let now = Utc::now();
        if let Err(e) = self.store.mark_used(credential.id, now).await {
            tracing::warn!(
                credential_id = %credential.id,
                error = %e,
                "Failed to record credential usage"
            );
        } else {
            credential.last_used_at = Some(now);
        }

        tracing::debug!(credential_id = %credential.id, "Credential acquired");
        Ok(credential)
    }
}

/// Credentials held in the `api_credentials` table.
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn least_recently_used(&self) -> Result<Option<Credential>, CredentialError> {
        Ok(queries::least_recently_used_credential(&self.pool).await?)
    }

    async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CredentialError> {
        Ok(queries::touch_credential(&self.pool, id, at).await?)
    }
}

/// Process-local credential list.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<Vec<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials: Mutex::new(credentials),
        }
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(keys.into_iter().map(Credential::new).collect())
    }

    pub fn credentials(&self) -> Vec<Credential> {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn least_recently_used(&self) -> Result<Option<Credential>, CredentialError> {
        let credentials = self.credentials.lock().unwrap_or_else(PoisonError::into_inner);
        // Option orders None before Some, so never-used keys come first.
        Ok(credentials
            .iter()
            .filter(|c| c.is_active)
            .min_by_key(|c| c.last_used_at)
            .cloned())
    }

    async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), CredentialError> {
        let mut credentials = self.credentials.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(credential) = credentials.iter_mut().find(|c| c.id == id) {
            credential.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("NoCredentialAvailable: no active API credential")]
    NoCredentialAvailable,

    #[error("Credential store error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rotates_through_all_keys() {
        let store = Arc::new(MemoryCredentialStore::from_keys(["key-a", "key-b", "key-c"]));
        let rotator = CredentialRotator::new(store.clone());

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rotator.acquire().await.unwrap().api_key);
            // Distinct timestamps so ordering is strict.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        seen.sort();
        assert_eq!(seen, vec!["key-a", "key-b", "key-c"]);

        let next = rotator.acquire().await.unwrap();
        assert_eq!(next.api_key, "key-a");
    }

    #[tokio::test]
    async fn test_inactive_keys_skipped() {
        let mut inactive = Credential::new("inactive");
        inactive.is_active = false;
        let store = Arc::new(MemoryCredentialStore::new(vec![inactive, Credential::new("active")]));
        let rotator = CredentialRotator::new(store);

        for _ in 0..3 {
            assert_eq!(rotator.acquire().await.unwrap().api_key, "active");
        }
    }

    #[tokio::test]
    async fn test_no_active_credential() {
        let store = Arc::new(MemoryCredentialStore::default());
        let rotator = CredentialRotator::new(store);

        let err = rotator.acquire().await.unwrap_err();
        assert!(matches!(err, CredentialError::NoCredentialAvailable));
    }

    #[test]
    fn test_debug_masks_api_key() {
        let credential = Credential::new("hf_supersecret");
        let debug = format!("{:?}", credential);
        assert!(debug.contains("hf_s***"));
        assert!(!debug.contains("supersecret"));
    }
}
