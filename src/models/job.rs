use std::fmt;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::model_config::Quality;

/// Largest seed accepted. Seeds are stored in a signed 64-bit column.
pub const MAX_SEED: u64 = i64::MAX as u64;

/// Client-generated identifier of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a generation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoCredentialAvailable,
    UpstreamError,
    InvalidOutput,
    InvalidModel,
    PersistenceError,
    GenerationTimedOut,
}

impl FailureKind {
    /// Whether the reserved credit goes back to the user.
    ///
    /// Only generation-side failures refund; once the upstream produced an
    /// image the compute has been spent.
    pub fn refunds_credit(&self) -> bool {
        !matches!(self, FailureKind::PersistenceError)
    }
}

/// Generation parameters captured at enqueue time. Immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct GenerationSpec {
    /// Fully resolved prompt, model suffix included.
    #[garde(length(min = 1, max = 4000))]
    pub prompt: String,

    #[garde(skip)]
    pub negative_prompt: Option<String>,

    #[garde(range(min = 16, max = 4096))]
    pub width: u32,

    #[garde(range(min = 16, max = 4096))]
    pub height: u32,

    #[garde(length(min = 1, max = 100))]
    pub model: String,

    #[garde(skip)]
    pub quality: Quality,

    #[garde(range(max = MAX_SEED))]
    pub seed: u64,

    #[garde(length(min = 1, max = 16))]
    pub aspect_ratio: String,

    #[garde(skip)]
    pub is_private: bool,
}

/// One queued image generation and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationJob {
    pub id: JobId,
    pub spec: GenerationSpec,
    pub status: JobStatus,
    pub retry_count: u32,
    pub retry_reason: Option<String>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn new(spec: GenerationSpec) -> Self {
        Self {
            id: JobId::new(),
            spec,
            status: JobStatus::Pending,
            retry_count: 0,
            retry_reason: None,
            result_ref: None,
            error: None,
            failure: None,
            created_at: Utc::now(),
        }
    }
}
