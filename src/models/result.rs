use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{GenerationSpec, JobId};
use crate::models::model_config::Quality;

/// Row written to the result table once a generated image is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewResultRecord {
    pub job_id: JobId,
    pub user_id: String,
    pub storage_path: String,
    pub prompt: String,
    pub seed: u64,
    pub width: u32,
    pub height: u32,
    pub model: String,
    pub quality: Quality,
    pub aspect_ratio: String,
    pub is_private: bool,
}

impl NewResultRecord {
    pub fn from_spec(job_id: JobId, user_id: &str, storage_path: &str, spec: &GenerationSpec) -> Self {
        Self {
            job_id,
            user_id: user_id.to_string(),
            storage_path: storage_path.to_string(),
            prompt: spec.prompt.clone(),
            seed: spec.seed,
            width: spec.width,
            height: spec.height,
            model: spec.model.clone(),
            quality: spec.quality,
            aspect_ratio: spec.aspect_ratio.clone(),
            is_private: spec.is_private,
        }
    }
}

/// A stored result row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: NewResultRecord,
    pub created_at: DateTime<Utc>,
}
