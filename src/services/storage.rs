use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use image::ImageFormat;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use sqlx::PgPool;

use crate::db::queries;
use crate::models::job::{GenerationSpec, JobId};
use crate::models::result::{NewResultRecord, ResultRecord};

/// Object storage for generated image bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;
}

/// Table of completed generations.
#[async_trait]
pub trait ResultTable: Send + Sync {
    async fn insert(&self, record: NewResultRecord) -> Result<ResultRecord, StorageError>;

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<ResultRecord>, StorageError>;
}

/// Where a finished generation ends up.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub path: String,
    pub record: ResultRecord,
}

/// Stores a successful generation: bytes to object storage, then a result row.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn store(
        &self,
        owner: &str,
        job_id: JobId,
        spec: &GenerationSpec,
        image: &[u8],
    ) -> Result<StoredResult, StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        Ok(response.to_vec())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.bucket.delete_object(key).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for R2Client {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        Ok(())
    }
}

/// Result rows in the `user_images` table.
pub struct PgResultTable {
    pool: PgPool,
}

impl PgResultTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultTable for PgResultTable {
    async fn insert(&self, record: NewResultRecord) -> Result<ResultRecord, StorageError> {
        Ok(queries::insert_result(&self.pool, &record).await?)
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<ResultRecord>, StorageError> {
        Ok(queries::find_result_by_job(&self.pool, job_id).await?)
    }
}

/// Default sink: object store upload followed by a result row insert.
pub struct ResultSink {
    objects: Arc<dyn ObjectStore>,
    results: Arc<dyn ResultTable>,
}

impl ResultSink {
    pub fn new(objects: Arc<dyn ObjectStore>, results: Arc<dyn ResultTable>) -> Self {
        Self { objects, results }
    }
}

#[async_trait]
impl PersistenceSink for ResultSink {
    async fn store(
        &self,
        owner: &str,
        job_id: JobId,
        spec: &GenerationSpec,
        image: &[u8],
    ) -> Result<StoredResult, StorageError> {
        let format = sniff_format(image);
        let path = object_path(owner, job_id, format);

        self.objects
            .upload(&path, image, format.to_mime_type())
            .await?;
        tracing::debug!(job_id = %job_id, path = %path, bytes = image.len(), "Image uploaded");

        let record = self
            .results
            .insert(NewResultRecord::from_spec(job_id, owner, &path, spec))
            .await?;

        Ok(StoredResult { path, record })
    }
}

/// Detected image format, PNG when the bytes are not recognised.
pub fn sniff_format(image: &[u8]) -> ImageFormat {
    image::guess_format(image).unwrap_or(ImageFormat::Png)
}

/// `{owner}/{unix_millis}-{job_id}.{ext}`
pub fn object_path(owner: &str, job_id: JobId, format: ImageFormat) -> String {
    let extension = format.extensions_str().first().copied().unwrap_or("png");
    format!(
        "{}/{}-{}.{}",
        owner,
        Utc::now().timestamp_millis(),
        job_id,
        extension
    )
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Result table error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Other(String),
}
