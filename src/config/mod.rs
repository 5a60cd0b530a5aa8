use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string (credentials, credits, result rows)
    pub database_url: String,

    /// Redis connection string for queue state. Falls back to files under
    /// `state_dir` when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// HS256 secret used to verify caller JWTs
    pub jwt_secret: String,

    /// JSON file replacing the built-in model registry
    #[serde(default)]
    pub model_registry_path: Option<String>,

    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_state_dir() -> String {
    "./queue-state".to_string()
}

fn default_job_timeout_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}
