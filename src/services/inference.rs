use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::models::credential::Credential;
use crate::models::job::GenerationSpec;
use crate::models::model_config::ModelConfig;
use crate::services::retry::RetryPolicy;

/// JSON body accepted by the hosted text-to-image endpoints.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InferenceRequest {
    pub inputs: String,
    pub parameters: InferenceParameters,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InferenceParameters {
    pub seed: u64,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

impl InferenceRequest {
    /// Shape the request body for a model. Guidance and negative prompt are
    /// only sent to models configured to use them.
    pub fn build(model: &ModelConfig, spec: &GenerationSpec) -> Self {
        let negative_prompt = model
            .negative_prompt
            .as_ref()
            .map(|default| spec.negative_prompt.clone().unwrap_or_else(|| default.clone()));

        Self {
            inputs: spec.prompt.clone(),
            parameters: InferenceParameters {
                seed: spec.seed,
                width: spec.width,
                height: spec.height,
                num_inference_steps: model.steps,
                guidance_scale: model.guidance_scale,
                negative_prompt,
            },
        }
    }
}

/// Raw upstream reply: status plus body bytes (image on 2xx, JSON error otherwise).
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl InferenceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    error: String,
}

/// Transport to an inference endpoint. One call, no retries.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn post(
        &self,
        url: &Url,
        api_key: &str,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, DispatchError>;
}

/// Inference over HTTPS with bearer authentication.
pub struct HttpInferenceClient {
    http: Client,
}

impl HttpInferenceClient {
    pub fn new() -> Result<Self, DispatchError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("image-gen-queue/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn post(
        &self,
        url: &Url,
        api_key: &str,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, DispatchError> {
        let response = self
            .http
            .post(url.clone())
            .bearer_auth(api_key)
            .header("x-wait-for-model", "true")
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();

        Ok(InferenceResponse { status, body })
    }
}

/// Retry progress reported while a job is still processing.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryProgress {
    pub retry_count: u32,
    pub reason: String,
    pub status: u16,
    pub delay: Duration,
}

#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn on_retry(&self, progress: RetryProgress);
}

/// Observer that drops every notification.
pub struct IgnoreRetries;

#[async_trait]
impl RetryObserver for IgnoreRetries {
    async fn on_retry(&self, _progress: RetryProgress) {}
}

/// Runs one generation against the upstream endpoint, retrying transient
/// statuses per `RetryPolicy`.
pub struct Dispatcher {
    client: Arc<dyn InferenceClient>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn InferenceClient>) -> Self {
        Self {
            client,
            policy: RetryPolicy::default(),
        }
    }

    pub async fn run(
        &self,
        model: &ModelConfig,
        spec: &GenerationSpec,
        credential: &Credential,
        observer: &dyn RetryObserver,
    ) -> Result<Vec<u8>, DispatchError> {
        let request = InferenceRequest::build(model, spec);
        let mut retry_count = 0;

        loop {
            let response = self
                .client
                .post(&model.api_url, &credential.api_key, &request)
                .await?;

            if response.is_success() {
                if response.body.is_empty() {
                    return Err(DispatchError::InvalidOutput);
                }
                return Ok(response.body);
            }

            let message = upstream_message(&response);
            let decision = self.policy.decide(response.status, retry_count);
            if !decision.retry {
                return Err(DispatchError::Upstream {
                    status: response.status,
                    message,
                });
            }

            retry_count += 1;
            metrics::counter!("generation_retries_total").increment(1);
            tracing::warn!(
                model = %model.key,
                status = response.status,
                retry_count,
                max_retries = self.policy.max_retries(),
                delay_ms = decision.delay.as_millis() as u64,
                error = %message,
                "Upstream request failed, retrying"
            );

            observer
                .on_retry(RetryProgress {
                    retry_count,
                    reason: RetryPolicy::reason(response.status).to_string(),
                    status: response.status,
                    delay: decision.delay,
                })
                .await;

            tokio::time::sleep(decision.delay).await;
        }
    }
}

fn upstream_message(response: &InferenceResponse) -> String {
    if let Ok(body) = serde_json::from_slice::<UpstreamErrorBody>(&response.body) {
        return body.error;
    }
    reqwest::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown error")
        .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Generated image is invalid: empty response body")]
    InvalidOutput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::model_config::{ModelRegistry, Quality};

    fn spec(model: &str) -> GenerationSpec {
        GenerationSpec {
            prompt: "a cat".to_string(),
            negative_prompt: None,
            width: 1024,
            height: 768,
            model: model.to_string(),
            quality: Quality::Hd,
            seed: 7,
            aspect_ratio: "4:3".to_string(),
            is_private: false,
        }
    }

    #[test]
    fn test_body_omits_unused_fields() {
        let registry = ModelRegistry::builtin().unwrap();
        let request = InferenceRequest::build(registry.get("flux").unwrap(), &spec("flux"));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["inputs"], "a cat");
        assert_eq!(json["parameters"]["seed"], 7);
        assert_eq!(json["parameters"]["width"], 1024);
        assert_eq!(json["parameters"]["height"], 768);
        assert_eq!(json["parameters"]["num_inference_steps"], 4);
        assert!(json["parameters"].get("guidance_scale").is_none());
        assert!(json["parameters"].get("negative_prompt").is_none());
    }

    #[test]
    fn test_body_includes_guidance_when_configured() {
        let registry = ModelRegistry::builtin().unwrap();
        let request = InferenceRequest::build(registry.get("sd35l").unwrap(), &spec("sd35l"));

        assert_eq!(request.parameters.guidance_scale, Some(4.5));
        assert_eq!(request.parameters.num_inference_steps, Some(40));
    }

    #[test]
    fn test_negative_prompt_falls_back_to_model_default() {
        let registry = ModelRegistry::builtin().unwrap();
        let model = registry.get("pixelArt").unwrap();

        let request = InferenceRequest::build(model, &spec("pixelArt"));
        assert_eq!(request.parameters.negative_prompt, model.negative_prompt);

        let mut custom = spec("pixelArt");
        custom.negative_prompt = Some("text".to_string());
        let request = InferenceRequest::build(model, &custom);
        assert_eq!(request.parameters.negative_prompt.as_deref(), Some("text"));
    }

    #[test]
    fn test_upstream_message_prefers_json_error() {
        let response = InferenceResponse {
            status: 503,
            body: br#"{"error": "Model is currently loading"}"#.to_vec(),
        };
        assert_eq!(upstream_message(&response), "Model is currently loading");

        let response = InferenceResponse {
            status: 400,
            body: b"<html>".to_vec(),
        };
        assert_eq!(upstream_message(&response), "Bad Request");
    }
}
