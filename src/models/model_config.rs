use std::collections::BTreeMap;
use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

const BUILTIN_MODELS: &str = include_str!("../../config/models.json");

/// Output quality tier. Drives the maximum edge length and the credit cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
pub enum Quality {
    #[serde(rename = "HD")]
    #[strum(serialize = "HD")]
    Hd,
    #[serde(rename = "HD+")]
    #[strum(serialize = "HD+")]
    HdPlus,
    #[serde(rename = "4K")]
    #[strum(serialize = "4K")]
    UltraHd,
}

impl Quality {
    pub fn max_dimension(&self) -> u32 {
        match self {
            Quality::Hd => 1024,
            Quality::HdPlus => 1536,
            Quality::UltraHd => 2048,
        }
    }

    /// Credits charged per generated image.
    pub fn credit_cost(&self) -> u32 {
        match self {
            Quality::Hd => 1,
            Quality::HdPlus => 2,
            Quality::UltraHd => 3,
        }
    }
}

/// Model entry as it appears in the registry file, before validation.
#[derive(Debug, Deserialize)]
struct RawModelConfig {
    name: String,
    api_url: String,
    #[serde(default)]
    steps: Option<u32>,
    #[serde(default)]
    use_guidance: bool,
    #[serde(default)]
    default_guidance: Option<f32>,
    #[serde(default)]
    use_negative_prompt: bool,
    #[serde(default)]
    default_negative_prompt: Option<String>,
    #[serde(default)]
    quality_limits: Option<Vec<Quality>>,
    #[serde(default)]
    prompt_suffix: Option<String>,
}

/// Validated per-model request shaping.
///
/// `guidance_scale` and `negative_prompt` are `Some` exactly when the
/// inference request must carry them.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub key: String,
    pub name: String,
    pub api_url: Url,
    pub steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub negative_prompt: Option<String>,
    pub quality_limits: Option<Vec<Quality>>,
    pub prompt_suffix: Option<String>,
}

impl ModelConfig {
    fn from_raw(key: &str, raw: RawModelConfig) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::Invalid {
            model: key.to_string(),
            reason: reason.to_string(),
        };

        let api_url = Url::parse(&raw.api_url).map_err(|_| invalid("api_url is not a valid URL"))?;

        if raw.steps == Some(0) {
            return Err(invalid("steps must be greater than zero"));
        }

        let guidance_scale = match (raw.use_guidance, raw.default_guidance) {
            (true, Some(scale)) if scale > 0.0 => Some(scale),
            (true, _) => return Err(invalid("use_guidance requires a positive default_guidance")),
            (false, _) => None,
        };

        let negative_prompt = match (raw.use_negative_prompt, raw.default_negative_prompt) {
            (true, Some(prompt)) if !prompt.trim().is_empty() => Some(prompt),
            (true, _) => {
                return Err(invalid(
                    "use_negative_prompt requires a non-empty default_negative_prompt",
                ))
            }
            (false, _) => None,
        };

        if matches!(&raw.quality_limits, Some(limits) if limits.is_empty()) {
            return Err(invalid("quality_limits must not be empty when present"));
        }

        Ok(Self {
            key: key.to_string(),
            name: raw.name,
            api_url,
            steps: raw.steps,
            guidance_scale,
            negative_prompt,
            quality_limits: raw.quality_limits,
            prompt_suffix: raw.prompt_suffix.filter(|s| !s.is_empty()),
        })
    }

    pub fn supports(&self, quality: Quality) -> bool {
        match &self.quality_limits {
            Some(limits) => limits.contains(&quality),
            None => true,
        }
    }

    /// Append the model's style suffix to a user prompt.
    pub fn resolve_prompt(&self, prompt: &str) -> String {
        match &self.prompt_suffix {
            Some(suffix) => format!("{}{}", prompt.trim_end(), suffix),
            None => prompt.trim_end().to_string(),
        }
    }
}

/// Read-only lookup of model configurations keyed by model identifier.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelConfig>,
}

impl ModelRegistry {
    /// Parse and validate a registry document (a JSON object keyed by model id).
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let raw: BTreeMap<String, RawModelConfig> = serde_json::from_str(json)?;
        let models = raw
            .into_iter()
            .map(|(key, entry)| ModelConfig::from_raw(&key, entry).map(|config| (key, config)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Self { models })
    }

    /// Registry shipped with the crate.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_json(BUILTIN_MODELS)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn get(&self, key: &str) -> Option<&ModelConfig> {
        self.models.get(key)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read model registry: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse model registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration for model '{model}': {reason}")]
    Invalid { model: String, reason: String },
}
