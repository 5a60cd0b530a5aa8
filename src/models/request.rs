use garde::Validate;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::job::{GenerationSpec, MAX_SEED};
use crate::models::model_config::{ModelConfig, Quality};

/// Aspect ratio labels offered to callers, most portrait to most landscape.
pub const ASPECT_RATIOS: &[&str] = &[
    "9:21", "1:2", "9:16", "10:16", "2:3", "3:4", "4:5", "1:1", "5:4", "4:3", "3:2", "16:10",
    "16:9", "2:1", "21:9",
];

const MAX_RANDOM_SEED: u64 = 1_000_000;

/// Label stored on specs built from explicit width/height.
pub const CUSTOM_ASPECT_RATIO: &str = "custom";

/// What a caller asks for. Expands into one `GenerationSpec` per image.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GenerationRequest {
    #[garde(length(min = 1, max = 4000))]
    pub prompt: String,

    #[garde(length(max = 2000))]
    #[serde(default)]
    pub negative_prompt: Option<String>,

    #[garde(length(min = 1, max = 100))]
    pub model: String,

    #[garde(skip)]
    pub quality: Quality,

    #[garde(range(max = MAX_SEED))]
    #[serde(default)]
    pub seed: u64,

    #[garde(skip)]
    #[serde(default = "default_true")]
    pub randomize_seed: bool,

    #[garde(skip)]
    #[serde(default = "default_true")]
    pub use_aspect_ratio: bool,

    #[garde(length(min = 3, max = 16))]
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,

    #[garde(range(min = 256, max = 4096))]
    #[serde(default = "default_dimension")]
    pub width: u32,

    #[garde(range(min = 256, max = 4096))]
    #[serde(default = "default_dimension")]
    pub height: u32,

    #[garde(range(min = 1, max = 4))]
    #[serde(default = "default_image_count")]
    pub image_count: u32,

    #[garde(skip)]
    #[serde(default)]
    pub is_private: bool,
}

fn default_true() -> bool {
    true
}

fn default_aspect_ratio() -> String {
    "1:1".to_string()
}

fn default_dimension() -> u32 {
    1024
}

fn default_image_count() -> u32 {
    1
}

impl GenerationRequest {
    /// A single-image request with every optional knob at its default.
    pub fn new(prompt: impl Into<String>, model: impl Into<String>, quality: Quality) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            model: model.into(),
            quality,
            seed: 0,
            randomize_seed: true,
            use_aspect_ratio: true,
            aspect_ratio: default_aspect_ratio(),
            width: default_dimension(),
            height: default_dimension(),
            image_count: default_image_count(),
            is_private: false,
        }
    }

    /// Resolve prompt, seed, dimensions and negative prompt for each image.
    pub fn expand(&self, model: &ModelConfig) -> Result<Vec<GenerationSpec>, RequestError> {
        self.validate()?;

        if !model.supports(self.quality) {
            return Err(RequestError::UnsupportedQuality {
                model: model.key.clone(),
                quality: self.quality,
            });
        }

        let max_dimension = self.quality.max_dimension();
        let (width, height, aspect_ratio) = if self.use_aspect_ratio {
            let ratio = parse_aspect_ratio(&self.aspect_ratio)
                .ok_or_else(|| RequestError::UnknownAspectRatio(self.aspect_ratio.clone()))?;
            let (width, height) = dimensions_for_ratio(ratio, max_dimension);
            (width, height, self.aspect_ratio.clone())
        } else {
            (
                round_down_to_16(self.width.min(max_dimension)),
                round_down_to_16(self.height.min(max_dimension)),
                CUSTOM_ASPECT_RATIO.to_string(),
            )
        };

        let prompt = model.resolve_prompt(&self.prompt);
        let negative_prompt = model.negative_prompt.as_ref().map(|default| {
            self.negative_prompt
                .as_ref()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(default)
                .clone()
        });

        let mut rng = rand::thread_rng();
        let specs = (0..self.image_count)
            .map(|index| -> Result<GenerationSpec, RequestError> {
                let seed = if self.randomize_seed {
                    rng.gen_range(0..MAX_RANDOM_SEED)
                } else {
                    self.seed
                        .checked_add(u64::from(index))
                        .filter(|seed| *seed <= MAX_SEED)
                        .ok_or(RequestError::SeedOutOfRange(self.seed))?
                };

                Ok(GenerationSpec {
                    prompt: prompt.clone(),
                    negative_prompt: negative_prompt.clone(),
                    width,
                    height,
                    model: model.key.clone(),
                    quality: self.quality,
                    seed,
                    aspect_ratio: aspect_ratio.clone(),
                    is_private: self.is_private,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(specs)
    }
}

/// Parse one of the offered `w:h` labels.
pub fn parse_aspect_ratio(label: &str) -> Option<(u32, u32)> {
    if !ASPECT_RATIOS.contains(&label) {
        return None;
    }
    let (w, h) = label.split_once(':')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Longer edge gets `max_dimension`, the other edge follows the ratio.
pub fn dimensions_for_ratio((ratio_w, ratio_h): (u32, u32), max_dimension: u32) -> (u32, u32) {
    let ratio = f64::from(ratio_w) / f64::from(ratio_h);
    let max = f64::from(max_dimension);

    let (width, height) = if ratio > 1.0 {
        (max, (max / ratio).round())
    } else {
        ((max * ratio).round(), max)
    };

    (round_down_to_16(width as u32), round_down_to_16(height as u32))
}

pub fn round_down_to_16(value: u32) -> u32 {
    value / 16 * 16
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid generation request: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Model '{model}' does not support {quality} quality")]
    UnsupportedQuality { model: String, quality: Quality },

    #[error("Unknown aspect ratio: {0}")]
    UnknownAspectRatio(String),

    #[error("Seed {0} leaves no room for the requested images")]
    SeedOutOfRange(u64),
}
