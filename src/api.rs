//! Client for Automatic1111-compatible txt2img APIs (A1111, Forge, RunDiffusion).

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::GenerationConfig;
use crate::error::GenerationError;

/// Raw image returned by a generation backend.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub data: Vec<u8>,
    /// Backend-specific generation info, if any.
    pub info: Option<String>,
}

/// The black-box "generate" capability consumed by the batch runner.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(
        &self,
        config: &GenerationConfig,
        prompt: &str,
        seed: i64,
    ) -> Result<GeneratedImage, GenerationError>;

    /// Problems that would make the backend reject this config. Empty means valid.
    fn validate_config(&self, _config: &GenerationConfig) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    steps: u32,
    sampler_name: &'a str,
    width: u32,
    height: u32,
    cfg_scale: f64,
    seed: i64,
    batch_size: u32,
    n_iter: u32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    override_settings: HashMap<&'static str, &'a str>,
}

#[derive(Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    info: Option<String>,
}

pub struct Automatic1111Client {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Automatic1111Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Bearer token for hosted endpoints such as RunDiffusion.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ImageGenerator for Automatic1111Client {
    #[instrument(skip(self, config), fields(config = %config.name))]
    async fn generate_image(
        &self,
        config: &GenerationConfig,
        prompt: &str,
        seed: i64,
    ) -> Result<GeneratedImage, GenerationError> {
        let settings = &config.generation_settings;
        let mut override_settings = HashMap::new();
        if let Some(checkpoint) = &config.model_settings.checkpoint {
            override_settings.insert("sd_model_checkpoint", checkpoint.as_str());
        }
        if let Some(vae) = &config.model_settings.vae {
            override_settings.insert("sd_vae", vae.as_str());
        }

        let request = Txt2ImgRequest {
            prompt,
            negative_prompt: &config.prompt_settings.negative_prompt,
            steps: settings.steps,
            sampler_name: &settings.sampler,
            width: settings.width,
            height: settings.height,
            cfg_scale: settings.cfg_scale,
            seed,
            batch_size: 1,
            n_iter: 1,
            override_settings,
        };

        let url = format!("{}/sdapi/v1/txt2img", self.base_url);
        debug!(url = %url, "Sending txt2img request");
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: Txt2ImgResponse = response.json().await?;
        let encoded = body.images.into_iter().next().ok_or(GenerationError::NoImages)?;
        let data = decode_image(&encoded)?;

        Ok(GeneratedImage {
            data,
            info: body.info,
        })
    }

    fn validate_config(&self, config: &GenerationConfig) -> Vec<String> {
        validate_generation_config(config)
    }
}

/// Limits enforced by Automatic1111's txt2img endpoint.
pub fn validate_generation_config(config: &GenerationConfig) -> Vec<String> {
    let settings = &config.generation_settings;
    let mut errors = Vec::new();

    if !(1..=150).contains(&settings.steps) {
        errors.push(format!("steps must be between 1 and 150 (got {})", settings.steps));
    }
    for (name, value) in [("width", settings.width), ("height", settings.height)] {
        if !(64..=2048).contains(&value) || value % 8 != 0 {
            errors.push(format!(
                "{} must be a multiple of 8 between 64 and 2048 (got {})",
                name, value
            ));
        }
    }
    if !(1.0..=30.0).contains(&settings.cfg_scale) {
        errors.push(format!(
            "cfg_scale must be between 1 and 30 (got {})",
            settings.cfg_scale
        ));
    }
    if settings.sampler.trim().is_empty() {
        errors.push("sampler must not be empty".to_string());
    }
    if settings.batch_size == 0 || settings.num_batches == 0 {
        errors.push("batch_size and num_batches must be at least 1".to_string());
    }

    errors
}

/// Decode a base64 image, tolerating a `data:image/png;base64,` prefix.
fn decode_image(encoded: &str) -> Result<Vec<u8>, GenerationError> {
    let payload = encoded
        .split_once(";base64,")
        .map(|(_, data)| data)
        .unwrap_or(encoded);
    STANDARD
        .decode(payload.trim())
        .map_err(|e| GenerationError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_with_a_prompt() {
        let config = GenerationConfig::new("cats", "a cat");
        assert!(validate_generation_config(&config).is_empty());
    }

    #[test]
    fn out_of_range_settings_are_reported() {
        let mut config = GenerationConfig::new("bad", "a cat");
        config.generation_settings.steps = 0;
        config.generation_settings.width = 500;
        config.generation_settings.cfg_scale = 45.0;
        config.generation_settings.sampler = " ".into();
        config.generation_settings.num_batches = 0;

        let errors = validate_generation_config(&config);
        assert_eq!(errors.len(), 5);
        assert!(errors[0].starts_with("steps"));
        assert!(errors[1].starts_with("width"));
        assert!(errors.iter().any(|e| e.starts_with("batch_size")));
    }

    #[test]
    fn decodes_plain_and_data_uri_images() {
        let encoded = STANDARD.encode(b"\x89PNG");
        assert_eq!(decode_image(&encoded).unwrap(), b"\x89PNG");
        assert_eq!(
            decode_image(&format!("data:image/png;base64,{}", encoded)).unwrap(),
            b"\x89PNG"
        );
        assert!(matches!(decode_image("***"), Err(GenerationError::Decode(_))));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = Automatic1111Client::new("http://127.0.0.1:7860/");
        assert_eq!(client.base_url(), "http://127.0.0.1:7860");
    }
}
