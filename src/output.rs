//! Persisting generated images with their generation metadata.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::error::SaveError;

pub const SOFTWARE: &str = concat!("sdbatch ", env!("CARGO_PKG_VERSION"));

/// Everything needed to reproduce one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: i64,
    pub sampler: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub checkpoint: Option<String>,
    pub vae: Option<String>,
    pub config_name: String,
    pub timestamp: DateTime<Utc>,
    pub software: String,
    pub batch: u32,
    pub image: u32,
    pub total_images: u32,
}

impl ImageMetadata {
    pub fn new(
        config: &GenerationConfig,
        prompt: &str,
        seed: i64,
        batch: u32,
        image: u32,
        total_images: u32,
    ) -> Self {
        let settings = &config.generation_settings;
        Self {
            prompt: prompt.to_string(),
            negative_prompt: config.prompt_settings.negative_prompt.clone(),
            seed,
            sampler: settings.sampler.clone(),
            steps: settings.steps,
            cfg_scale: settings.cfg_scale,
            width: settings.width,
            height: settings.height,
            checkpoint: config.model_settings.checkpoint.clone(),
            vae: config.model_settings.vae.clone(),
            config_name: config.name.clone(),
            timestamp: Utc::now(),
            software: SOFTWARE.to_string(),
            batch,
            image,
            total_images,
        }
    }

    /// Human-readable prompt sidecar contents.
    pub fn to_sidecar_text(&self) -> String {
        format!(
            "Prompt: {}\nNegative prompt: {}\nSeed: {}\nConfig: {}\nBatch: {}\nImage: {}/{}\n",
            self.prompt,
            self.negative_prompt,
            self.seed,
            self.config_name,
            self.batch,
            self.image,
            self.total_images
        )
    }
}

/// Writes a generated image and its metadata.
pub trait ImageSaver: Send + Sync {
    fn save_image(&self, data: &[u8], path: &Path, metadata: &ImageMetadata) -> Result<(), SaveError>;
}

/// Saves the image bytes as-is with metadata in a `<image>.json` document.
#[derive(Debug, Default, Clone)]
pub struct FileImageSaver;

impl FileImageSaver {
    pub fn metadata_path(image_path: &Path) -> PathBuf {
        image_path.with_extension("json")
    }
}

impl ImageSaver for FileImageSaver {
    fn save_image(&self, data: &[u8], path: &Path, metadata: &ImageMetadata) -> Result<(), SaveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SaveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, data).map_err(|source| SaveError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let metadata_path = Self::metadata_path(path);
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(&metadata_path, json).map_err(|source| SaveError::Io {
            path: metadata_path.clone(),
            source,
        })?;

        debug!(path = %path.display(), bytes = data.len(), "Saved image");
        Ok(())
    }
}

/// Write the prompt sidecar (`<image>.txt`) next to an image.
pub fn write_prompt_sidecar(image_path: &Path, metadata: &ImageMetadata) -> Result<PathBuf, SaveError> {
    let path = image_path.with_extension("txt");
    fs::write(&path, metadata.to_sidecar_text()).map_err(|source| SaveError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// `<output_dir>/<config>/<YYYYmmdd_HHMMSS>_<job8>_b<batch>_i<image>.png`
pub fn image_path(output_dir: &Path, config_name: &str, job_id: Uuid, batch: u32, image: u32) -> PathBuf {
    let job = job_id.simple().to_string();
    output_dir.join(config_name).join(format!(
        "{}_{}_b{:03}_i{:04}.png",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &job[..8],
        batch,
        image
    ))
}
