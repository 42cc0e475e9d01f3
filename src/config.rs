use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Seed policy for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedSetting {
    #[default]
    Random,
    Fixed(i64),
}

impl fmt::Display for SeedSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedSetting::Random => write!(f, "random"),
            SeedSetting::Fixed(seed) => write!(f, "{}", seed),
        }
    }
}

impl Serialize for SeedSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SeedSetting::Random => serializer.serialize_str("random"),
            SeedSetting::Fixed(seed) => serializer.serialize_i64(*seed),
        }
    }
}

impl<'de> Deserialize<'de> for SeedSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Anything that is not an integer (or a numeric string) falls back to random.
        let value = serde_json::Value::deserialize(deserializer)?;
        let seed = match &value {
            serde_json::Value::Number(n) => n.as_i64().map(SeedSetting::Fixed),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok().map(SeedSetting::Fixed),
            _ => None,
        };
        Ok(seed.unwrap_or(SeedSetting::Random))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub steps: u32,
    pub sampler: String,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub num_batches: u32,
    pub cfg_scale: f64,
    pub seed: SeedSetting,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            steps: 20,
            sampler: "Euler a".to_string(),
            width: 512,
            height: 512,
            batch_size: 1,
            num_batches: 1,
            cfg_scale: 7.0,
            seed: SeedSetting::Random,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    pub base_prompt: String,
    pub negative_prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub checkpoint: Option<String>,
    pub vae: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub save_prompts: bool,
}

/// A named generation configuration, loaded from `configs/<name>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub name: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub generation_settings: GenerationSettings,
    #[serde(default)]
    pub prompt_settings: PromptSettings,
    #[serde(default)]
    pub model_settings: ModelSettings,
    #[serde(default)]
    pub output_settings: OutputSettings,
}

fn default_model_type() -> String {
    "sd15".to_string()
}

impl GenerationConfig {
    pub fn new(name: impl Into<String>, base_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_type: default_model_type(),
            generation_settings: GenerationSettings::default(),
            prompt_settings: PromptSettings {
                base_prompt: base_prompt.into(),
                negative_prompt: String::new(),
            },
            model_settings: ModelSettings::default(),
            output_settings: OutputSettings::default(),
        }
    }

    /// Apply job-level batch overrides.
    pub fn with_overrides(mut self, batch_size: Option<u32>, num_batches: Option<u32>) -> Self {
        if let Some(size) = batch_size {
            self.generation_settings.batch_size = size;
        }
        if let Some(count) = num_batches {
            self.generation_settings.num_batches = count;
        }
        self
    }

    pub fn total_images(&self) -> u32 {
        self.generation_settings
            .batch_size
            .saturating_mul(self.generation_settings.num_batches)
    }
}

/// Source of named generation configs.
pub trait ConfigProvider: Send + Sync {
    fn load_config(&self, name: &str) -> Result<GenerationConfig, ConfigError>;

    fn list_configs(&self) -> Result<Vec<String>, ConfigError>;
}

/// Directory of `<name>.json` config files.
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    dir: PathBuf,
}

impl JsonConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn save_config(&self, config: &GenerationConfig) -> Result<PathBuf, ConfigError> {
        let path = self.path_for(&config.name);
        let io_err = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(io_err)?;

        debug!(config = %config.name, path = %path.display(), "Saved config");
        Ok(path)
    }
}

impl ConfigProvider for JsonConfigStore {
    fn load_config(&self, name: &str) -> Result<GenerationConfig, ConfigError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(ConfigError::NotFound(name.to_string()));
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut config: GenerationConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;

        if config.name != name {
            warn!(
                file = %path.display(),
                declared = %config.name,
                "Config name does not match file name, using file name"
            );
            config.name = name.to_string();
        }

        Ok(config)
    }

    fn list_configs(&self) -> Result<Vec<String>, ConfigError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|source| ConfigError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }
}
