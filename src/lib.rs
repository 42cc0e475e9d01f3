//! Wildcard prompt building and a persisted batch job queue for
//! Automatic1111-style image generation APIs.

pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod output;
pub mod prompt;
pub mod queue;
pub mod runner;
pub mod telemetry;
pub mod wildcard;

pub use api::{Automatic1111Client, GeneratedImage, ImageGenerator};
pub use config::{ConfigProvider, GenerationConfig, JsonConfigStore, SeedSetting};
pub use error::{ConfigError, GenerationError, JobError, QueueError, SaveError};
pub use job::{Job, Priority, Status};
pub use output::{FileImageSaver, ImageMetadata, ImageSaver};
pub use prompt::PromptBuilder;
pub use queue::{JobQueue, QueueEvent, QueueStats};
pub use runner::{BatchRunner, ProgressUpdate, RunnerSettings};
pub use wildcard::{UsageStore, WildcardFactory, WildcardManager};
