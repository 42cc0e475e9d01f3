use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading or validating a generation config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config '{0}' not found")]
    NotFound(String),

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config '{name}': {}", .errors.join("; "))]
    Invalid { name: String, errors: Vec<String> },
}

/// Failures from the external generation API.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("API returned no images")]
    NoImages,
}

/// Failures while writing generated images and their metadata.
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures persisting or restoring the job queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Queue file JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported queue file version '{0}'")]
    UnsupportedVersion(String),
}

/// Job-level failures that abort the remainder of a job.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Job was cancelled")]
    Cancelled,
}
