use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Urgent,
    ];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Pending,
        Status::Running,
        Status::Completed,
        Status::Failed,
        Status::Cancelled,
        Status::Retrying,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    /// Waiting to be picked up by the queue.
    pub fn is_runnable(self) -> bool {
        matches!(self, Status::Pending | Status::Retrying)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Retrying => "retrying",
        };
        f.write_str(name)
    }
}

/// One unit of batch work: `total_images` images from a named config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub config_name: String,
    pub batch_size: Option<u32>,
    pub num_batches: Option<u32>,
    pub priority: Priority,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_batch: u32,
    pub current_image: u32,
    pub total_images: u32,
    pub completed_images: u32,
    pub failed_images: u32,
    pub errors: Vec<String>,
    pub output_files: Vec<PathBuf>,
    pub prompts: Option<Vec<String>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Estimated seconds remaining.
    pub estimated_duration: Option<f64>,
    /// Seconds from start to completion.
    pub actual_duration: Option<f64>,
}

impl Job {
    pub fn new(
        config_name: impl Into<String>,
        batch_size: Option<u32>,
        num_batches: Option<u32>,
        priority: Priority,
    ) -> Self {
        let total_images = match (batch_size, num_batches) {
            (Some(size), Some(count)) => size.saturating_mul(count),
            _ => 0,
        };

        Self {
            id: Uuid::new_v4(),
            config_name: config_name.into(),
            batch_size,
            num_batches,
            priority,
            status: Status::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_batch: 0,
            current_image: 0,
            total_images,
            completed_images: 0,
            failed_images: 0,
            errors: Vec::new(),
            output_files: Vec::new(),
            prompts: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            estimated_duration: None,
            actual_duration: None,
        }
    }

    /// Job that renders a fixed prompt list, one image per prompt.
    pub fn with_prompts(config_name: impl Into<String>, prompts: Vec<String>, priority: Priority) -> Self {
        let count = prompts.len() as u32;
        let mut job = Self::new(config_name, Some(count), Some(1), priority);
        job.prompts = Some(prompts);
        job
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark running. A retried job restarts from the first image.
    pub fn start(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = Status::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.current_batch = 0;
        self.current_image = 0;
        self.completed_images = 0;
        self.failed_images = 0;
        self.estimated_duration = None;
    }

    /// Record that image `image` (1-based, across the whole job) of batch
    /// `batch` has been processed.
    pub fn update_progress(&mut self, batch: u32, image: u32, total: u32) {
        if self.is_terminal() {
            return;
        }

        self.current_batch = batch;
        self.current_image = image;
        self.total_images = total;
        self.completed_images = image.saturating_sub(self.failed_images).min(total);

        if let Some(started_at) = self.started_at {
            let elapsed = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
            if image > 0 {
                let remaining = total.saturating_sub(image) as f64;
                self.estimated_duration = Some(elapsed / image as f64 * remaining);
            }
        }
    }

    pub fn record_failed_image(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.failed_images += 1;
        self.errors.push(error.into());
    }

    pub fn add_output(&mut self, path: impl Into<PathBuf>) {
        if self.is_terminal() {
            return;
        }
        self.output_files.push(path.into());
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.errors.push(error.into());
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_images == 0 {
            return 0.0;
        }
        self.current_image.min(self.total_images) as f64 / self.total_images as f64 * 100.0
    }

    pub fn complete(&mut self) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = Status::Completed;
        self.completed_at = Some(now);
        self.estimated_duration = Some(0.0);
        self.actual_duration = self
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
    }

    /// Record a job-level failure. Returns `true` if the job will be retried.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }

        let error = error.into();
        self.errors.push(error.clone());
        self.last_error = Some(error);

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = Status::Retrying;
            true
        } else {
            let now = Utc::now();
            self.status = Status::Failed;
            self.completed_at = Some(now);
            self.actual_duration = self
                .started_at
                .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
            false
        }
    }

    pub fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = Status::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
