use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::api::{GeneratedImage, ImageGenerator};
use crate::config::{ConfigProvider, GenerationConfig, SeedSetting};
use crate::error::{ConfigError, JobError, QueueError};
use crate::job::{Job, Status};
use crate::output::{self, ImageMetadata, ImageSaver};
use crate::prompt::{ExportedPrompt, PromptBuilder, TemplateValidation, WildcardUsage};
use crate::queue::{JobQueue, QueueStats};

pub const MAX_SEED: i64 = 2_147_483_647;

/// Seeds for `count` images: `S, S+1, ...` for a fixed seed, otherwise
/// independent draws from `[1, 2^31-1]`.
pub fn generate_seeds(setting: SeedSetting, count: usize) -> Vec<i64> {
    match setting {
        SeedSetting::Fixed(seed) => (0..count as i64).map(|i| seed.saturating_add(i)).collect(),
        SeedSetting::Random => {
            let mut rng = rand::thread_rng();
            (0..count).map(|_| rng.gen_range(1..=MAX_SEED)).collect()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub output_dir: PathBuf,
    /// Wait between queue checks when idle.
    pub poll_interval: Duration,
    /// Pause between batches of a template job.
    pub batch_delay: Duration,
    /// Pause between images.
    pub image_delay: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs"),
            poll_interval: Duration::from_secs(1),
            batch_delay: Duration::from_secs(2),
            image_delay: Duration::from_millis(500),
        }
    }
}

/// Progress payload delivered to runner listeners after every image.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub config_name: String,
    pub current_batch: u32,
    pub total_batches: u32,
    pub current_image: u32,
    pub total_images: u32,
    pub completed_images: u32,
    pub failed_images: u32,
    pub progress_percent: f64,
    pub status: Status,
}

impl ProgressUpdate {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            config_name: job.config_name.clone(),
            current_batch: job.current_batch,
            total_batches: job.num_batches.unwrap_or(1),
            current_image: job.current_image,
            total_images: job.total_images,
            completed_images: job.completed_images,
            failed_images: job.failed_images,
            progress_percent: job.progress_percent(),
            status: job.status,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Prompt preview and config summary for a job that has not been queued.
#[derive(Debug, Clone, Serialize)]
pub struct JobPreview {
    pub config_name: String,
    pub model_type: String,
    pub sampler: String,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub cfg_scale: f64,
    pub seed: String,
    pub batch_size: u32,
    pub num_batches: u32,
    pub total_images: u32,
    pub prompts: Vec<String>,
    pub validation: TemplateValidation,
}

/// Position of one image within its job.
#[derive(Debug, Clone, Copy)]
struct Slot {
    batch: u32,
    image: u32,
    total: u32,
}

/// Drains the job queue one job at a time, one image at a time.
#[derive(Clone)]
pub struct BatchRunner {
    queue: Arc<JobQueue>,
    configs: Arc<dyn ConfigProvider>,
    prompts: Arc<PromptBuilder>,
    generator: Arc<dyn ImageGenerator>,
    saver: Arc<dyn ImageSaver>,
    settings: RunnerSettings,
    progress_callbacks: Arc<Mutex<Vec<ProgressCallback>>>,
}

impl BatchRunner {
    pub fn new(
        queue: Arc<JobQueue>,
        configs: Arc<dyn ConfigProvider>,
        prompts: Arc<PromptBuilder>,
        generator: Arc<dyn ImageGenerator>,
        saver: Arc<dyn ImageSaver>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            queue,
            configs,
            prompts,
            generator,
            saver,
            settings,
            progress_callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn on_progress(&self, callback: impl Fn(&ProgressUpdate) + Send + Sync + 'static) {
        self.progress_callbacks.lock().push(Arc::new(callback));
    }

    /// Spawn the background loop. Cancelling the token stops it from picking
    /// up new jobs; an in-flight job stops after its current image only if the
    /// job itself is cancelled.
    pub fn start(&self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(runner.run(cancel_token).instrument(info_span!("runner")))
    }

    pub async fn run(self, cancel_token: CancellationToken) {
        info!("Batch runner started");
        if let Err(err) = self.queue.recover_interrupted() {
            error!(message = "Failed to resubmit interrupted jobs", error = %err);
        }
        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            if !self.queue.has_current_job() {
                match self.queue.start_next_job() {
                    Ok(Some(job)) => {
                        self.process_and_finish(job).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(err) => error!(message = "Failed to start next job", error = %err),
                }
            }

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Runner Cancelled");
                    break;
                },
                _ = sleep(self.settings.poll_interval) => {}
            }
        }
        info!("Batch runner stopped.");
    }

    /// Process runnable jobs until none are left or `cancel_token` is
    /// cancelled. A job already in progress always runs to the end.
    /// Returns how many jobs ran.
    pub async fn run_until_idle(&self, cancel_token: &CancellationToken) -> Result<usize, QueueError> {
        self.queue.recover_interrupted()?;

        let mut processed = 0;
        while !cancel_token.is_cancelled() {
            let Some(job) = self.queue.start_next_job()? else {
                break;
            };
            self.process_and_finish(job).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_and_finish(&self, job: Job) {
        let job_id = job.id;
        let span = info_span!("job", job_id = %job.id, config = %job.config_name);

        let result = self.process_job(&job).instrument(span).await;
        let finished = match result {
            Ok(()) if self.queue.job_status(job_id) == Some(Status::Cancelled) => {
                info!(job_id = %job_id, "Job cancelled while running");
                return;
            }
            Ok(()) => self.queue.complete_current_job(),
            Err(JobError::Cancelled) => {
                info!(job_id = %job_id, "Job cancelled, stopped after current image");
                return;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "Job failed");
                self.queue.fail_current_job(&err.to_string())
            }
        };

        match finished {
            Ok(Some(job)) => self.emit_progress(&job),
            Ok(None) => {}
            Err(err) => error!(job_id = %job_id, error = %err, "Failed to persist job result"),
        }
    }

    async fn process_job(&self, job: &Job) -> Result<(), JobError> {
        let config = self
            .configs
            .load_config(&job.config_name)?
            .with_overrides(job.batch_size, job.num_batches);

        let errors = self.generator.validate_config(&config);
        if !errors.is_empty() {
            return Err(ConfigError::Invalid {
                name: config.name.clone(),
                errors,
            }
            .into());
        }

        match job.prompts.as_deref() {
            Some(prompts) if !prompts.is_empty() => self.run_prompt_list(job, &config, prompts).await,
            _ => self.run_template(job, &config).await,
        }
    }

    async fn run_prompt_list(
        &self,
        job: &Job,
        config: &GenerationConfig,
        prompts: &[String],
    ) -> Result<(), JobError> {
        let total = prompts.len() as u32;
        let seeds = generate_seeds(config.generation_settings.seed, prompts.len());
        info!(images = total, "Rendering pre-generated prompts");

        for (i, (prompt, seed)) in prompts.iter().zip(seeds).enumerate() {
            self.ensure_not_cancelled(job.id)?;
            let slot = Slot {
                batch: 1,
                image: i as u32 + 1,
                total,
            };
            self.render_image(job, config, prompt, seed, slot).await?;
        }
        Ok(())
    }

    async fn run_template(&self, job: &Job, config: &GenerationConfig) -> Result<(), JobError> {
        let settings = &config.generation_settings;
        let total = config.total_images();
        info!(
            batches = settings.num_batches,
            batch_size = settings.batch_size,
            "Rendering template prompts"
        );

        let mut image = 0;
        for batch in 1..=settings.num_batches {
            self.ensure_not_cancelled(job.id)?;

            // Prompts and seeds are fixed before the first image of the batch.
            let prompts = self
                .prompts
                .build_prompt_batch(config, settings.batch_size as usize);
            let seeds = generate_seeds(settings.seed, prompts.len());
            debug!(batch, prompts = ?prompts, seeds = ?seeds, "Prepared batch");

            for (prompt, seed) in prompts.iter().zip(seeds) {
                self.ensure_not_cancelled(job.id)?;
                image += 1;
                let slot = Slot { batch, image, total };
                self.render_image(job, config, prompt, seed, slot).await?;
            }

            if batch < settings.num_batches {
                sleep(self.settings.batch_delay).await;
            }
        }
        Ok(())
    }

    async fn render_image(
        &self,
        job: &Job,
        config: &GenerationConfig,
        prompt: &str,
        seed: i64,
        slot: Slot,
    ) -> Result<(), JobError> {
        debug!(image = slot.image, total = slot.total, seed, "Generating image");

        let outcome = match self.generator.generate_image(config, prompt, seed).await {
            Ok(generated) => self.store_image(job, config, &generated, prompt, seed, slot),
            Err(err) => Err(err.to_string()),
        };

        match outcome {
            Ok(path) => {
                self.queue.add_current_job_output(path)?;
            }
            Err(message) => {
                warn!(image = slot.image, error = %message, "Image failed");
                self.queue
                    .record_current_job_image_failure(&format!("Image {}: {}", slot.image, message))?;
            }
        }

        if let Some(job) = self
            .queue
            .update_current_job_progress(slot.batch, slot.image, slot.total)?
        {
            self.emit_progress(&job);
        }

        if slot.image < slot.total && !self.settings.image_delay.is_zero() {
            sleep(self.settings.image_delay).await;
        }
        Ok(())
    }

    fn store_image(
        &self,
        job: &Job,
        config: &GenerationConfig,
        generated: &GeneratedImage,
        prompt: &str,
        seed: i64,
        slot: Slot,
    ) -> Result<PathBuf, String> {
        let path = output::image_path(
            &self.settings.output_dir,
            &config.name,
            job.id,
            slot.batch,
            slot.image,
        );
        let metadata = ImageMetadata::new(config, prompt, seed, slot.batch, slot.image, slot.total);

        self.saver
            .save_image(&generated.data, &path, &metadata)
            .map_err(|e| e.to_string())?;

        if config.output_settings.save_prompts {
            if let Err(err) = output::write_prompt_sidecar(&path, &metadata) {
                warn!(path = %path.display(), error = %err, "Failed to write prompt sidecar");
            }
        }
        Ok(path)
    }

    fn ensure_not_cancelled(&self, job_id: Uuid) -> Result<(), JobError> {
        match self.queue.job_status(job_id) {
            Some(Status::Running) => Ok(()),
            _ => Err(JobError::Cancelled),
        }
    }

    fn emit_progress(&self, job: &Job) {
        let update = ProgressUpdate::from_job(job);
        let callbacks: Vec<ProgressCallback> = self.progress_callbacks.lock().clone();
        for callback in callbacks {
            callback(&update);
        }
    }

    pub fn preview_job(&self, config_name: &str, count: usize) -> Result<JobPreview, ConfigError> {
        let config = self.configs.load_config(config_name)?;
        let settings = &config.generation_settings;

        Ok(JobPreview {
            config_name: config.name.clone(),
            model_type: config.model_type.clone(),
            sampler: settings.sampler.clone(),
            steps: settings.steps,
            width: settings.width,
            height: settings.height,
            cfg_scale: settings.cfg_scale,
            seed: settings.seed.to_string(),
            batch_size: settings.batch_size,
            num_batches: settings.num_batches,
            total_images: config.total_images(),
            prompts: self.prompts.preview_prompts(&config, count),
            validation: self
                .prompts
                .validate_template(&config.prompt_settings.base_prompt),
        })
    }

    /// Problems with a config, from both the template and the generation backend.
    pub fn validate_config(&self, config_name: &str) -> Result<Vec<String>, ConfigError> {
        let config = self.configs.load_config(config_name)?;
        let mut errors = self.generator.validate_config(&config);
        let template = self
            .prompts
            .validate_template(&config.prompt_settings.base_prompt);
        errors.extend(
            template
                .missing
                .iter()
                .map(|token| format!("missing wildcard file for __{}__", token)),
        );
        Ok(errors)
    }

    pub fn get_wildcard_usage(
        &self,
        config_name: &str,
    ) -> Result<BTreeMap<String, WildcardUsage>, ConfigError> {
        let config = self.configs.load_config(config_name)?;
        Ok(self.prompts.get_wildcard_usage_info(&config))
    }

    pub fn reset_wildcards(&self, config_name: &str) -> Result<(), ConfigError> {
        let config = self.configs.load_config(config_name)?;
        self.prompts.reset_wildcards(&config);
        Ok(())
    }

    pub fn export_prompt_list(
        &self,
        config_name: &str,
        count: usize,
    ) -> Result<Vec<ExportedPrompt>, ConfigError> {
        let config = self.configs.load_config(config_name)?;
        Ok(self.prompts.export_prompt_list(&config, count))
    }

    pub fn get_queue_status(&self) -> QueueStats {
        self.queue.get_queue_stats()
    }

    pub fn cancel_current_job(&self) -> Result<Option<Job>, QueueError> {
        self.queue.cancel_current_job()
    }

    pub fn clear_completed_jobs(&self) -> Result<usize, QueueError> {
        self.queue.clear_completed_jobs()
    }

    pub fn clear_all_jobs(&self) -> Result<usize, QueueError> {
        self.queue.clear_all_jobs()
    }
}
