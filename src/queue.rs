//! Priority-ordered job queue persisted to a JSON file.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{Job, Priority, Status, DEFAULT_MAX_RETRIES};

pub const QUEUE_VERSION: &str = "2.0";
const LEGACY_VERSION: &str = "1.0";

/// On-disk shape of the queue file.
#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    jobs: Vec<Job>,
    current_job_id: Option<Uuid>,
    last_updated: DateTime<Utc>,
    version: String,
}

/// Identifies the version of the queue file last read or written by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }
}

#[derive(Debug, Default, Clone)]
struct QueueState {
    jobs: Vec<Job>,
    current_job_id: Option<Uuid>,
    stamp: Option<FileStamp>,
}

impl QueueState {
    fn job_mut(&mut self, id: Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn current_mut(&mut self) -> Option<&mut Job> {
        let id = self.current_job_id?;
        self.job_mut(id)
    }

    fn sort(&mut self) {
        self.jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
    }
}

/// Notification sent to queue listeners after a state change is persisted.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added(Job),
    Started(Job),
    Completed(Job),
    Retrying(Job),
    Failed(Job),
    Cancelled(Job),
    Cleared { removed: usize },
}

pub type QueueCallback = Arc<dyn Fn(&QueueEvent) + Send + Sync>;
pub type JobProgressCallback = Arc<dyn Fn(&Job) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_jobs: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub total_images: u64,
    pub completed_images: u64,
    pub failed_images: u64,
    /// Mean `actual_duration` of completed jobs, in seconds.
    pub average_duration: Option<f64>,
    pub current_job: Option<Job>,
}

/// Jobs ordered by `(priority desc, created_at asc)`; at most one is current.
pub struct JobQueue {
    state: Mutex<QueueState>,
    queue_file: Option<PathBuf>,
    callbacks: Mutex<Vec<QueueCallback>>,
    progress_callbacks: Mutex<HashMap<Uuid, JobProgressCallback>>,
}

impl JobQueue {
    /// Load the queue from `path`, or start empty if the file does not exist.
    ///
    /// The file stays authoritative: changes written by other processes are
    /// picked up before every read and mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let state = if path.exists() {
            let state = load_state(&path)?;
            info!(path = %path.display(), jobs = state.jobs.len(), "Loaded job queue");
            state
        } else {
            QueueState::default()
        };

        Ok(Self::with_state(state, Some(path)))
    }

    /// Queue without persistence (for testing).
    pub fn in_memory() -> Self {
        Self::with_state(QueueState::default(), None)
    }

    fn with_state(state: QueueState, queue_file: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(state),
            queue_file,
            callbacks: Mutex::new(Vec::new()),
            progress_callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue_file(&self) -> Option<&Path> {
        self.queue_file.as_deref()
    }

    /// Put jobs left running by a dead runner back to pending.
    ///
    /// Only the process that runs jobs should call this, before it starts.
    pub fn recover_interrupted(&self) -> Result<usize, QueueError> {
        let resubmitted = self.mutate(|state| {
            let mut resubmitted = 0;
            for job in state.jobs.iter_mut().filter(|j| j.status == Status::Running) {
                job.status = Status::Pending;
                resubmitted += 1;
            }
            state.current_job_id = None;
            (resubmitted, None)
        })?;

        if resubmitted > 0 {
            info!(count = resubmitted, "Resubmitting jobs interrupted while running");
        }
        Ok(resubmitted)
    }

    pub fn add_callback(&self, callback: impl Fn(&QueueEvent) + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Called with a snapshot of the job after each progress update.
    pub fn on_job_progress(&self, id: Uuid, callback: impl Fn(&Job) + Send + Sync + 'static) {
        self.progress_callbacks.lock().insert(id, Arc::new(callback));
    }

    pub fn add_job(
        &self,
        config_name: &str,
        batch_size: Option<u32>,
        num_batches: Option<u32>,
        priority: Priority,
    ) -> Result<Job, QueueError> {
        self.insert(Job::new(config_name, batch_size, num_batches, priority))
    }

    pub fn add_job_with_prompts(
        &self,
        config_name: &str,
        prompts: Vec<String>,
        priority: Priority,
    ) -> Result<Job, QueueError> {
        self.insert(Job::with_prompts(config_name, prompts, priority))
    }

    fn insert(&self, job: Job) -> Result<Job, QueueError> {
        debug!(job_id = %job.id, config = %job.config_name, priority = %job.priority, "Adding job");
        self.mutate(move |state| {
            state.jobs.push(job.clone());
            state.sort();
            (job.clone(), Some(QueueEvent::Added(job)))
        })
    }

    /// Start the highest-priority runnable job, unless one is already running.
    pub fn start_next_job(&self) -> Result<Option<Job>, QueueError> {
        {
            let state = self.lock_synced();
            if state.current_job_id.is_some() || !state.jobs.iter().any(|j| j.status.is_runnable()) {
                return Ok(None);
            }
        }

        self.mutate(|state| {
            if state.current_job_id.is_some() {
                return (None, None);
            }
            let Some(job) = state.jobs.iter_mut().find(|j| j.status.is_runnable()) else {
                return (None, None);
            };
            job.start();
            let job = job.clone();
            state.current_job_id = Some(job.id);
            info!(job_id = %job.id, config = %job.config_name, "Started job");
            (Some(job.clone()), Some(QueueEvent::Started(job)))
        })
    }

    pub fn complete_current_job(&self) -> Result<Option<Job>, QueueError> {
        self.finish_current(|job| {
            job.complete();
            info!(
                job_id = %job.id,
                completed = job.completed_images,
                failed = job.failed_images,
                "Completed job"
            );
            QueueEvent::Completed(job.clone())
        })
    }

    pub fn fail_current_job(&self, error: &str) -> Result<Option<Job>, QueueError> {
        self.finish_current(|job| {
            if job.fail(error) {
                warn!(job_id = %job.id, retry = job.retry_count, error = %error, "Job failed, will retry");
                QueueEvent::Retrying(job.clone())
            } else {
                warn!(job_id = %job.id, error = %error, "Job failed");
                QueueEvent::Failed(job.clone())
            }
        })
    }

    pub fn cancel_current_job(&self) -> Result<Option<Job>, QueueError> {
        self.finish_current(|job| {
            job.cancel();
            info!(job_id = %job.id, "Cancelled current job");
            QueueEvent::Cancelled(job.clone())
        })
    }

    /// Cancel any non-terminal job, current or queued.
    pub fn cancel_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        if self.lock_synced().current_job_id == Some(id) {
            return self.cancel_current_job();
        }

        let cancelled = self.mutate(|state| match state.job_mut(id) {
            Some(job) if !job.is_terminal() => {
                job.cancel();
                info!(job_id = %id, "Cancelled queued job");
                (Some(job.clone()), Some(QueueEvent::Cancelled(job.clone())))
            }
            _ => (None, None),
        })?;
        self.progress_callbacks.lock().remove(&id);
        Ok(cancelled)
    }

    fn finish_current(
        &self,
        finish: impl FnOnce(&mut Job) -> QueueEvent,
    ) -> Result<Option<Job>, QueueError> {
        let finished = self.mutate(|state| {
            let Some(job) = state.current_mut() else {
                return (None, None);
            };
            let event = finish(job);
            let job = job.clone();
            state.current_job_id = None;
            (Some(job), Some(event))
        })?;

        if let Some(job) = &finished {
            self.progress_callbacks.lock().remove(&job.id);
        }
        Ok(finished)
    }

    pub fn update_current_job_progress(
        &self,
        batch: u32,
        image: u32,
        total: u32,
    ) -> Result<Option<Job>, QueueError> {
        let updated = self.update_current(|job| job.update_progress(batch, image, total))?;

        if let Some(job) = &updated {
            let callback = self.progress_callbacks.lock().get(&job.id).cloned();
            if let Some(callback) = callback {
                callback(job);
            }
        }
        Ok(updated)
    }

    pub fn add_current_job_output(&self, path: impl Into<PathBuf>) -> Result<Option<Job>, QueueError> {
        let path = path.into();
        self.update_current(move |job| job.add_output(path))
    }

    pub fn add_current_job_error(&self, error: &str) -> Result<Option<Job>, QueueError> {
        self.update_current(|job| job.add_error(error))
    }

    /// Record one failed image on the current job.
    pub fn record_current_job_image_failure(&self, error: &str) -> Result<Option<Job>, QueueError> {
        self.update_current(|job| job.record_failed_image(error))
    }

    fn update_current(&self, update: impl FnOnce(&mut Job)) -> Result<Option<Job>, QueueError> {
        self.mutate(|state| match state.current_mut() {
            Some(job) => {
                update(job);
                (Some(job.clone()), None)
            }
            None => (None, None),
        })
    }

    /// Remove every job that is not pending, running or retrying.
    pub fn clear_completed_jobs(&self) -> Result<usize, QueueError> {
        self.mutate(|state| {
            let before = state.jobs.len();
            state
                .jobs
                .retain(|j| matches!(j.status, Status::Pending | Status::Running | Status::Retrying));
            let removed = before - state.jobs.len();
            (removed, Some(QueueEvent::Cleared { removed }))
        })
    }

    /// Cancel the current job and empty the queue.
    pub fn clear_all_jobs(&self) -> Result<usize, QueueError> {
        self.cancel_current_job()?;
        let removed = self.mutate(|state| {
            let removed = state.jobs.len();
            state.jobs.clear();
            state.current_job_id = None;
            (removed, Some(QueueEvent::Cleared { removed }))
        })?;
        self.progress_callbacks.lock().clear();
        Ok(removed)
    }

    pub fn current_job(&self) -> Option<Job> {
        let mut state = self.lock_synced();
        state.current_mut().map(|job| job.clone())
    }

    pub fn has_current_job(&self) -> bool {
        self.lock_synced().current_job_id.is_some()
    }

    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.lock_synced().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn job_status(&self, id: Uuid) -> Option<Status> {
        self.lock_synced()
            .jobs
            .iter()
            .find(|j| j.id == id)
            .map(|j| j.status)
    }

    /// Snapshot of every job in queue order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock_synced().jobs.clone()
    }

    pub fn has_runnable_jobs(&self) -> bool {
        self.lock_synced().jobs.iter().any(|j| j.status.is_runnable())
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        let mut state = self.lock_synced();

        let mut by_status: BTreeMap<String, usize> =
            Status::ALL.iter().map(|s| (s.to_string(), 0)).collect();
        let mut by_priority: BTreeMap<String, usize> =
            Priority::ALL.iter().map(|p| (p.to_string(), 0)).collect();
        let mut durations = Vec::new();
        let (mut total_images, mut completed_images, mut failed_images) = (0u64, 0u64, 0u64);

        for job in &state.jobs {
            *by_status.entry(job.status.to_string()).or_default() += 1;
            *by_priority.entry(job.priority.to_string()).or_default() += 1;
            total_images += u64::from(job.total_images);
            completed_images += u64::from(job.completed_images);
            failed_images += u64::from(job.failed_images);
            if job.status == Status::Completed {
                durations.extend(job.actual_duration);
            }
        }

        let average_duration = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };

        QueueStats {
            total_jobs: state.jobs.len(),
            by_status,
            by_priority,
            total_images,
            completed_images,
            failed_images,
            average_duration,
            current_job: state.current_mut().map(|job| job.clone()),
        }
    }

    /// Lock the state, first reloading it if another process rewrote the file.
    fn lock_synced(&self) -> MutexGuard<'_, QueueState> {
        let mut state = self.state.lock();
        let Some(queue_file) = &self.queue_file else {
            return state;
        };

        let stamp = FileStamp::of(queue_file);
        if stamp.is_some() && stamp != state.stamp {
            match load_state(queue_file) {
                Ok(fresh) => {
                    debug!(jobs = fresh.jobs.len(), "Reloaded job queue changed on disk");
                    *state = fresh;
                }
                Err(err) => {
                    warn!(path = %queue_file.display(), error = %err, "Failed to reload job queue")
                }
            }
        }
        state
    }

    /// Apply `change` to a copy of the state and persist it. The copy only
    /// replaces the live state once it is on disk, then listeners are notified.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut QueueState) -> (T, Option<QueueEvent>),
    ) -> Result<T, QueueError> {
        let (result, event) = {
            let mut state = self.lock_synced();
            let mut next = state.clone();
            let (result, event) = change(&mut next);
            if let Err(err) = self.save(&mut next) {
                error!(error = %err, "Failed to save job queue, change discarded");
                return Err(err);
            }
            *state = next;
            (result, event)
        };

        if let Some(event) = event {
            self.notify(&event);
        }
        Ok(result)
    }

    fn notify(&self, event: &QueueEvent) {
        let callbacks: Vec<QueueCallback> = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(event);
        }
    }

    fn save(&self, state: &mut QueueState) -> Result<(), QueueError> {
        let Some(queue_file) = &self.queue_file else {
            return Ok(());
        };

        if let Some(parent) = queue_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if queue_file.exists() {
            let backup = backup_path(queue_file);
            if let Err(err) = fs::copy(queue_file, &backup) {
                warn!(path = %backup.display(), error = %err, "Failed to back up queue file");
            }
        }

        let file = QueueFile {
            jobs: state.jobs.clone(),
            current_job_id: state.current_job_id,
            last_updated: Utc::now(),
            version: QUEUE_VERSION.to_string(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let temp_file = queue_file.with_extension("json.tmp");
        fs::write(&temp_file, json)?;
        fs::rename(&temp_file, queue_file)?;
        state.stamp = FileStamp::of(queue_file);

        debug!(jobs = state.jobs.len(), "Saved job queue");
        Ok(())
    }
}

fn load_state(path: &Path) -> Result<QueueState, QueueError> {
    let stamp = FileStamp::of(path);
    let content = fs::read_to_string(path)?;
    let file = parse_queue_file(&content)?;

    let mut state = QueueState {
        jobs: file.jobs,
        current_job_id: file.current_job_id,
        stamp,
    };
    state.sort();
    Ok(state)
}

/// `queue.json` -> `queue.json.backup`
pub fn backup_path(queue_file: &Path) -> PathBuf {
    let mut name = queue_file.file_name().unwrap_or_default().to_os_string();
    name.push(".backup");
    queue_file.with_file_name(name)
}

fn parse_queue_file(content: &str) -> Result<QueueFile, QueueError> {
    let mut value: Value = serde_json::from_str(content)?;
    let version = value
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or(LEGACY_VERSION)
        .to_string();

    match version.as_str() {
        QUEUE_VERSION => {}
        LEGACY_VERSION => {
            info!("Migrating job queue from version {} to {}", LEGACY_VERSION, QUEUE_VERSION);
            migrate_v1(&mut value);
        }
        other => return Err(QueueError::UnsupportedVersion(other.to_string())),
    }

    Ok(serde_json::from_value(value)?)
}

/// Back-fill fields introduced in version 2.0.
fn migrate_v1(value: &mut Value) {
    let Some(root) = value.as_object_mut() else {
        return;
    };

    if let Some(Value::Array(jobs)) = root.get_mut("jobs") {
        for job in jobs.iter_mut().filter_map(Value::as_object_mut) {
            let defaults = [
                ("priority", json!(Priority::Normal)),
                ("retry_count", json!(0)),
                ("max_retries", json!(DEFAULT_MAX_RETRIES)),
                ("last_error", Value::Null),
                ("estimated_duration", Value::Null),
                ("actual_duration", Value::Null),
                ("prompts", Value::Null),
            ];
            for (key, default) in defaults {
                job.entry(key).or_insert(default);
            }
        }
    }

    root.entry("current_job_id").or_insert(Value::Null);
    root.entry("last_updated").or_insert(json!(Utc::now()));
    root.insert("version".to_string(), json!(QUEUE_VERSION));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    #[test]
    fn drains_by_priority_then_age() {
        let queue = JobQueue::in_memory();
        let low = queue.add_job("low", None, None, Priority::Low).unwrap();
        let urgent = queue.add_job("urgent", None, None, Priority::Urgent).unwrap();
        let normal = queue.add_job("normal", None, None, Priority::Normal).unwrap();
        let high = queue.add_job("high", None, None, Priority::High).unwrap();
        let normal_later = queue.add_job("normal2", None, None, Priority::Normal).unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.start_next_job().unwrap() {
            order.push(job.id);
            queue.complete_current_job().unwrap();
        }
        assert_eq!(order, vec![urgent.id, high.id, normal.id, normal_later.id, low.id]);
    }

    #[test]
    fn only_one_job_runs_at_a_time() {
        let queue = JobQueue::in_memory();
        queue.add_job("a", None, None, Priority::Normal).unwrap();
        queue.add_job("b", None, None, Priority::Normal).unwrap();

        let started = queue.start_next_job().unwrap().unwrap();
        assert_eq!(started.status, Status::Running);
        assert!(started.started_at.is_some());
        assert!(queue.start_next_job().unwrap().is_none());
        assert_eq!(queue.current_job().unwrap().id, started.id);
    }

    #[test]
    fn failed_job_is_retried_then_fails_permanently() {
        let queue = JobQueue::in_memory();
        let job = queue.add_job("flaky", None, None, Priority::Normal).unwrap();

        for attempt in 1..=DEFAULT_MAX_RETRIES {
            queue.start_next_job().unwrap().unwrap();
            let failed = queue.fail_current_job("api down").unwrap().unwrap();
            assert_eq!(failed.status, Status::Retrying);
            assert_eq!(failed.retry_count, attempt);
            assert!(!queue.has_current_job());
        }

        queue.start_next_job().unwrap().unwrap();
        let failed = queue.fail_current_job("api down").unwrap().unwrap();
        assert_eq!(failed.status, Status::Failed);
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.errors.len(), DEFAULT_MAX_RETRIES as usize + 1);
        assert_eq!(queue.job_status(job.id), Some(Status::Failed));
        assert!(queue.start_next_job().unwrap().is_none());
    }

    #[test]
    fn cancelling_a_queued_job_is_immediate() {
        let queue = JobQueue::in_memory();
        queue.add_job("a", None, None, Priority::Normal).unwrap();
        let queued = queue.add_job("b", None, None, Priority::Normal).unwrap();
        queue.start_next_job().unwrap();

        let cancelled = queue.cancel_job(queued.id).unwrap().unwrap();
        assert_eq!(cancelled.status, Status::Cancelled);
        assert!(queue.has_current_job());

        queue.complete_current_job().unwrap();
        assert!(queue.start_next_job().unwrap().is_none());
    }

    #[test]
    fn progress_updates_reach_job_callback() {
        let queue = JobQueue::in_memory();
        let job = queue.add_job("cats", Some(2), Some(1), Priority::Normal).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        queue.on_job_progress(job.id, move |job| {
            assert_eq!(job.current_image, seen.fetch_add(1, Ordering::SeqCst) as u32 + 1);
        });

        queue.start_next_job().unwrap();
        queue.update_current_job_progress(1, 1, 2).unwrap();
        queue.add_current_job_output("out/1.png").unwrap();
        queue.update_current_job_progress(1, 2, 2).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let current = queue.current_job().unwrap();
        assert_eq!(current.completed_images, 2);
        assert_eq!(current.output_files, vec![PathBuf::from("out/1.png")]);
    }

    #[test]
    fn updates_without_current_job_are_noops() {
        let queue = JobQueue::in_memory();
        assert!(queue.update_current_job_progress(1, 1, 1).unwrap().is_none());
        assert!(queue.add_current_job_error("nothing running").unwrap().is_none());
        assert!(queue.complete_current_job().unwrap().is_none());
    }

    #[test]
    fn callbacks_see_lifecycle_events() {
        let queue = JobQueue::in_memory();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        queue.add_callback(move |event| {
            let name = match event {
                QueueEvent::Added(_) => "added",
                QueueEvent::Started(_) => "started",
                QueueEvent::Completed(_) => "completed",
                QueueEvent::Retrying(_) => "retrying",
                QueueEvent::Failed(_) => "failed",
                QueueEvent::Cancelled(_) => "cancelled",
                QueueEvent::Cleared { .. } => "cleared",
            };
            sink.lock().push(name);
        });

        queue.add_job("a", None, None, Priority::Normal).unwrap();
        queue.start_next_job().unwrap();
        queue.complete_current_job().unwrap();
        queue.clear_completed_jobs().unwrap();

        assert_eq!(*events.lock(), vec!["added", "started", "completed", "cleared"]);
    }

    #[test]
    fn stats_count_statuses_priorities_and_images() {
        let queue = JobQueue::in_memory();
        queue.add_job("a", Some(2), Some(2), Priority::High).unwrap();
        queue.add_job("b", Some(1), Some(3), Priority::Low).unwrap();
        queue.add_job("c", None, None, Priority::Low).unwrap();

        queue.start_next_job().unwrap();
        queue.update_current_job_progress(1, 4, 4).unwrap();
        queue.complete_current_job().unwrap();
        queue.start_next_job().unwrap();

        let stats = queue.get_queue_stats();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.by_status["completed"], 1);
        assert_eq!(stats.by_status["running"], 1);
        assert_eq!(stats.by_status["pending"], 1);
        assert_eq!(stats.by_status["failed"], 0);
        assert_eq!(stats.by_priority["low"], 2);
        assert_eq!(stats.by_priority["high"], 1);
        assert_eq!(stats.total_images, 7);
        assert_eq!(stats.completed_images, 4);
        assert!(stats.average_duration.is_some());
        assert_eq!(stats.current_job.unwrap().config_name, "b");
    }

    #[test]
    fn clearing_keeps_active_jobs() {
        let queue = JobQueue::in_memory();
        let done = queue.add_job("done", None, None, Priority::Urgent).unwrap();
        queue.add_job("waiting", None, None, Priority::Normal).unwrap();
        queue.start_next_job().unwrap();
        queue.complete_current_job().unwrap();

        assert_eq!(queue.clear_completed_jobs().unwrap(), 1);
        assert!(queue.get_job(done.id).is_none());
        assert_eq!(queue.jobs().len(), 1);

        queue.start_next_job().unwrap();
        assert_eq!(queue.clear_all_jobs().unwrap(), 1);
        assert!(queue.jobs().is_empty());
        assert!(!queue.has_current_job());
    }

    #[test]
    fn persisted_queue_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");

        let queue = JobQueue::open(&path).unwrap();
        let finished = queue.add_job("cats", Some(2), Some(1), Priority::High).unwrap();
        let waiting = queue
            .add_job_with_prompts("dogs", vec!["a dog".into(), "two dogs".into()], Priority::Low)
            .unwrap();
        queue.start_next_job().unwrap();
        queue.update_current_job_progress(1, 2, 2).unwrap();
        queue.complete_current_job().unwrap();

        let reloaded = JobQueue::open(&path).unwrap();
        let jobs = reloaded.jobs();
        assert_eq!(jobs.len(), 2);

        let cats = reloaded.get_job(finished.id).unwrap();
        assert_eq!(cats.status, Status::Completed);
        assert_eq!(cats.config_name, "cats");
        assert_eq!(cats.current_image, 2);
        assert_eq!(cats.completed_images, 2);

        let dogs = reloaded.get_job(waiting.id).unwrap();
        assert_eq!(dogs.status, Status::Pending);
        assert_eq!(dogs.prompts.unwrap(), vec!["a dog", "two dogs"]);
        assert!(backup_path(&path).exists());
    }

    #[test]
    fn interrupted_jobs_are_resubmitted_on_recovery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");

        let queue = JobQueue::open(&path).unwrap();
        let job = queue.add_job("cats", None, None, Priority::Normal).unwrap();
        queue.start_next_job().unwrap();
        drop(queue);

        let reloaded = JobQueue::open(&path).unwrap();
        assert!(reloaded.has_current_job());
        assert_eq!(reloaded.recover_interrupted().unwrap(), 1);
        assert!(!reloaded.has_current_job());
        assert_eq!(reloaded.job_status(job.id), Some(Status::Pending));
        assert_eq!(reloaded.start_next_job().unwrap().unwrap().id, job.id);
    }

    #[test]
    #[traced_test]
    fn failed_save_discards_the_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let queue = JobQueue::open(&path).unwrap();
        let job = queue.add_job("cats", None, None, Priority::Normal).unwrap();

        // A directory where the temp file goes makes every save fail.
        let blocker = dir.path().join("queue.json.tmp");
        fs::create_dir(&blocker).unwrap();

        assert!(queue.start_next_job().is_err());
        assert!(!queue.has_current_job());
        assert_eq!(queue.job_status(job.id), Some(Status::Pending));
        assert!(queue.add_job("dogs", None, None, Priority::Normal).is_err());
        assert_eq!(queue.jobs().len(), 1);
        assert!(logs_contain("Failed to save job queue"));

        fs::remove_dir(&blocker).unwrap();
        assert_eq!(queue.start_next_job().unwrap().unwrap().id, job.id);
    }

    #[test]
    fn changes_from_another_handle_are_seen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");

        let runner = JobQueue::open(&path).unwrap();
        let first = runner.add_job("cats", None, None, Priority::Normal).unwrap();

        let client = JobQueue::open(&path).unwrap();
        let urgent = client.add_job("dogs", None, None, Priority::Urgent).unwrap();

        assert_eq!(runner.start_next_job().unwrap().unwrap().id, urgent.id);
        let on_disk = JobQueue::open(&path).unwrap();
        assert_eq!(on_disk.jobs().len(), 2);
        assert_eq!(on_disk.current_job().unwrap().id, urgent.id);

        client.cancel_job(urgent.id).unwrap();
        assert_eq!(runner.job_status(urgent.id), Some(Status::Cancelled));
        assert!(!runner.has_current_job());
        assert_eq!(runner.job_status(first.id), Some(Status::Pending));
    }

    #[test]
    fn legacy_queue_file_is_migrated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let id = Uuid::new_v4();
        let legacy = json!({
            "version": "1.0",
            "current_job_id": null,
            "jobs": [{
                "id": id,
                "config_name": "legacy",
                "batch_size": 2,
                "num_batches": 1,
                "status": "completed",
                "created_at": "2024-01-01T00:00:00Z",
                "started_at": "2024-01-01T00:00:01Z",
                "completed_at": "2024-01-01T00:01:00Z",
                "current_batch": 1,
                "current_image": 2,
                "total_images": 2,
                "completed_images": 2,
                "failed_images": 0,
                "errors": [],
                "output_files": ["out/a.png", "out/b.png"]
            }]
        });
        fs::write(&path, legacy.to_string()).unwrap();

        let queue = JobQueue::open(&path).unwrap();
        let job = queue.get_job(id).unwrap();
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert!(job.last_error.is_none());
        assert_eq!(job.output_files.len(), 2);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        fs::write(&path, r#"{"version": "9.9", "jobs": []}"#).unwrap();

        assert!(matches!(
            JobQueue::open(&path),
            Err(QueueError::UnsupportedVersion(v)) if v == "9.9"
        ));
    }

    #[test]
    fn backup_path_appends_suffix() {
        assert_eq!(
            backup_path(Path::new("state/queue.json")),
            PathBuf::from("state/queue.json.backup")
        );
    }
}
