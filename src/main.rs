use anyhow::{bail, Error};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use sdbatch::runner::RunnerSettings;
use sdbatch::telemetry;
use sdbatch::{
    Automatic1111Client, BatchRunner, ConfigProvider, FileImageSaver, JobQueue, JsonConfigStore, Priority,
    ProgressUpdate, PromptBuilder, QueueEvent, UsageStore, WildcardFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

#[derive(Parser, Clone, Debug)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(long = "configs_dir", help = "Directory of <name>.json generation configs", default_value = "configs")]
    configs_dir: PathBuf,

    #[arg(long = "wildcards_dir", help = "Directory of <token>.txt wildcard files", default_value = "wildcards")]
    wildcards_dir: PathBuf,

    #[arg(short = 'o', long = "output_dir", help = "Directory for generated images", default_value = "outputs")]
    output_dir: PathBuf,

    #[arg(long = "queue_file", help = "Job queue state file", default_value = "data/job_queue.json")]
    queue_file: PathBuf,

    #[arg(long = "usage_file", help = "Wildcard usage statistics file", default_value = "data/wildcard_usage.json")]
    usage_file: PathBuf,

    #[arg(short = 'u', long = "api_url", help = "Automatic1111/Forge API base URL", default_value = "http://127.0.0.1:7860")]
    api_url: String,

    #[arg(long = "api_key", help = "Bearer token for hosted APIs such as RunDiffusion")]
    api_key: Option<String>,

    #[arg(long = "jaeger_endpoint", help = "Jaeger collector endpoint for span export")]
    jaeger_endpoint: Option<String>,

    #[arg(long = "batch_delay_ms", help = "Pause between batches", default_value = "2000")]
    batch_delay_ms: u64,

    #[arg(long = "image_delay_ms", help = "Pause between images", default_value = "500")]
    image_delay_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Process the queue in the background until interrupted
    Run,
    /// Process every queued job, then exit
    Drain,
    /// Queue a job for a config
    Add {
        config: String,
        #[arg(short = 'b', long)]
        batch_size: Option<u32>,
        #[arg(short = 'n', long)]
        num_batches: Option<u32>,
        #[arg(short = 'p', long, value_enum, default_value = "normal")]
        priority: PriorityArg,
        /// File with one prompt per line, rendered instead of the config template
        #[arg(long)]
        prompts_file: Option<PathBuf>,
    },
    /// List available configs
    Configs,
    /// Show upcoming prompts without consuming wildcards
    Preview {
        config: String,
        #[arg(short = 'c', long, default_value = "5")]
        count: usize,
    },
    /// Export upcoming prompts with their wildcard values as JSON
    Export {
        config: String,
        #[arg(short = 'c', long, default_value = "10")]
        count: usize,
    },
    /// Wildcard usage statistics for a config
    Usage { config: String },
    /// Start new wildcard cycles for a config
    ResetWildcards { config: String },
    /// Check a config against API limits and wildcard files
    Validate { config: String },
    /// Queue statistics
    Status,
    /// Remove finished jobs (or every job with --all)
    Clear {
        #[arg(long)]
        all: bool,
    },
    /// Cancel a job (the current one if no id is given)
    Cancel { job_id: Option<Uuid> },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    Normal,
    High,
    Urgent,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Urgent => Priority::Urgent,
        }
    }
}

#[derive(Debug)]
enum RunnerMessage {
    Progress(ProgressUpdate),
    Queue(QueueEvent),
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_runner(config: &ConfigContext) -> Result<BatchRunner, Error> {
    let usage = Arc::new(UsageStore::open(&config.usage_file));
    let factory = Arc::new(WildcardFactory::new(usage));
    let prompts = Arc::new(PromptBuilder::new(&config.wildcards_dir, factory));
    let queue = Arc::new(JobQueue::open(&config.queue_file)?);
    let configs = Arc::new(JsonConfigStore::new(&config.configs_dir));

    let mut client = Automatic1111Client::new(&config.api_url);
    if let Some(key) = &config.api_key {
        client = client.with_api_key(key);
    }

    let settings = RunnerSettings {
        output_dir: config.output_dir.clone(),
        batch_delay: Duration::from_millis(config.batch_delay_ms),
        image_delay: Duration::from_millis(config.image_delay_ms),
        ..RunnerSettings::default()
    };

    Ok(BatchRunner::new(
        queue,
        configs,
        prompts,
        Arc::new(client),
        Arc::new(FileImageSaver),
        settings,
    ))
}

#[instrument(skip_all)]
async fn serve(runner: BatchRunner, cancel_token: CancellationToken) -> Result<(), Error> {
    // Channel for progress and queue notifications
    let (send_to_client, mut recv_from_runner) = mpsc::unbounded_channel();

    {
        let send_to_client = send_to_client.clone();
        runner.on_progress(move |update| {
            let _ = send_to_client.send(RunnerMessage::Progress(update.clone()));
        });
    }
    runner.queue().add_callback(move |event| {
        let _ = send_to_client.send(RunnerMessage::Queue(event.clone()));
    });

    let runner_spawn = runner.start(cancel_token.clone());

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            message = recv_from_runner.recv() => {
                match message {
                    Some(RunnerMessage::Progress(update)) => {
                        info!(
                            event = "Progress",
                            job_id = %update.job_id,
                            image = update.current_image,
                            total = update.total_images,
                            failed = update.failed_images,
                            percent = update.progress_percent,
                            status = %update.status
                        );
                    },
                    Some(RunnerMessage::Queue(event)) => {
                        info!(event = "Queue", msg = ?event);
                    },
                    None => {
                        debug!("Runner channel closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    println!("Waiting for runner to finish current job...");
    runner_spawn.await?;
    Ok(())
}

async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let runner = build_runner(&config)?;

    match config.command {
        Command::Run => serve(runner, cancel_token).await?,
        Command::Drain => {
            let processed = runner.run_until_idle(&cancel_token).await?;
            info!(jobs = processed, "Queue drained");
            print_json(&runner.get_queue_status())?;
        }
        Command::Add {
            config: name,
            batch_size,
            num_batches,
            priority,
            prompts_file,
        } => {
            let queue = runner.queue();
            let job = match prompts_file {
                Some(path) => {
                    let prompts: Vec<String> = fs::read_to_string(&path)?
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(String::from)
                        .collect();
                    if prompts.is_empty() {
                        bail!("No prompts found in {}", path.display());
                    }
                    queue.add_job_with_prompts(&name, prompts, priority.into())?
                }
                None => queue.add_job(&name, batch_size, num_batches, priority.into())?,
            };
            println!("Queued job {} ({} images)", job.id, job.total_images);
        }
        Command::Configs => {
            for name in JsonConfigStore::new(&config.configs_dir).list_configs()? {
                println!("{}", name);
            }
        }
        Command::Preview { config: name, count } => print_json(&runner.preview_job(&name, count)?)?,
        Command::Export { config: name, count } => print_json(&runner.export_prompt_list(&name, count)?)?,
        Command::Usage { config: name } => print_json(&runner.get_wildcard_usage(&name)?)?,
        Command::ResetWildcards { config: name } => {
            runner.reset_wildcards(&name)?;
            println!("Reset wildcards for {}", name);
        }
        Command::Validate { config: name } => {
            let errors = runner.validate_config(&name)?;
            if errors.is_empty() {
                println!("{} is valid", name);
            } else {
                for err in &errors {
                    println!("- {}", err);
                }
                bail!("{} has {} problem(s)", name, errors.len());
            }
        }
        Command::Status => print_json(&runner.get_queue_status())?,
        Command::Clear { all } => {
            let removed = if all {
                runner.clear_all_jobs()?
            } else {
                runner.clear_completed_jobs()?
            };
            println!("Removed {} job(s)", removed);
        }
        Command::Cancel { job_id } => {
            let cancelled = match job_id {
                Some(id) => runner.queue().cancel_job(id)?,
                None => runner.cancel_current_job()?,
            };
            match cancelled {
                Some(job) => println!("Cancelled job {}", job.id),
                None => println!("Nothing to cancel"),
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "sdbatch=info");
    }

    let config = ConfigContext::parse();
    telemetry::init("sdbatch", config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    tokio::spawn(async move {
        let (Ok(mut sigterm), Ok(mut sigint)) =
            (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        else {
            error!("Failed to install signal handlers");
            return;
        };
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    let result = app.await?;
    telemetry::shutdown();
    result?;

    Ok(())
}
