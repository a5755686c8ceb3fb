use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use vidscan::logging::{self, LoggingOptions};
use vidscan::utils::http_client;
use vidscan::{EngineComponents, EngineConfig, Job, JobService, JobStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum number of jobs processed at once (overrides VIDSCAN_MAX_CONCURRENT_JOBS)
    #[arg(short = 'j', long)]
    max_concurrent: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process videos and wait until every job has finished
    Run {
        #[arg(required = true)]
        videos: Vec<PathBuf>,
    },
    /// Print persisted jobs and queue occupancy
    List,
    /// Delete a job with its results and working files
    Delete { job_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = EngineConfig::from_env().context("invalid configuration")?;
    if let Some(max) = args.max_concurrent {
        config.max_concurrent_jobs = max;
    }

    let logging = logging::init_logging(&LoggingOptions {
        filter: config.log_filter.clone(),
        log_dir: config.log_dir.clone(),
        ..Default::default()
    })?;
    http_client::install_rustls_provider();

    let components = EngineComponents::from_config(&config);
    let service = JobService::new(config, components, logging.recent.clone())?;

    match args.command {
        Commands::Run { videos } => run(&service, videos).await?,
        Commands::List => {
            service.load().await?;
            list(&service).await;
        }
        Commands::Delete { job_id } => {
            service.load().await?;
            if service.delete(&job_id).await? {
                println!("Deleted {job_id}");
            } else {
                println!("No job with id {job_id}");
            }
        }
    }

    Ok(())
}

async fn run(service: &Arc<JobService>, videos: Vec<PathBuf>) -> anyhow::Result<()> {
    service.start().await?;

    let mut ids = Vec::with_capacity(videos.len());
    for video in videos {
        let path = tokio::fs::canonicalize(&video)
            .await
            .with_context(|| format!("cannot open {}", video.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let job = service.submit(name, path).await?;
        print_job(&job);
        ids.push(job.id);
    }

    if wait_for_jobs(service, &ids, tokio::signal::ctrl_c()).await? == Watch::Interrupted {
        info!("Interrupted, stopping running jobs");
        service.shutdown().await?;
        return Ok(());
    }

    for id in &ids {
        let job = service.get(id).await?;
        match job.status {
            JobStatus::Completed => {
                let frames = service.results(id).await?;
                let mut items: Vec<_> = frames
                    .iter()
                    .flat_map(|f| f.items.iter().map(|i| i.name.as_str()))
                    .collect();
                items.sort_unstable();
                items.dedup();
                println!(
                    "{}: {} frames with detections, items: {}",
                    job.original_file_name,
                    frames.len(),
                    items.join(", ")
                );
            }
            _ => println!(
                "{}: failed ({})",
                job.original_file_name,
                job.error_detail.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    service.shutdown().await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watch {
    Finished,
    Interrupted,
}

/// Print status changes until every job is terminal or `interrupt` resolves.
async fn wait_for_jobs<F>(service: &JobService, ids: &[String], interrupt: F) -> anyhow::Result<Watch>
where
    F: Future<Output = std::io::Result<()>>,
{
    let mut last_seen: Vec<Option<(JobStatus, f64)>> = vec![None; ids.len()];
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    // Created once so an interrupt during a poll round is not lost.
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            biased;
            _ = &mut interrupt => return Ok(Watch::Interrupted),
            _ = ticker.tick() => {}
        }

        let mut finished = 0;
        for (id, seen) in ids.iter().zip(last_seen.iter_mut()) {
            let job = service.get(id).await?;
            let current = Some((job.status, job.processing_progress));
            if *seen != current {
                print_job(&job);
                *seen = current;
            }
            if job.status.is_terminal() {
                finished += 1;
            }
        }
        if finished == ids.len() {
            return Ok(Watch::Finished);
        }
    }
}

async fn list(service: &JobService) {
    let list = service.list().await;
    println!(
        "running {}/{}, queued {}, free slots {}",
        list.queue.running, list.queue.max_concurrent, list.queue.queued, list.queue.available_slots
    );
    for job in &list.jobs {
        print_job(job);
    }
}

fn print_job(job: &Job) {
    let mut line = format!(
        "{:<36}  {:<9}  {:>6.2}%  {:<28}  {}",
        job.id,
        job.status.as_ref(),
        job.processing_progress,
        job.current_stage,
        job.original_file_name
    );
    if let Some(detail) = &job.error_detail {
        line.push_str(&format!("  [{detail}]"));
    }
    println!("{line}");
}
