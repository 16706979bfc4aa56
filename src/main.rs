//! media-jobs - Concurrent media processing pipeline
//!
//! Command-line front-end: submits jobs to the pipeline, waits for their
//! results and manages the result cache.

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use media_jobs::cache::ResultCache;
use media_jobs::cli::{days_to_duration, Args, CacheAction, Commands};
use media_jobs::config::Config;
use media_jobs::job::{JobRequest, JobResult, MediaSource, Operation, RequesterId};
use media_jobs::pipeline::{find_media_files, Pipeline};
use media_jobs::scheduler::JobHandle;

const DEFAULT_CONFIG_FILE: &str = "media-jobs.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Setup logging to both console and file
    setup_logging(args.verbose)?;
    info!("Starting media-jobs");

    // Load configuration
    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new(DEFAULT_CONFIG_FILE).exists() {
                info!("Found {} in current directory, loading...", DEFAULT_CONFIG_FILE);
                Config::from_file(DEFAULT_CONFIG_FILE)?
            } else {
                Config::default()
            }
        }
    };

    if let Some(policy) = args.command.queue_policy() {
        config.queue.policy = policy;
    }

    match args.command {
        Commands::Check => {
            let pipeline = Pipeline::new(config)?;
            let version = pipeline.version_info().await?;
            println!("Media engine OK: {}", version);
            pipeline.shutdown(true).await;
        }
        Commands::Run { operation, source, with, param, timeout, requester } => {
            let requester = RequesterId::new(requester);
            let requests = source
                .into_iter()
                .map(|source| {
                    let mut request = JobRequest::new(source, operation, requester.clone()).with_params(param.clone());
                    for extra in &with {
                        request = request.with_extra_source(extra.clone());
                    }
                    if let Some(secs) = timeout {
                        request = request.with_timeout(Duration::from_secs(secs));
                    }
                    request
                })
                .collect::<Vec<_>>();

            let pipeline = Pipeline::new(config)?;
            let results = run_jobs(&pipeline, requests).await;
            pipeline.shutdown(true).await;
            print_results(&results)?;
            exit_on_failure(&results);
        }
        Commands::Batch { input_dir, operation, param } => {
            info!("Processing directory: {}", input_dir.display());
            let files = find_media_files(&input_dir)?;
            if files.is_empty() {
                println!("No media files found in {}", input_dir.display());
                return Ok(());
            }

            let requests = files
                .iter()
                .map(|file| {
                    JobRequest::new(MediaSource::local(file), operation, RequesterId::new("batch"))
                        .with_params(param.clone())
                })
                .collect::<Vec<_>>();

            let pipeline = Pipeline::new(config)?;
            let results = run_jobs(&pipeline, requests).await;
            pipeline.shutdown(true).await;
            print_results(&results)?;
            exit_on_failure(&results);
        }
        Commands::Cache { action } => {
            let cache = ResultCache::open(config.cache.clone())?;
            manage_cache(&cache, action);
        }
        Commands::InitConfig { output } => {
            Config::default().save_to_file(&output)?;
            println!("Wrote default configuration to {}", output.display());
        }
    }

    info!("media-jobs completed");
    Ok(())
}

/// Submit every request, then wait for all of them with a progress bar
async fn run_jobs(pipeline: &Pipeline, requests: Vec<JobRequest>) -> Vec<JobResult> {
    let progress = ProgressBar::new(requests.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut results = Vec::with_capacity(requests.len());
    let mut handles: Vec<JobHandle> = Vec::with_capacity(requests.len());
    for request in requests {
        let id = request.id();
        let operation: Operation = request.operation();
        let source = request.source().to_string();
        match pipeline.submit(request).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                warn!("Rejected {} of {}: {}", operation, source, e);
                progress.inc(1);
                results.push(JobResult::failed(id, e.kind(), e.to_string(), Duration::ZERO));
            }
        }
    }

    for handle in handles {
        let result = handle.wait().await;
        progress.set_message(result.summary());
        progress.inc(1);
        results.push(result);
    }
    progress.finish_and_clear();
    results
}

fn print_results(results: &[JobResult]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(results)?);
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    info!("{} of {} jobs succeeded", succeeded, results.len());
    Ok(())
}

fn exit_on_failure(results: &[JobResult]) {
    if results.iter().any(|r| !r.is_success()) {
        std::process::exit(1);
    }
}

fn manage_cache(cache: &ResultCache, action: CacheAction) {
    match action {
        CacheAction::List => {
            let entries = cache.entries();
            if entries.is_empty() {
                println!("No cached results found.");
                return;
            }
            println!("\nCached Results:");
            println!("{:<34} {:<10} {:<15} {:<50}", "Fingerprint", "Size (MB)", "Cached", "Output");
            println!("{}", "-".repeat(110));
            for entry in entries {
                let output = entry
                    .result
                    .output
                    .as_deref()
                    .and_then(|p| p.file_name())
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string();
                println!(
                    "{:<34} {:<10.2} {:<15} {:<50}",
                    entry.fingerprint.as_str(),
                    entry.size_bytes as f64 / 1024.0 / 1024.0,
                    format_duration(seconds_since(entry.stored_at)),
                    output
                );
            }
        }
        CacheAction::Info => {
            let info = cache.info();
            println!("\nCache Statistics:");
            println!("Directory: {}", cache.dir().display());
            println!("Entries: {}", info.entries);
            println!("Total size: {:.2} MB", info.total_bytes as f64 / 1024.0 / 1024.0);
            if let Some(oldest) = info.oldest_entry {
                println!("Oldest entry: {} ago", format_duration(seconds_since(oldest)));
            }
            if let Some(newest) = info.newest_entry {
                println!("Newest entry: {} ago", format_duration(seconds_since(newest)));
            }
        }
        CacheAction::Clear => {
            let removed = cache.clear();
            println!("Cleared {} cached results", removed);
        }
        CacheAction::Clean { days } => {
            let removed = cache.clean(days_to_duration(days));
            println!("Cleaned {} cached results older than {} days", removed, days);
        }
    }
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = std::env::current_dir()?.join(".media-jobs").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "media-jobs.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    // Console output goes to stderr so JSON results on stdout stay clean
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("media-jobs.log").display()
    );

    Ok(())
}

fn seconds_since(epoch_secs: u64) -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .saturating_sub(epoch_secs)
}

/// Format duration in seconds to human readable string
fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}
