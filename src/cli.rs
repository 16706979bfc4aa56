use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::QueuePolicy;
use crate::job::{MediaSource, Operation};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the media engine can be started and print its version
    Check,

    /// Run one job per source and print the results as JSON
    Run {
        /// Operation: convert, trim, extract-audio, mix, extract-frame, resize
        #[arg(short, long)]
        operation: Operation,

        /// Source file path or http(s) URL (repeatable)
        #[arg(short, long, required = true)]
        source: Vec<MediaSource>,

        /// Additional sources mixed into every job (mix only)
        #[arg(short, long)]
        with: Vec<MediaSource>,

        /// Operation parameter as key=value (repeatable)
        #[arg(short, long, value_parser = parse_param)]
        param: Vec<(String, String)>,

        /// Per-job timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Requester id recorded on every job
        #[arg(short, long, default_value = "cli")]
        requester: String,
    },

    /// Run one job for every media file in a directory
    Batch {
        /// Input directory containing media files
        #[arg(short, long)]
        input_dir: PathBuf,

        /// Operation applied to every file
        #[arg(short, long)]
        operation: Operation,

        /// Operation parameter as key=value (repeatable)
        #[arg(short, long, value_parser = parse_param)]
        param: Vec<(String, String)>,
    },

    /// Manage the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Destination path
        #[arg(short, long, default_value = "media-jobs.toml")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// List cached results
    List,

    /// Show cache statistics and size
    Info,

    /// Remove every cached result
    Clear,

    /// Remove cached results older than the given number of days
    Clean {
        /// Age in days
        #[arg(short, long, default_value = "30")]
        days: u64,
    },
}

impl Commands {
    /// Queue policy the command needs regardless of the configured one.
    ///
    /// `run` and `batch` submit every job up front, so they wait for queue
    /// space instead of failing the overflow.
    pub fn queue_policy(&self) -> Option<QueuePolicy> {
        match self {
            Self::Run { .. } | Self::Batch { .. } => Some(QueuePolicy::Block),
            _ => None,
        }
    }
}

/// Convert a day count to a duration, saturating instead of overflowing
pub fn days_to_duration(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(24 * 60 * 60))
}

/// Parse a `key=value` operation parameter
pub fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing parameter name in '{}'", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("format=mp4"), Ok(("format".to_string(), "mp4".to_string())));
        assert_eq!(parse_param(" start = 00:01:00 "), Ok(("start".to_string(), "00:01:00".to_string())));
        assert!(parse_param("format").is_err());
        assert!(parse_param("=mp4").is_err());
    }

    #[test]
    fn test_run_command_parses() {
        let args = Args::try_parse_from([
            "media-jobs",
            "run",
            "--operation",
            "extract-audio",
            "--source",
            "clip.mp4",
            "--source",
            "https://example.com/b.mkv",
            "--param",
            "format=wav",
            "--timeout",
            "30",
        ])
        .unwrap();

        match args.command {
            Commands::Run { operation, source, param, timeout, requester, .. } => {
                assert_eq!(operation, Operation::ExtractAudio);
                assert_eq!(source.len(), 2);
                assert!(source[1].is_remote());
                assert_eq!(param, vec![("format".to_string(), "wav".to_string())]);
                assert_eq!(timeout, Some(30));
                assert_eq!(requester, "cli");
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_bulk_commands_wait_for_queue_space() {
        let batch = Args::try_parse_from(["media-jobs", "batch", "--input-dir", "clips", "--operation", "convert"]).unwrap();
        assert_eq!(batch.command.queue_policy(), Some(QueuePolicy::Block));

        let run = Args::try_parse_from(["media-jobs", "run", "-o", "trim", "-s", "a.mp4", "-s", "b.mp4"]).unwrap();
        assert_eq!(run.command.queue_policy(), Some(QueuePolicy::Block));

        let check = Args::try_parse_from(["media-jobs", "check"]).unwrap();
        assert_eq!(check.command.queue_policy(), None);
    }

    #[test]
    fn test_days_to_duration_saturates() {
        assert_eq!(days_to_duration(2), Duration::from_secs(172_800));
        assert_eq!(days_to_duration(u64::MAX), Duration::from_secs(u64::MAX));

        let args = Args::try_parse_from(["media-jobs", "cache", "clean", "--days", "18446744073709551615"]).unwrap();
        match args.command {
            Commands::Cache { action: CacheAction::Clean { days } } => assert_eq!(days, u64::MAX),
            _ => panic!("expected cache clean command"),
        }
    }

    #[test]
    fn test_unknown_operation_rejected() {
        assert!(Args::try_parse_from(["media-jobs", "run", "--operation", "explode", "--source", "a.mp4"]).is_err());
    }
}
