use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MediaJobError, Result};

fn default_capacity() -> usize {
    64
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

fn default_binary_path() -> String {
    "ffmpeg".to_string()
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_stderr_tail_lines() -> usize {
    40
}

fn default_stderr_line_max() -> usize {
    512
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".media-jobs").join("output")
}

fn default_fetch_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_finished_retention() -> usize {
    1024
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".media-jobs").join("cache")
}

fn default_cache_max_entries() -> usize {
    256
}

fn default_cache_max_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_cache_max_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// What `submit` does when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Wait for space
    Block,
    /// Reject with `QueueFull`
    #[default]
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending jobs
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Backpressure policy when full
    #[serde(default)]
    pub policy: QueuePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to ffmpeg binary
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// Wall-clock limit for one attempt, unless the request sets its own
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Time between asking ffmpeg to quit and killing it
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Number of stderr lines kept for diagnostics
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
    /// Longest stderr line kept, in bytes
    #[serde(default = "default_stderr_line_max")]
    pub stderr_line_max: usize,
    /// Parent directory for per-job working directories (system temp dir if unset)
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Where finished outputs are placed
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Largest remote source that will be downloaded
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts for jobs failing with a retryable kind
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubled per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Finished jobs kept for status queries; older ones are forgotten
    #[serde(default = "default_finished_retention")]
    pub finished_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_cache_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            policy: QueuePolicy::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            job_timeout_secs: default_job_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
            stderr_tail_lines: default_stderr_tail_lines(),
            stderr_line_max: default_stderr_line_max(),
            work_dir: None,
            output_dir: default_output_dir(),
            fetch_max_bytes: default_fetch_max_bytes(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            finished_retention: default_finished_retention(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
            max_age_secs: default_cache_max_age_secs(),
        }
    }
}

impl EngineConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl SchedulerConfig {
    /// Delay before retry number `attempt` (1-based attempt that just failed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MediaJobError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| MediaJobError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MediaJobError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| MediaJobError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(MediaJobError::Config("queue.capacity must be at least 1".to_string()));
        }
        if self.scheduler.workers == 0 {
            return Err(MediaJobError::Config("scheduler.workers must be at least 1".to_string()));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(MediaJobError::Config("scheduler.max_attempts must be at least 1".to_string()));
        }
        if self.engine.job_timeout_secs == 0 {
            return Err(MediaJobError::Config("engine.job_timeout_secs must be positive".to_string()));
        }
        if self.engine.stderr_tail_lines == 0 {
            return Err(MediaJobError::Config("engine.stderr_tail_lines must be at least 1".to_string()));
        }
        if self.engine.binary_path.trim().is_empty() {
            return Err(MediaJobError::Config("engine.binary_path is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [queue]
            capacity = 8
            policy = "block"

            [scheduler]
            workers = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.capacity, 8);
        assert_eq!(config.queue.policy, QueuePolicy::Block);
        assert_eq!(config.scheduler.workers, 3);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.engine.binary_path, "ffmpeg");
        assert!(config.cache.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let scheduler = SchedulerConfig {
            workers: 1,
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..SchedulerConfig::default()
        };
        assert_eq!(scheduler.backoff(1), Duration::from_millis(100));
        assert_eq!(scheduler.backoff(2), Duration::from_millis(200));
        assert_eq!(scheduler.backoff(3), Duration::from_millis(400));
        assert_eq!(scheduler.backoff(5), Duration::from_millis(1_000));
        assert_eq!(scheduler.backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("media-jobs.toml");

        let mut config = Config::default();
        config.queue.capacity = 5;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.queue.capacity, 5);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.scheduler.workers = 0;
        assert!(matches!(config.validate(), Err(MediaJobError::Config(_))));
    }
}
