use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::cache::ResultCache;
use crate::config::Config;
use crate::error::{MediaJobError, Result};
use crate::job::{JobId, RequesterId};
use crate::job::JobRequest;
use crate::media::{MediaEngine, MediaEngineFactory};
use crate::queue::JobQueue;
use crate::scheduler::{JobHandle, JobState, Scheduler};

/// File extensions picked up when scanning a directory for sources
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v", "mp3", "wav", "flac", "ogg", "m4a", "aac", "opus",
];

/// Owns the engine, cache and scheduler; the only thing a front-end talks to
pub struct Pipeline {
    config: Config,
    engine: Arc<dyn MediaEngine>,
    cache: Option<Arc<ResultCache>>,
    scheduler: Scheduler,
}

impl Pipeline {
    /// Build the ffmpeg-backed pipeline and start its workers.
    ///
    /// Fails with `EngineNotFound` when the engine binary cannot be started.
    pub fn new(config: Config) -> Result<Self> {
        let engine = MediaEngineFactory::create_engine(config.engine.clone())?;
        Self::with_engine(config, engine)
    }

    /// Build a pipeline around an existing engine
    pub fn with_engine(config: Config, engine: Arc<dyn MediaEngine>) -> Result<Self> {
        config.validate()?;

        // Check dependencies
        engine.check_availability()?;

        let cache = if config.cache.enabled {
            Some(ResultCache::open(config.cache.clone())?)
        } else {
            None
        };

        let scheduler = Scheduler::new(
            JobQueue::from_config(&config.queue),
            Arc::clone(&engine),
            cache.clone(),
            config.scheduler.clone(),
            &config.engine,
        );
        scheduler.start(config.scheduler.workers);

        info!(
            "Pipeline ready: {} workers, queue capacity {}, cache {}",
            config.scheduler.workers,
            config.queue.capacity,
            if cache.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            config,
            engine,
            cache,
            scheduler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        self.scheduler.submit(request).await
    }

    pub fn cancel(&self, id: JobId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn cancel_requester(&self, requester: &RequesterId) -> usize {
        let cancelled = self.scheduler.cancel_requester(requester);
        info!("Cancelled {} jobs for requester {}", cancelled, requester.as_str());
        cancelled
    }

    pub fn status(&self, id: JobId) -> Option<JobState> {
        self.scheduler.status(id)
    }

    pub async fn version_info(&self) -> Result<String> {
        self.engine.version_info().await
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub async fn shutdown(&self, graceful: bool) {
        self.scheduler.shutdown(graceful).await;
    }
}

/// Collect media files under `input_dir`, sorted by path
pub fn find_media_files<P: AsRef<Path>>(input_dir: P) -> Result<Vec<PathBuf>> {
    let input_dir = input_dir.as_ref();
    if !input_dir.is_dir() {
        return Err(MediaJobError::Config(format!("{} is not a directory", input_dir.display())));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(input_dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_media = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false);
        if is_media {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();

    info!("Found {} media files under {}", files.len(), input_dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, EngineConfig};
    use crate::job::{JobResult, MediaSource, Operation};
    use crate::media::MockMediaEngine;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.scheduler.workers = 1;
        config.engine = EngineConfig {
            output_dir: root.join("out"),
            ..EngineConfig::default()
        };
        config.cache = CacheConfig {
            enabled: false,
            dir: root.join("cache"),
            ..CacheConfig::default()
        };
        config
    }

    #[test]
    fn test_missing_engine_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut engine = MockMediaEngine::new();
        engine
            .expect_check_availability()
            .returning(|| Err(MediaJobError::EngineNotFound("ffmpeg".to_string())));

        let result = Pipeline::with_engine(test_config(dir.path()), Arc::new(engine));
        assert!(matches!(result, Err(MediaJobError::EngineNotFound(_))));
    }

    #[tokio::test]
    async fn test_submit_runs_job_through_engine() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mp4");
        std::fs::write(&input, b"data").unwrap();
        let output = dir.path().join("result.mp3");

        let mut engine = MockMediaEngine::new();
        engine.expect_check_availability().returning(|| Ok(()));
        let expected = output.clone();
        engine
            .expect_run()
            .times(1)
            .returning(move |request, _, _| JobResult::succeeded(request.id(), expected.clone(), Duration::ZERO));

        let pipeline = Pipeline::with_engine(test_config(dir.path()), Arc::new(engine)).unwrap();
        let request = JobRequest::new(MediaSource::local(&input), Operation::ExtractAudio, RequesterId::new("tester"));
        let handle = pipeline.submit(request).await.unwrap();
        let id = handle.id();
        let result = handle.wait().await;

        assert!(result.is_success());
        assert_eq!(result.output.as_deref(), Some(output.as_path()));
        assert_eq!(result.attempts, 1);
        assert!(matches!(pipeline.status(id), Some(JobState::Finished(_))));
        pipeline.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_engine() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mp4");
        std::fs::write(&input, b"data").unwrap();

        let mut engine = MockMediaEngine::new();
        engine.expect_check_availability().returning(|| Ok(()));
        engine.expect_run().never();

        let pipeline = Pipeline::with_engine(test_config(dir.path()), Arc::new(engine)).unwrap();
        let request = JobRequest::new(MediaSource::local(&input), Operation::Resize, RequesterId::new("tester"))
            .with_param("width", "-5");
        let err = pipeline.submit(request).await.unwrap_err();
        assert!(matches!(err, MediaJobError::InvalidParameters(_)));
        pipeline.shutdown(true).await;
    }

    #[test]
    fn test_find_media_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.MP4"), b"x").unwrap();
        std::fs::write(dir.path().join("nested/b.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let files = find_media_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().is_some_and(|e| e != "txt")));

        assert!(find_media_files(dir.path().join("a.MP4")).is_err());
    }
}
