// Media engine adapter
//
// - Commands: argument-vector builders for each operation
// - Plan: parameter validation into typed operation plans
// - Diagnostics: bounded stderr capture
// - Source: local/remote source resolution
// - Processor: the ffmpeg-backed engine

pub mod commands;
pub mod diagnostics;
pub mod plan;
pub mod processor;
pub mod source;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use commands::*;
pub use diagnostics::DiagnosticTail;
pub use plan::OperationPlan;
pub use processor::*;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::job::{JobRequest, JobResult};

/// One external transcoding invocation per call.
///
/// `run` never retries and never returns an error: every outcome, including
/// timeouts and cancellation, is reported in the returned [`JobResult`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Execute one attempt of a job before `deadline`
    async fn run(&self, request: &JobRequest, deadline: Instant, cancel: CancellationToken) -> JobResult;

    /// Check if the engine binary can be started
    fn check_availability(&self) -> Result<()>;

    /// Get engine version information
    async fn version_info(&self) -> Result<String>;
}

/// Factory for creating media engine instances
pub struct MediaEngineFactory;

impl MediaEngineFactory {
    /// Create the default engine implementation (FFmpeg-based)
    pub fn create_engine(config: EngineConfig) -> Result<Arc<dyn MediaEngine>> {
        Ok(Arc::new(processor::FfmpegEngine::new(config)?))
    }
}
