use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{MediaJobError, Result};
use crate::job::{ErrorKind, JobError, JobId, JobRequest, JobResult};
use super::diagnostics::DiagnosticTail;
use super::plan::OperationPlan;
use super::source::SourceResolver;
use super::{MediaCommand, MediaCommandBuilder, MediaEngine};

/// How long to keep reading stderr after the process is gone
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    DeadlineExpired,
    Cancelled,
}

/// Concrete implementation of the media engine (FFmpeg-based)
pub struct FfmpegEngine {
    config: EngineConfig,
    command_builder: MediaCommandBuilder,
    resolver: SourceResolver,
}

impl FfmpegEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let command_builder = MediaCommandBuilder::new(&config.binary_path);
        let resolver = SourceResolver::new(config.fetch_max_bytes)?;

        Ok(Self {
            config,
            command_builder,
            resolver,
        })
    }

    async fn run_job(
        &self,
        request: &JobRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> std::result::Result<PathBuf, JobError> {
        let plan = OperationPlan::parse(request).map_err(|e| JobError {
            kind: e.kind(),
            message: e.to_string(),
        })?;

        // Removed on drop, whichever way this function returns.
        let workdir = self.create_workdir(request.id())?;

        let mut inputs = Vec::new();
        for (index, source) in request.sources().enumerate() {
            let resolved = tokio::select! {
                resolved = tokio::time::timeout_at(deadline, self.resolver.resolve(source, index, workdir.path())) => {
                    match resolved {
                        Ok(resolved) => resolved?,
                        Err(_) => return Err(deadline_error("while fetching sources")),
                    }
                }
                _ = cancel.cancelled() => return Err(cancelled_error()),
            };
            inputs.push(resolved);
        }

        let output = workdir.path().join(format!("output.{}", plan.output_extension()));
        let command = self.command_builder.build(&plan, &inputs, &output);
        self.execute(&command, deadline, cancel).await?;

        let problem = match fs::metadata(&output).await {
            Ok(meta) if meta.len() > 0 => None,
            Ok(_) => Some("wrote an empty output"),
            Err(_) => Some("produced no output"),
        };
        if let Some(problem) = problem {
            let mut message = format!("{} exited cleanly but {}", command.description, problem);
            if matches!(plan, OperationPlan::ExtractFrame { .. }) {
                message.push_str("; the frame time may be past the end of the video, try time=0");
            }
            return Err(JobError { kind: ErrorKind::OutputMissing, message });
        }

        self.persist_output(&output, request.id(), plan.output_extension()).await
    }

    fn create_workdir(&self, id: JobId) -> std::result::Result<tempfile::TempDir, JobError> {
        let prefix = format!("job-{}-", id.short());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let created = match &self.config.work_dir {
            Some(root) => std::fs::create_dir_all(root).and_then(|_| builder.tempdir_in(root)),
            None => builder.tempdir(),
        };
        created.map_err(|e| JobError {
            kind: ErrorKind::InternalFault,
            message: format!("cannot create working directory: {}", e),
        })
    }

    /// Run one invocation under the deadline and cancellation token
    async fn execute(
        &self,
        command: &MediaCommand,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), JobError> {
        debug!("Executing media command: {} {:?}", command.binary_path, command.args);
        debug!("Description: {}", command.description);

        let mut child = command.to_command().spawn().map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::EngineNotFound
            } else {
                ErrorKind::InternalFault
            };
            JobError {
                kind,
                message: format!("failed to start {}: {}", command.binary_path, e),
            }
        })?;

        let max_lines = self.config.stderr_tail_lines;
        let max_line_len = self.config.stderr_line_max;
        let capture = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(DiagnosticTail::capture(stderr, max_lines, max_line_len)));
        let mut stdin = child.stdin.take();

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Outcome::DeadlineExpired,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Exited(status) => {
                drop(stdin.take());
                status
            }
            Outcome::DeadlineExpired => {
                warn!("{} exceeded its deadline, terminating", command.description);
                self.terminate(&mut child, stdin.take()).await;
                let tail = collect_tail(capture, max_lines, max_line_len).await;
                let mut err = deadline_error("while running the engine");
                append_tail(&mut err.message, &tail);
                return Err(err);
            }
            Outcome::Cancelled => {
                info!("{} cancelled, terminating", command.description);
                self.terminate(&mut child, stdin.take()).await;
                return Err(cancelled_error());
            }
        };

        let tail = collect_tail(capture, max_lines, max_line_len).await;
        let status = status.map_err(|e| JobError {
            kind: ErrorKind::InternalFault,
            message: format!("waiting for {} failed: {}", command.binary_path, e),
        })?;

        if !status.success() {
            let mut message = format!("{} failed ({})", command.description, status);
            if let Some(headline) = tail.headline() {
                message.push_str(&format!(": {}", headline));
            }
            append_tail(&mut message, &tail);
            return Err(JobError {
                kind: ErrorKind::Failed,
                message,
            });
        }

        Ok(())
    }

    /// Ask ffmpeg to quit with `q`, then kill it once the grace period runs out
    async fn terminate(&self, child: &mut Child, stdin: Option<ChildStdin>) {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(self.config.cancel_grace(), child.wait()).await {
            Ok(_) => debug!("Engine exited within the grace period"),
            Err(_) => {
                warn!("Engine ignored the quit request, killing it");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill engine process: {}", e);
                }
            }
        }
    }

    /// Move the artifact out of the working directory before it is deleted
    async fn persist_output(
        &self,
        output: &Path,
        id: JobId,
        extension: &str,
    ) -> std::result::Result<PathBuf, JobError> {
        let io_error = |e: std::io::Error| JobError {
            kind: ErrorKind::InternalFault,
            message: format!("cannot store output: {}", e),
        };

        fs::create_dir_all(&self.config.output_dir).await.map_err(io_error)?;
        let destination = self.config.output_dir.join(format!("{}.{}", id, extension));
        move_file(output, &destination).await.map_err(io_error)?;

        info!("Job {} output stored at {}", id, destination.display());
        Ok(destination)
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn run(&self, request: &JobRequest, deadline: Instant, cancel: CancellationToken) -> JobResult {
        let started = Instant::now();
        info!("Running {} for job {} from {}", request.operation(), request.id(), request.source());

        match self.run_job(request, deadline, &cancel).await {
            Ok(output) => JobResult::succeeded(request.id(), output, started.elapsed()),
            Err(err) => {
                debug!("Job {} attempt ended with {}: {}", request.id(), err.kind, err.message);
                JobResult::failed(request.id(), err.kind, err.message, started.elapsed())
            }
        }
    }

    fn check_availability(&self) -> Result<()> {
        let output = Command::new(&self.config.binary_path)
            .arg("-version")
            .output()
            .map_err(|e| MediaJobError::EngineNotFound(format!("{}: {}", self.config.binary_path, e)))?;

        if output.status.success() {
            info!("Media engine is available");
            Ok(())
        } else {
            Err(MediaJobError::EngineNotFound(format!(
                "{} -version exited with {}",
                self.config.binary_path, output.status
            )))
        }
    }

    async fn version_info(&self) -> Result<String> {
        let command = self.command_builder.version_check();
        let output = tokio::process::Command::new(&command.binary_path)
            .args(&command.args)
            .output()
            .await
            .map_err(|e| MediaJobError::EngineNotFound(format!("{}: {}", command.binary_path, e)))?;

        if output.status.success() {
            let version_info = String::from_utf8_lossy(&output.stdout);
            // First line carries the version
            let first_line = version_info.lines().next().unwrap_or("Unknown version");
            Ok(first_line.to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(MediaJobError::Media(format!("Media engine version check failed: {}", stderr)))
        }
    }
}

async fn collect_tail(
    capture: Option<tokio::task::JoinHandle<DiagnosticTail>>,
    max_lines: usize,
    max_line_len: usize,
) -> DiagnosticTail {
    let Some(mut handle) = capture else {
        return DiagnosticTail::new(max_lines, max_line_len);
    };
    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(_)) => DiagnosticTail::new(max_lines, max_line_len),
        Err(_) => {
            // A grandchild may still hold the pipe open.
            handle.abort();
            DiagnosticTail::new(max_lines, max_line_len)
        }
    }
}

fn append_tail(message: &mut String, tail: &DiagnosticTail) {
    let rendered = tail.render();
    if !rendered.is_empty() {
        message.push_str("\n--- engine stderr ---\n");
        message.push_str(&rendered);
    }
}

fn deadline_error(phase: &str) -> JobError {
    JobError {
        kind: ErrorKind::TimedOut,
        message: format!("deadline exceeded {}", phase),
    }
}

fn cancelled_error() -> JobError {
    JobError {
        kind: ErrorKind::Cancelled,
        message: "job was cancelled".to_string(),
    }
}

/// Rename, falling back to copy + remove across filesystems
pub(crate) async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}
