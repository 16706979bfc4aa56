use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{MediaJobError, Result};

/// Globally unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in file names and log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque requester identity owned by the bot front-end
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequesterId(String);

impl RequesterId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the input media lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Local(PathBuf),
    Remote(String),
}

impl MediaSource {
    pub fn local<P: AsRef<Path>>(path: P) -> Self {
        Self::Local(path.as_ref().to_path_buf())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// File extension of the source, if it has one
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            Self::Local(path) => path.file_name()?.to_string_lossy().to_string(),
            Self::Remote(url) => {
                let path = url.split(['?', '#']).next().unwrap_or_default();
                path.rsplit('/').next()?.to_string()
            }
        };
        let (_, ext) = name.rsplit_once('.')?;
        if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

impl FromStr for MediaSource {
    type Err = MediaJobError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MediaJobError::InvalidParameters("empty source reference".to_string()));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = reqwest::Url::parse(trimmed).map_err(|e| {
                MediaJobError::InvalidParameters(format!("invalid source URL '{}': {}", trimmed, e))
            })?;
            Ok(Self::Remote(url.to_string()))
        } else {
            Ok(Self::Local(PathBuf::from(trimmed)))
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

/// Requested media transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Convert,
    Trim,
    ExtractAudio,
    Mix,
    ExtractFrame,
    Resize,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::Trim => "trim",
            Self::ExtractAudio => "extract-audio",
            Self::Mix => "mix",
            Self::ExtractFrame => "extract-frame",
            Self::Resize => "resize",
        }
    }
}

impl FromStr for Operation {
    type Err = MediaJobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "convert" => Ok(Self::Convert),
            "trim" => Ok(Self::Trim),
            "extract-audio" => Ok(Self::ExtractAudio),
            "mix" => Ok(Self::Mix),
            "extract-frame" => Ok(Self::ExtractFrame),
            "resize" => Ok(Self::Resize),
            _ => Err(MediaJobError::InvalidParameters(format!(
                "Invalid operation '{}'. Valid operations: convert, trim, extract-audio, mix, extract-frame, resize",
                s
            ))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to transform one media artifact.
///
/// Fields are only settable through the builder methods, which consume the
/// request, so a submitted request can no longer change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    id: JobId,
    source: MediaSource,
    extra_sources: Vec<MediaSource>,
    operation: Operation,
    params: BTreeMap<String, String>,
    requester: RequesterId,
    submitted_at: DateTime<Utc>,
    timeout: Option<Duration>,
}

impl JobRequest {
    pub fn new(source: MediaSource, operation: Operation, requester: RequesterId) -> Self {
        Self {
            id: JobId::new(),
            source,
            extra_sources: Vec::new(),
            operation,
            params: BTreeMap::new(),
            requester,
            submitted_at: Utc::now(),
            timeout: None,
        }
    }

    pub fn with_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_extra_source(mut self, source: MediaSource) -> Self {
        self.extra_sources.push(source);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn source(&self) -> &MediaSource {
        &self.source
    }

    pub fn extra_sources(&self) -> &[MediaSource] {
        &self.extra_sources
    }

    /// Primary source followed by the extra sources
    pub fn sources(&self) -> impl Iterator<Item = &MediaSource> {
        std::iter::once(&self.source).chain(self.extra_sources.iter())
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn requester(&self) -> &RequesterId {
        &self.requester
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Terminal status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Coarse classification of everything that can go wrong with a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    QueueFull,
    QueueClosed,
    EngineNotFound,
    InvalidParameters,
    TimedOut,
    Failed,
    OutputMissing,
    Cancelled,
    InternalFault,
    /// Transient failure fetching a remote source
    SourceFetch,
    SourceUnavailable,
}

impl ErrorKind {
    /// Whether the scheduler may run the job again after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceFetch)
    }

    /// Status a job ends in when it fails with this kind
    pub fn status(&self) -> JobStatus {
        match self {
            Self::TimedOut => JobStatus::TimedOut,
            Self::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of a job, produced once by the worker that ran it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub output: Option<PathBuf>,
    pub error: Option<JobError>,
    pub duration: Duration,
    pub attempts: u32,
    pub from_cache: bool,
}

impl JobResult {
    pub fn succeeded(job_id: JobId, output: PathBuf, duration: Duration) -> Self {
        Self {
            job_id,
            status: JobStatus::Succeeded,
            output: Some(output),
            error: None,
            duration,
            attempts: 1,
            from_cache: false,
        }
    }

    pub fn failed<S: Into<String>>(job_id: JobId, kind: ErrorKind, message: S, duration: Duration) -> Self {
        Self {
            job_id,
            status: kind.status(),
            output: None,
            error: Some(JobError {
                kind,
                message: message.into(),
            }),
            duration,
            attempts: 1,
            from_cache: false,
        }
    }

    pub fn cancelled(job_id: JobId, duration: Duration) -> Self {
        Self::failed(job_id, ErrorKind::Cancelled, "job was cancelled", duration)
    }

    /// The same artifact reported for another job that was served by this one
    pub fn shared_with(&self, job_id: JobId, duration: Duration) -> Self {
        Self {
            job_id,
            status: self.status,
            output: self.output.clone(),
            error: self.error.clone(),
            duration,
            attempts: 0,
            from_cache: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_retryable(&self) -> bool {
        self.error_kind().is_some_and(|k| k.is_retryable())
    }

    /// Human-readable one-line summary for the requester
    pub fn summary(&self) -> String {
        match (&self.output, &self.error) {
            (Some(output), _) => format!("{}: {}", self.status, output.display()),
            (None, Some(err)) => format!("{} ({}): {}", self.status, err.kind, err.message),
            (None, None) => self.status.to_string(),
        }
    }
}
