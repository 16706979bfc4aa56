use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{MediaJobError, Result};
use crate::job::{ErrorKind, JobError, MediaSource};

/// Turns source references into files the engine can read
pub struct SourceResolver {
    client: Client,
    max_bytes: u64,
}

impl SourceResolver {
    pub fn new(max_bytes: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("media-jobs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(MediaJobError::Http)?;

        Ok(Self { client, max_bytes })
    }

    /// Local sources are used in place; remote ones are downloaded into `workdir`
    pub async fn resolve(
        &self,
        source: &MediaSource,
        index: usize,
        workdir: &Path,
    ) -> std::result::Result<PathBuf, JobError> {
        match source {
            MediaSource::Local(path) => {
                if fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false) {
                    Ok(path.clone())
                } else {
                    Err(JobError {
                        kind: ErrorKind::SourceUnavailable,
                        message: format!("source file not found: {}", path.display()),
                    })
                }
            }
            MediaSource::Remote(url) => {
                let ext = source.extension().unwrap_or_else(|| "bin".to_string());
                let target = workdir.join(format!("source-{}.{}", index, ext));
                self.download(url, &target).await?;
                Ok(target)
            }
        }
    }

    async fn download(&self, url: &str, target: &Path) -> std::result::Result<(), JobError> {
        info!("Fetching remote source {}", url);

        let mut response = self.client.get(url).send().await.map_err(|e| fetch_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JobError {
                kind: status_kind(status),
                message: format!("fetching {} failed: HTTP {}", url, status),
            });
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(too_large(url, self.max_bytes));
            }
        }

        let mut file = fs::File::create(target).await.map_err(|e| JobError {
            kind: ErrorKind::InternalFault,
            message: format!("cannot create {}: {}", target.display(), e),
        })?;

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| fetch_error(url, &e))? {
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(too_large(url, self.max_bytes));
            }
            file.write_all(&chunk).await.map_err(|e| JobError {
                kind: ErrorKind::InternalFault,
                message: format!("writing {} failed: {}", target.display(), e),
            })?;
        }
        file.flush().await.map_err(|e| JobError {
            kind: ErrorKind::InternalFault,
            message: format!("writing {} failed: {}", target.display(), e),
        })?;

        debug!("Fetched {} bytes from {}", written, url);
        Ok(())
    }
}

/// Server-side and throttling failures are worth another try; other client errors are not
fn status_kind(status: StatusCode) -> ErrorKind {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ErrorKind::SourceFetch
    } else {
        ErrorKind::SourceUnavailable
    }
}

fn fetch_error(url: &str, err: &reqwest::Error) -> JobError {
    let kind = if err.is_builder() || err.is_redirect() {
        ErrorKind::SourceUnavailable
    } else {
        ErrorKind::SourceFetch
    };
    JobError {
        kind,
        message: format!("fetching {} failed: {}", url, err),
    }
}

fn too_large(url: &str, max_bytes: u64) -> JobError {
    JobError {
        kind: ErrorKind::SourceUnavailable,
        message: format!("{} is larger than the {} byte limit", url, max_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(status_kind(StatusCode::BAD_GATEWAY), ErrorKind::SourceFetch);
        assert_eq!(status_kind(StatusCode::TOO_MANY_REQUESTS), ErrorKind::SourceFetch);
        assert_eq!(status_kind(StatusCode::NOT_FOUND), ErrorKind::SourceUnavailable);
        assert_eq!(status_kind(StatusCode::FORBIDDEN), ErrorKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn test_local_source_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"data").unwrap();

        let resolver = SourceResolver::new(1024).unwrap();
        let resolved = resolver.resolve(&MediaSource::local(&file), 0, dir.path()).await.unwrap();
        assert_eq!(resolved, file);

        let missing = resolver
            .resolve(&MediaSource::local(dir.path().join("gone.mp4")), 0, dir.path())
            .await
            .unwrap_err();
        assert_eq!(missing.kind, ErrorKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SourceResolver::new(1024).unwrap();
        // Port 9 on localhost is the discard service and is almost never listening.
        let err = resolver
            .resolve(&MediaSource::Remote("http://127.0.0.1:9/clip.mp4".to_string()), 0, dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SourceFetch);
        assert!(err.kind.is_retryable());
    }
}
