//! Background metadata resolution for newly queued items.
//!
//! Resolution is best-effort: a failure is logged and the item stays
//! downloadable. Thumbnails are fetched over HTTP and stored as
//! `<thumb_dir>/<item id>.<ext>`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::worker::WorkerContext;
use crate::engine::{EngineError, MediaInfo};
use crate::queue::ItemUpdate;

/// Default hard limit for metadata extraction.
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(60);

/// Default hard limit for a thumbnail fetch.
pub const DEFAULT_THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(15);

/// Thumbnails larger than this are discarded.
const MAX_THUMBNAIL_BYTES: u64 = 10 * 1024 * 1024;

const THUMBNAIL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];

/// Errors from fetching a thumbnail.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("invalid thumbnail URL: {0}")]
    InvalidUrl(String),

    #[error("thumbnail request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("thumbnail request returned HTTP {0}")]
    Status(u16),

    #[error("thumbnail exceeds {MAX_THUMBNAIL_BYTES} bytes")]
    TooLarge,

    #[error("failed to write thumbnail {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Downloads thumbnails into a directory.
#[derive(Debug, Clone)]
pub struct ThumbnailFetcher {
    client: Client,
    dir: PathBuf,
}

impl ThumbnailFetcher {
    /// Builds a fetcher whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the HTTP client cannot be constructed.
    pub fn new(dir: PathBuf, timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(user_agent)
            .gzip(true)
            .build()?;
        Ok(Self { client, dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetches `thumbnail_url` and saves it as `<dir>/<id>.<ext>`.
    ///
    /// # Errors
    ///
    /// Returns [`ThumbnailError`] for bad URLs, non-success responses,
    /// oversized bodies and write failures. A partial file is removed.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn fetch(&self, id: i64, thumbnail_url: &str) -> Result<PathBuf, ThumbnailError> {
        let url = Url::parse(thumbnail_url)
            .map_err(|_| ThumbnailError::InvalidUrl(thumbnail_url.to_string()))?;
        let path = self.dir.join(format!("{id}.{}", thumbnail_extension(&url)));

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ThumbnailError::Status(status.as_u16()));
        }
        if response
            .content_length()
            .is_some_and(|len| len > MAX_THUMBNAIL_BYTES)
        {
            return Err(ThumbnailError::TooLarge);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ThumbnailError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let result = write_body(response, &path).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        result.map(|()| path)
    }
}

async fn write_body(response: reqwest::Response, path: &Path) -> Result<(), ThumbnailError> {
    let io_err = |source| ThumbnailError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > MAX_THUMBNAIL_BYTES {
            return Err(ThumbnailError::TooLarge);
        }
        file.write_all(&chunk).await.map_err(io_err)?;
    }
    file.flush().await.map_err(io_err)?;
    Ok(())
}

/// Picks a file extension from the URL path, defaulting to `jpg`.
fn thumbnail_extension(url: &Url) -> String {
    Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| THUMBNAIL_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| "jpg".to_string())
}

/// Outcome of resolving metadata for one item.
#[derive(Debug)]
pub(crate) enum MetadataOutcome {
    Resolved,
    Failed(EngineError),
}

/// Extracts metadata for item `id` and writes whatever was found.
#[instrument(skip(ctx, thumbnails), fields(item_id = id))]
pub(crate) async fn resolve_metadata(
    ctx: &WorkerContext,
    thumbnails: &ThumbnailFetcher,
    timeout: Duration,
    id: i64,
    url: &str,
) -> MetadataOutcome {
    let info = match tokio::time::timeout(timeout, ctx.engine.extract_info(url)).await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            warn!(error = %e, "metadata extraction failed");
            return MetadataOutcome::Failed(e);
        }
        Err(_) => {
            warn!(?timeout, "metadata extraction timed out");
            return MetadataOutcome::Failed(EngineError::Timeout(timeout));
        }
    };

    let MediaInfo {
        title,
        uploader,
        duration,
        thumbnail,
    } = info;

    let mut update = ItemUpdate::new();
    if let Some(title) = title {
        update = update.title(title);
    }
    if let Some(uploader) = uploader {
        update = update.uploader(uploader);
    }
    if let Some(duration) = duration {
        update = update.duration(duration);
    }
    if let Some(thumbnail_url) = thumbnail {
        match thumbnails.fetch(id, &thumbnail_url).await {
            Ok(path) => update = update.thumb_path(path.to_string_lossy()),
            Err(e) => debug!(error = %e, "thumbnail not saved"),
        }
    }

    if !update.is_empty() {
        ctx.persist(id, update).await;
    }
    info!("metadata resolved");
    MetadataOutcome::Resolved
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn fetcher(dir: &Path) -> ThumbnailFetcher {
        ThumbnailFetcher::new(dir.to_path_buf(), Duration::from_secs(5), "test-agent").unwrap()
    }

    #[test]
    fn test_thumbnail_extension_inference() {
        let ext = |u: &str| thumbnail_extension(&Url::parse(u).unwrap());
        assert_eq!(ext("https://i.example/vi/x/maxres.webp"), "webp");
        assert_eq!(ext("https://i.example/vi/x/hq.JPG?sqp=1"), "jpg");
        assert_eq!(ext("https://i.example/vi/x/thumb"), "jpg");
        assert_eq!(ext("https://i.example/vi/x/thumb.php"), "jpg");
    }

    #[tokio::test]
    async fn test_fetch_writes_file_named_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/t/cover.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG-data".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let saved = fetcher(dir.path())
            .fetch(42, &format!("{}/t/cover.png", server.uri()))
            .await
            .unwrap();

        assert_eq!(saved, dir.path().join("42.png"));
        assert_eq!(std::fs::read(&saved).unwrap(), b"\x89PNG-data");
    }

    #[tokio::test]
    async fn test_fetch_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let result = fetcher(dir.path())
            .fetch(1, &format!("{}/missing.jpg", server.uri()))
            .await;
        assert!(matches!(result, Err(ThumbnailError::Status(404))));
        assert!(!dir.path().join("1.jpg").exists());
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_url() {
        let dir = tempfile::tempdir().unwrap();
        let result = fetcher(dir.path()).fetch(1, "not a url").await;
        assert!(matches!(result, Err(ThumbnailError::InvalidUrl(_))));
    }
}
