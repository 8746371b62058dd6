//! Boundary to the external media extraction/download engine.
//!
//! The queue never talks to yt-dlp directly. Workers hand a URL and an
//! [`EngineConfig`] to a [`MediaEngine`] and receive progress through a
//! [`ProgressSink`]. The sink's return value is how pause and cancel reach
//! the engine: a [`ProgressSignal::Stop`] makes the engine abandon the
//! transfer and report [`DownloadOutcome::Interrupted`] instead of an error.

use std::path::PathBuf;

use async_trait::async_trait;

mod config;
mod error;
mod ytdlp;

pub use config::{EngineConfig, EngineConfigBuilder, OUTPUT_TEMPLATE, PostProcessor};
pub use error::EngineError;
pub use ytdlp::{YtDlpEngine, parse_metadata, parse_progress_line};

/// Why a running download was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Pause,
    Cancel,
}

/// Answer returned by a [`ProgressSink`] for every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSignal {
    Continue,
    Stop(Interrupt),
}

/// One progress update while bytes are flowing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressTick {
    pub downloaded_bytes: u64,
    /// Exact or estimated total, when known.
    pub total_bytes: Option<u64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Seconds remaining.
    pub eta: Option<i64>,
    pub title: Option<String>,
}

/// Events emitted by an engine during [`MediaEngine::download`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Downloading(ProgressTick),
    /// The output file is in its final location.
    Finished { filepath: Option<PathBuf> },
}

/// How a download call ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Finished { filepath: Option<PathBuf> },
    Interrupted(Interrupt),
}

/// Metadata returned by [`MediaEngine::extract_info`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    /// Length in whole seconds.
    pub duration: Option<i64>,
    /// Thumbnail URL.
    pub thumbnail: Option<String>,
}

/// Receives progress events from an engine.
#[async_trait]
pub trait ProgressSink: Send {
    async fn report(&mut self, event: ProgressEvent) -> ProgressSignal;
}

/// An extraction/download backend.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Resolves metadata for `url` without downloading it.
    async fn extract_info(&self, url: &str) -> Result<MediaInfo, EngineError>;

    /// Downloads `url` to disk, reporting progress through `sink`.
    ///
    /// Returns [`DownloadOutcome::Interrupted`] when the sink asked to stop.
    async fn download(
        &self,
        url: &str,
        config: &EngineConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<DownloadOutcome, EngineError>;
}
