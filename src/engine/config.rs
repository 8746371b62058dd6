//! Typed engine configuration, built from [`Settings`] and validated before use.

use std::path::PathBuf;
use std::time::Duration;

use super::EngineError;
use crate::config::Settings;

/// Output file name template, relative to the download directory.
pub const OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

/// Format used when only audio is wanted.
const AUDIO_ONLY_FORMAT: &str = "bestaudio/best";

/// Engine-internal retry counts (per request / per fragment).
const ENGINE_RETRIES: u32 = 3;

/// Per-socket I/O timeout handed to the engine.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Kill the engine after this long without any output.
const STALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Referer sent alongside the configured user agent.
const DEFAULT_REFERER: &str = "https://www.youtube.com/";

/// Post-processing steps applied after the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessor {
    EmbedThumbnail,
    EmbedSubtitles,
}

/// Everything the engine needs for one download.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Absolute output template (download dir joined with [`OUTPUT_TEMPLATE`]).
    pub output_template: String,
    /// Format-selection expression.
    pub format: String,
    pub audio_only: bool,
    /// Container for merged streams (`mp4`, or `mp3` when audio-only).
    pub merge_output_format: String,
    /// Extra HTTP headers, in order.
    pub http_headers: Vec<(String, String)>,
    pub cookies_file: Option<PathBuf>,
    pub player_client: String,
    pub retries: u32,
    pub fragment_retries: u32,
    pub socket_timeout: Duration,
    pub stall_timeout: Duration,
    pub postprocessors: Vec<PostProcessor>,
}

impl EngineConfig {
    /// Starts a builder seeded from the user's settings.
    #[must_use]
    pub fn builder(settings: &Settings) -> EngineConfigBuilder {
        EngineConfigBuilder {
            download_dir: settings.download_dir.clone(),
            format: settings.format.clone(),
            audio_only: settings.audio_only,
            user_agent: settings.user_agent.clone(),
            cookies_file: settings.cookies_file.clone(),
            player_client: settings.player_client.clone(),
            embed_thumbnail: settings.embed_thumbnail,
            embed_subtitles: settings.embed_subtitles,
            stall_timeout: STALL_TIMEOUT,
        }
    }

    /// Checks the values the engine cannot recover from.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for an empty format, output
    /// template or user agent, or a cookie file that does not exist.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.format.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "format expression is empty".to_string(),
            ));
        }
        if self.output_template.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "output template is empty".to_string(),
            ));
        }
        if self
            .http_headers
            .iter()
            .any(|(name, value)| name == "User-Agent" && value.trim().is_empty())
        {
            return Err(EngineError::InvalidConfig("user agent is empty".to_string()));
        }
        if let Some(cookies) = &self.cookies_file
            && !cookies.is_file()
        {
            return Err(EngineError::InvalidConfig(format!(
                "cookie file not found: {}",
                cookies.display()
            )));
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    download_dir: PathBuf,
    format: String,
    audio_only: bool,
    user_agent: String,
    cookies_file: Option<PathBuf>,
    player_client: String,
    embed_thumbnail: bool,
    embed_subtitles: bool,
    stall_timeout: Duration,
}

impl EngineConfigBuilder {
    /// Overrides the format expression (an item's stored format).
    #[must_use]
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    #[must_use]
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Produces a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] when [`EngineConfig::validate`] fails.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        let output_template = self
            .download_dir
            .join(OUTPUT_TEMPLATE)
            .to_string_lossy()
            .into_owned();

        let (format, merge_output_format) = if self.audio_only {
            (AUDIO_ONLY_FORMAT.to_string(), "mp3".to_string())
        } else {
            (self.format, "mp4".to_string())
        };

        let mut postprocessors = Vec::new();
        if self.embed_thumbnail {
            postprocessors.push(PostProcessor::EmbedThumbnail);
        }
        if self.embed_subtitles {
            postprocessors.push(PostProcessor::EmbedSubtitles);
        }

        let config = EngineConfig {
            output_template,
            format,
            audio_only: self.audio_only,
            merge_output_format,
            http_headers: vec![
                ("User-Agent".to_string(), self.user_agent),
                ("Referer".to_string(), DEFAULT_REFERER.to_string()),
            ],
            cookies_file: self.cookies_file,
            player_client: self.player_client,
            retries: ENGINE_RETRIES,
            fragment_retries: ENGINE_RETRIES,
            socket_timeout: SOCKET_TIMEOUT,
            stall_timeout: self.stall_timeout,
            postprocessors,
        };
        config.validate()?;
        Ok(config)
    }
}
