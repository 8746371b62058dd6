//! [`MediaEngine`] backed by the `yt-dlp` command-line program.
//!
//! Progress is read line by line from the child's output using a custom
//! progress template, so the parser never has to understand yt-dlp's
//! human-readable output. The final file path comes from an `after_move`
//! print.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use super::{
    DownloadOutcome, EngineConfig, EngineError, MediaEngine, MediaInfo, PostProcessor,
    ProgressEvent, ProgressSignal, ProgressSink, ProgressTick,
};

const DEFAULT_PROGRAM: &str = "yt-dlp";

/// Marker prefix of progress lines.
const PROGRESS_MARKER: &str = "[mq]";

/// Marker prefix of the final-path line.
const FILE_MARKER: &str = "[mq-file] ";

const PROGRESS_TEMPLATE: &str = "download:[mq] %(progress.downloaded_bytes)s \
     %(progress.total_bytes)s %(progress.total_bytes_estimate)s \
     %(progress.speed)s %(progress.eta)s %(info.title)s";

const FILE_TEMPLATE: &str = "after_move:[mq-file] %(filepath)s";

/// Stderr lines kept for error reporting.
const STDERR_TAIL: usize = 20;

const LINE_BUFFER: usize = 64;

#[allow(clippy::expect_used)]
static PROGRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[mq\] (\S+) (\S+) (\S+) (\S+) (\S+)(?: (.*))?$")
        .expect("progress regex is valid") // Static pattern, safe to panic
});

/// Runs `yt-dlp` as a child process.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    program: PathBuf,
    base_args: Vec<String>,
}

impl Default for YtDlpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpEngine {
    /// Uses `yt-dlp` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// Arguments placed before every invocation, e.g. `-m yt_dlp` when the
    /// program is a Python interpreter.
    #[must_use]
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> EngineError {
        EngineError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    #[instrument(skip(self), fields(program = %self.program.display()))]
    async fn extract_info(&self, url: &str) -> Result<MediaInfo, EngineError> {
        let output = self
            .command()
            .args([
                "--dump-single-json",
                "--skip-download",
                "--flat-playlist",
                "--no-warnings",
                "--",
                url,
            ])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<String> = stderr.lines().map(str::to_string).collect();
            return Err(EngineError::failed(
                output.status.code(),
                failure_message(&lines, output.status),
            ));
        }

        parse_metadata(&String::from_utf8_lossy(&output.stdout))
    }

    #[instrument(skip(self, config, sink), fields(program = %self.program.display()))]
    async fn download(
        &self,
        url: &str,
        config: &EngineConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<DownloadOutcome, EngineError> {
        let args = download_args(url, config);
        debug!(?args, "starting engine");

        let mut child = self
            .command()
            .args(&args)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::InvalidOutput("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::InvalidOutput("stderr was not captured".to_string()))?;

        // yt-dlp writes progress to stderr in quiet mode, so both pipes are parsed.
        let (tx, mut rx) = mpsc::channel(LINE_BUFFER);
        let readers = [
            tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone())),
            tokio::spawn(forward_lines(stderr, Stream::Stderr, tx)),
        ];
        let stop_readers = || readers.iter().for_each(JoinHandle::abort);

        let mut stderr_tail = VecDeque::with_capacity(STDERR_TAIL);
        let mut filepath = None;

        loop {
            let Ok(next) = tokio::time::timeout(config.stall_timeout, rx.recv()).await else {
                warn!(timeout = ?config.stall_timeout, "engine stalled, killing");
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "kill after stall failed");
                }
                stop_readers();
                return Err(EngineError::Stalled(config.stall_timeout));
            };
            let Some((stream, line)) = next else {
                break;
            };

            if let Some(tick) = parse_progress_line(&line) {
                if let ProgressSignal::Stop(interrupt) =
                    sink.report(ProgressEvent::Downloading(tick)).await
                {
                    debug!(?interrupt, "stopping engine on request");
                    if let Err(e) = child.kill().await {
                        debug!(error = %e, "kill on interrupt failed");
                    }
                    stop_readers();
                    return Ok(DownloadOutcome::Interrupted(interrupt));
                }
            } else if let Some(path) = line.strip_prefix(FILE_MARKER) {
                let path = PathBuf::from(path.trim());
                sink.report(ProgressEvent::Finished {
                    filepath: Some(path.clone()),
                })
                .await;
                filepath = Some(path);
            } else if stream == Stream::Stderr {
                trace!(line = %line, "engine stderr");
                if stderr_tail.len() == STDERR_TAIL {
                    stderr_tail.pop_front();
                }
                stderr_tail.push_back(line);
            } else {
                trace!(line = %line, "engine output");
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(DownloadOutcome::Finished { filepath })
        } else {
            let stderr_lines: Vec<String> = stderr_tail.into();
            Err(EngineError::failed(
                status.code(),
                failure_message(&stderr_lines, status),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).await.is_err() {
            break;
        }
    }
}

/// Builds the argument list for one download of `url`.
fn download_args(url: &str, config: &EngineConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "--newline",
        "--no-colors",
        "--continue",
        "--progress",
        "--progress-template",
        PROGRESS_TEMPLATE,
        "--print",
        FILE_TEMPLATE,
        "-f",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    args.push(config.format.clone());
    args.push("-o".to_string());
    args.push(config.output_template.clone());

    if config.audio_only {
        args.extend([
            "-x".to_string(),
            "--audio-format".to_string(),
            config.merge_output_format.clone(),
        ]);
    } else {
        args.extend([
            "--merge-output-format".to_string(),
            config.merge_output_format.clone(),
        ]);
    }

    args.extend([
        "--retries".to_string(),
        config.retries.to_string(),
        "--fragment-retries".to_string(),
        config.fragment_retries.to_string(),
        "--socket-timeout".to_string(),
        config.socket_timeout.as_secs().to_string(),
        "--extractor-args".to_string(),
        format!("youtube:player_client={}", config.player_client),
    ]);

    for (name, value) in &config.http_headers {
        args.push("--add-header".to_string());
        args.push(format!("{name}:{value}"));
    }
    if let Some(cookies) = &config.cookies_file {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }
    for postprocessor in &config.postprocessors {
        match postprocessor {
            PostProcessor::EmbedThumbnail => args.push("--embed-thumbnail".to_string()),
            PostProcessor::EmbedSubtitles => {
                args.push("--write-subs".to_string());
                args.push("--embed-subs".to_string());
            }
        }
    }

    args.push("--".to_string());
    args.push(url.to_string());
    args
}

/// Parses a line produced by the progress template.
///
/// Returns `None` for any other line, or when the downloaded byte count is
/// not available.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_progress_line(line: &str) -> Option<ProgressTick> {
    if !line.starts_with(PROGRESS_MARKER) {
        return None;
    }
    let caps = PROGRESS_PATTERN.captures(line.trim_end())?;
    let field = |i: usize| caps.get(i).map_or("NA", |m| m.as_str());

    let downloaded = number(field(1))?;
    let total = number(field(2)).or_else(|| number(field(3)));
    let title = caps
        .get(6)
        .map(|m| m.as_str().trim())
        .filter(|t| !t.is_empty() && *t != "NA")
        .map(str::to_string);

    Some(ProgressTick {
        downloaded_bytes: downloaded as u64,
        total_bytes: total.map(|t| t as u64),
        speed: number(field(4)),
        eta: number(field(5)).map(|e| e.round() as i64),
        title,
    })
}

/// Parses a numeric template field; `NA` and `None` mean missing.
fn number(raw: &str) -> Option<f64> {
    match raw {
        "NA" | "None" => None,
        _ => raw
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite() && *value >= 0.0),
    }
}

/// Parses `--dump-single-json` output.
///
/// # Errors
///
/// Returns [`EngineError::InvalidOutput`] when the output is not a JSON object.
pub fn parse_metadata(json: &str) -> Result<MediaInfo, EngineError> {
    let value: Value = serde_json::from_str(json.trim())
        .map_err(|e| EngineError::InvalidOutput(format!("metadata is not JSON: {e}")))?;
    let Some(object) = value.as_object() else {
        return Err(EngineError::InvalidOutput(
            "metadata is not a JSON object".to_string(),
        ));
    };

    let text = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    #[allow(clippy::cast_possible_truncation)]
    let duration = object
        .get("duration")
        .and_then(Value::as_f64)
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| d.round() as i64);

    let thumbnail = text("thumbnail").or_else(|| {
        object
            .get("thumbnails")
            .and_then(Value::as_array)
            .and_then(|thumbs| thumbs.iter().rev().find_map(|t| t.get("url")))
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    Ok(MediaInfo {
        title: text("title"),
        uploader: text("uploader")
            .or_else(|| text("channel"))
            .or_else(|| text("uploader_id")),
        duration,
        thumbnail,
    })
}

/// Picks the most useful diagnostic from the engine's stderr.
fn failure_message(stderr: &[String], status: ExitStatus) -> String {
    stderr
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| stderr.iter().rev().find(|line| !line.trim().is_empty()))
        .map_or_else(|| format!("yt-dlp exited with {status}"), |line| line.trim().to_string())
}
