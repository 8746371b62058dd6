//! Error types for the extraction/download engine boundary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`MediaEngine`](super::MediaEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine program could not be started.
    #[error(
        "failed to start {}: {source}\n  Suggestion: install yt-dlp or pass --engine-path",
        program.display()
    )]
    Spawn {
        /// The program that failed to launch.
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The engine ran and reported failure.
    #[error("engine failed (exit code {code:?}): {message}")]
    Failed {
        /// Process exit code, if it exited normally.
        code: Option<i32>,
        /// Most relevant diagnostic line from the engine.
        message: String,
    },

    /// The engine produced no output for longer than the stall timeout.
    #[error("engine stalled: no output for {0:?}")]
    Stalled(Duration),

    /// An operation exceeded its hard time limit.
    #[error("engine timed out after {0:?}")]
    Timeout(Duration),

    /// The engine's output could not be interpreted.
    #[error("invalid engine output: {0}")]
    InvalidOutput(String),

    /// The configuration was rejected before the engine was invoked.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Reading engine output failed.
    #[error("IO error talking to engine: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a failure from an exit code and diagnostic message.
    pub fn failed(code: Option<i32>, message: impl Into<String>) -> Self {
        Self::Failed {
            code,
            message: message.into(),
        }
    }
}
