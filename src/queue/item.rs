//! Queue item types, status lifecycle, and partial updates.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a worker, or a worker is about to start transferring.
    Queued,
    /// A worker is transferring content.
    Downloading,
    /// Interrupted by a pause request. Resumable.
    Paused,
    /// Content fetched and post-processed.
    Completed,
    /// Failed after all retries exhausted. Resumable.
    Error,
    /// Interrupted by a cancel request.
    Canceled,
}

impl QueueStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Downloading,
        Self::Paused,
        Self::Completed,
        Self::Error,
        Self::Canceled,
    ];

    /// Statuses removed by `clear_history`.
    pub const HISTORY: [Self; 3] = [Self::Completed, Self::Error, Self::Canceled];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    /// True for statuses that `start_all` picks up again.
    #[must_use]
    pub fn is_restartable(self) -> bool {
        matches!(self, Self::Queued | Self::Paused | Self::Error)
    }

    /// True once an execution has ended and nothing will write to the item
    /// until it is started again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Paused | Self::Error | Self::Canceled
        )
    }

    /// Whether a store write may move an item from `self` to `next`.
    ///
    /// Terminal statuses only leave through `Queued`; rewriting the current
    /// status is always allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next || next == Self::Queued {
            return true;
        }
        match self {
            Self::Queued | Self::Downloading => matches!(
                next,
                Self::Downloading | Self::Completed | Self::Paused | Self::Canceled | Self::Error
            ),
            Self::Paused | Self::Completed | Self::Error | Self::Canceled => false,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("invalid queue status: {s}")),
        }
    }
}

/// A single row of the download queue.
#[derive(Debug, Clone, FromRow)]
pub struct QueueItem {
    /// Store-assigned identity, never reused.
    pub id: i64,
    /// Source URL handed to the engine.
    pub url: String,
    /// Title from metadata resolution or the engine's progress reports.
    pub title: Option<String>,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Final output path once completed.
    pub filepath: Option<String>,
    /// Insert time, unix seconds.
    pub added_at: Option<f64>,
    /// Last mutation time, unix seconds.
    pub updated_at: Option<f64>,
    pub total_bytes: Option<i64>,
    pub downloaded_bytes: Option<i64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Seconds remaining.
    pub eta: Option<i64>,
    /// Human-readable failure, only set while status is `error`.
    pub errmsg: Option<String>,
    /// Format-selection expression for the engine.
    pub format: Option<String>,
    /// Ordering key for listing.
    pub position: i64,
    /// Local thumbnail file.
    pub thumb_path: Option<String>,
    pub uploader: Option<String>,
    /// Media duration in seconds.
    pub duration: Option<i64>,
}

impl QueueItem {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Queued` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        self.status_str.parse().unwrap_or(QueueStatus::Queued)
    }

    /// Title if resolved, otherwise the URL.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }

    /// Completed fraction in `0.0..=1.0` when both byte counters are known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_fraction(&self) -> Option<f64> {
        let total = self.total_bytes.filter(|t| *t > 0)?;
        let done = self.downloaded_bytes?;
        Some((done as f64 / total as f64).clamp(0.0, 1.0))
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem {{ id: {}, url: {}, status: {} }}",
            self.id,
            self.url,
            self.status()
        )
    }
}

/// Partial update of a queue row. Unset fields are left untouched.
///
/// Built with chained setters:
///
/// ```
/// use mediaqueue_core::{ItemUpdate, QueueStatus};
///
/// let update = ItemUpdate::new()
///     .status(QueueStatus::Queued)
///     .clear_errmsg();
/// assert!(!update.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub status: Option<QueueStatus>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<i64>,
    pub filepath: Option<String>,
    pub total_bytes: Option<i64>,
    pub downloaded_bytes: Option<i64>,
    pub speed: Option<f64>,
    pub eta: Option<i64>,
    /// `Some(None)` clears the stored message.
    pub errmsg: Option<Option<String>>,
    pub format: Option<String>,
    pub thumb_path: Option<String>,
}

impl ItemUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: QueueStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn uploader(mut self, uploader: impl Into<String>) -> Self {
        self.uploader = Some(uploader.into());
        self
    }

    #[must_use]
    pub fn duration(mut self, seconds: i64) -> Self {
        self.duration = Some(seconds);
        self
    }

    #[must_use]
    pub fn filepath(mut self, path: impl Into<String>) -> Self {
        self.filepath = Some(path.into());
        self
    }

    #[must_use]
    pub fn total_bytes(mut self, bytes: i64) -> Self {
        self.total_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn downloaded_bytes(mut self, bytes: i64) -> Self {
        self.downloaded_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn speed(mut self, bytes_per_sec: f64) -> Self {
        self.speed = Some(bytes_per_sec);
        self
    }

    #[must_use]
    pub fn eta(mut self, seconds: i64) -> Self {
        self.eta = Some(seconds);
        self
    }

    #[must_use]
    pub fn errmsg(mut self, message: impl Into<String>) -> Self {
        self.errmsg = Some(Some(message.into()));
        self
    }

    #[must_use]
    pub fn clear_errmsg(mut self) -> Self {
        self.errmsg = Some(None);
        self
    }

    #[must_use]
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    #[must_use]
    pub fn thumb_path(mut self, path: impl Into<String>) -> Self {
        self.thumb_path = Some(path.into());
        self
    }

    /// True when no field is set; applying it is a no-op.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_item(status: &str) -> QueueItem {
        QueueItem {
            id: 1,
            url: "https://example.com/watch?v=abc".to_string(),
            title: None,
            status_str: status.to_string(),
            filepath: None,
            added_at: Some(1.0),
            updated_at: Some(1.0),
            total_bytes: None,
            downloaded_bytes: None,
            speed: None,
            eta: None,
            errmsg: None,
            format: Some("best".to_string()),
            position: 1,
            thumb_path: None,
            uploader: None,
            duration: None,
        }
    }

    // ==================== QueueStatus Tests ====================

    #[test]
    fn test_queue_status_string_roundtrip() {
        for status in QueueStatus::ALL {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
            assert_eq!(status.to_string(), status.as_str());
        }
    }

    #[test]
    fn test_queue_status_from_str_invalid() {
        let result = "pending".parse::<QueueStatus>();
        assert!(result.unwrap_err().contains("invalid queue status"));
    }

    #[test]
    fn test_queue_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&QueueStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }

    #[test]
    fn test_restartable_statuses() {
        assert!(QueueStatus::Queued.is_restartable());
        assert!(QueueStatus::Paused.is_restartable());
        assert!(QueueStatus::Error.is_restartable());
        assert!(!QueueStatus::Canceled.is_restartable());
        assert!(!QueueStatus::Completed.is_restartable());
        assert!(!QueueStatus::Downloading.is_restartable());
    }

    #[test]
    fn test_worker_lifecycle_transitions_allowed() {
        use QueueStatus::*;
        assert!(Queued.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Completed));
        assert!(Downloading.can_transition_to(Paused));
        assert!(Downloading.can_transition_to(Canceled));
        assert!(Downloading.can_transition_to(Error));
        assert!(Paused.can_transition_to(Queued));
        assert!(Error.can_transition_to(Queued));
        assert!(Downloading.can_transition_to(Downloading));
    }

    #[test]
    fn test_terminal_statuses_only_leave_through_queued() {
        use QueueStatus::*;
        for terminal in [Paused, Completed, Error, Canceled] {
            for next in QueueStatus::ALL {
                let allowed = terminal.can_transition_to(next);
                assert_eq!(
                    allowed,
                    next == Queued || next == terminal,
                    "{terminal} -> {next}"
                );
            }
        }
    }

    // ==================== QueueItem Tests ====================

    #[test]
    fn test_queue_item_status_fallback_on_invalid() {
        assert_eq!(sample_item("garbage").status(), QueueStatus::Queued);
        assert_eq!(sample_item("paused").status(), QueueStatus::Paused);
    }

    #[test]
    fn test_display_name_prefers_title() {
        let mut item = sample_item("queued");
        assert_eq!(item.display_name(), "https://example.com/watch?v=abc");
        item.title = Some("A Video".to_string());
        assert_eq!(item.display_name(), "A Video");
    }

    #[test]
    fn test_progress_fraction() {
        let mut item = sample_item("downloading");
        assert!(item.progress_fraction().is_none());
        item.total_bytes = Some(200);
        item.downloaded_bytes = Some(50);
        assert!((item.progress_fraction().unwrap() - 0.25).abs() < f64::EPSILON);
        item.total_bytes = Some(0);
        assert!(item.progress_fraction().is_none());
    }

    // ==================== ItemUpdate Tests ====================

    #[test]
    fn test_item_update_default_is_empty() {
        assert!(ItemUpdate::new().is_empty());
    }

    #[test]
    fn test_item_update_clear_errmsg_is_not_empty() {
        let update = ItemUpdate::new().clear_errmsg();
        assert!(!update.is_empty());
        assert_eq!(update.errmsg, Some(None));
    }
}
