//! Download orchestration: worker pool, per-item control, retries.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mediaqueue_core::config::{Settings, SettingsStore};
//! use mediaqueue_core::download::{DownloadManager, ManagerOptions};
//! use mediaqueue_core::engine::YtDlpEngine;
//! use mediaqueue_core::queue::Queue;
//! use mediaqueue_core::Database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let manager = DownloadManager::new(
//!     Queue::new(db),
//!     Arc::new(YtDlpEngine::new()),
//!     SettingsStore::in_memory(Settings::default()),
//!     ManagerOptions::new("./thumbs"),
//! )?;
//! let id = manager.queue_url("https://example.com/watch?v=abc", None).await?;
//! manager.start(id)?;
//! # Ok(())
//! # }
//! ```

mod control;
mod manager;
mod metadata;
mod progress;
mod retry;
mod worker;

pub use control::TaskControl;
pub use manager::{DownloadManager, ManagerError, ManagerOptions};
pub use metadata::{
    DEFAULT_METADATA_TIMEOUT, DEFAULT_THUMBNAIL_TIMEOUT, ThumbnailError, ThumbnailFetcher,
};
pub use progress::{DEFAULT_PROGRESS_INTERVAL, ProgressGate};
pub use retry::{DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error};
