//! Mediaqueue Core Library
//!
//! A personal media-download queue: URLs are stored in a persistent queue,
//! their metadata is resolved in the background, and a bounded pool of
//! workers drives an external extraction engine (yt-dlp) for each item,
//! recording progress, pause, cancel and failure in the store.
//!
//! # Architecture
//!
//! - [`db`] - Database connection and schema management
//! - [`queue`] - Persistent queue store and item lifecycle
//! - [`config`] - User settings and application directories
//! - [`engine`] - Boundary to the extraction/download engine
//! - [`download`] - Worker pool, retries and per-item control

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod engine;
pub mod queue;

// Re-export commonly used types
pub use config::{AppPaths, ConfigError, Settings, SettingsStore};
pub use db::{Database, DbError};
pub use download::{DownloadManager, ManagerError, ManagerOptions, RetryPolicy};
pub use engine::{EngineConfig, EngineError, MediaEngine, YtDlpEngine};
pub use queue::{ItemUpdate, Queue, QueueError, QueueItem, QueueStatus};
