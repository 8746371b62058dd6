//! Download manager: bounded worker pool plus per-item lifecycle control.
//!
//! The manager owns the mapping from item id to its [`TaskControl`] and the
//! handle of its current execution. All state lives behind one mutex that is
//! never held across an `.await`, so control operations can be called from
//! any thread while workers run.
//!
//! # Concurrency Model
//!
//! - Each execution runs in its own Tokio task
//! - A semaphore permit is acquired before the engine is invoked
//! - Changing the concurrency swaps in a new semaphore; tasks still waiting
//!   on the old one move over to the new one, running tasks keep their permit
//! - Starting an item that already has an execution aborts the old one and
//!   the new execution waits for it to unwind before touching the store

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::control::TaskControl;
use super::metadata::{
    DEFAULT_METADATA_TIMEOUT, DEFAULT_THUMBNAIL_TIMEOUT, MetadataOutcome, ThumbnailFetcher,
    resolve_metadata,
};
use super::progress::DEFAULT_PROGRESS_INTERVAL;
use super::retry::RetryPolicy;
use super::worker::{WorkerContext, run_download};
use crate::config::{ConfigError, SettingsStore};
use crate::engine::MediaEngine;
use crate::queue::{ItemUpdate, Queue, QueueError, QueueStatus};

/// Error type for download manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Persisting settings failed.
    #[error("settings error: {0}")]
    Config(#[from] ConfigError),

    /// The thumbnail HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The URL was empty after trimming.
    #[error("cannot queue an empty URL")]
    EmptyUrl,

    /// Constructed outside a Tokio runtime.
    #[error("download manager must be created inside a Tokio runtime")]
    NoRuntime,

    /// [`DownloadManager::shutdown`] was already called.
    #[error("download manager has been shut down")]
    ShutDown,
}

/// Tunables for a [`DownloadManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub retry_policy: RetryPolicy,
    /// Minimum spacing between persisted progress writes.
    pub progress_interval: Duration,
    pub metadata_timeout: Duration,
    pub thumbnail_timeout: Duration,
    /// Directory receiving `<id>.<ext>` thumbnails.
    pub thumb_dir: PathBuf,
    /// Mark an item `error` when its metadata cannot be resolved and no
    /// execution has touched it yet.
    pub fail_unresolved_metadata: bool,
}

impl ManagerOptions {
    #[must_use]
    pub fn new(thumb_dir: impl Into<PathBuf>) -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            thumbnail_timeout: DEFAULT_THUMBNAIL_TIMEOUT,
            thumb_dir: thumb_dir.into(),
            fail_unresolved_metadata: false,
        }
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    #[must_use]
    pub fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    #[must_use]
    pub fn fail_unresolved_metadata(mut self, enabled: bool) -> Self {
        self.fail_unresolved_metadata = enabled;
        self
    }
}

#[derive(Debug)]
struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }
}

#[derive(Debug)]
struct TrackedTask {
    execution: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct ManagerState {
    pool: WorkerPool,
    controls: HashMap<i64, Arc<TaskControl>>,
    tasks: HashMap<i64, TrackedTask>,
    next_execution: u64,
    shut_down: bool,
}

struct Shared {
    ctx: WorkerContext,
    thumbnails: ThumbnailFetcher,
    metadata_timeout: Duration,
    fail_unresolved_metadata: bool,
    runtime: Handle,
    state: Mutex<ManagerState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a pool slot, following pool swaps. `None` after shutdown.
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        loop {
            let slots = {
                let state = self.state();
                if state.shut_down {
                    return None;
                }
                Arc::clone(&state.pool.slots)
            };
            if let Ok(permit) = slots.acquire_owned().await {
                return Some(permit);
            }
            debug!("worker pool replaced while waiting, retrying on the new pool");
        }
    }

    /// Drops the tracked handle of `id` if it still belongs to `execution`.
    fn finish(&self, id: i64, execution: u64) {
        let mut state = self.state();
        if state
            .tasks
            .get(&id)
            .is_some_and(|task| task.execution == execution)
        {
            state.tasks.remove(&id);
        }
    }

    fn is_tracked(&self, id: i64) -> bool {
        self.state().tasks.contains_key(&id)
    }
}

/// Schedules and controls downloads for a [`Queue`].
///
/// Cloning is cheap; clones share the same pool and controls.
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("DownloadManager")
            .field("concurrency", &state.pool.size)
            .field("active", &state.tasks.len())
            .field("shut_down", &state.shut_down)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager sized from the current `concurrent_downloads` setting.
    ///
    /// Must be called from within a Tokio runtime; the runtime is captured so
    /// later calls may come from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NoRuntime`] outside a runtime and
    /// [`ManagerError::HttpClient`] when the thumbnail client cannot be built.
    #[instrument(level = "debug", skip_all)]
    pub fn new(
        queue: Queue,
        engine: Arc<dyn MediaEngine>,
        settings: SettingsStore,
        options: ManagerOptions,
    ) -> Result<Self, ManagerError> {
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;
        let snapshot = settings.snapshot();
        let concurrency = snapshot.concurrent_downloads.max(1);
        let thumbnails = ThumbnailFetcher::new(
            options.thumb_dir.clone(),
            options.thumbnail_timeout,
            &snapshot.user_agent,
        )?;

        debug!(
            concurrency,
            max_attempts = options.retry_policy.max_attempts(),
            progress_interval_ms = options.progress_interval.as_millis(),
            "creating download manager"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                ctx: WorkerContext {
                    queue,
                    engine,
                    settings,
                    retry_policy: options.retry_policy,
                    progress_interval: options.progress_interval,
                },
                thumbnails,
                metadata_timeout: options.metadata_timeout,
                fail_unresolved_metadata: options.fail_unresolved_metadata,
                runtime,
                state: Mutex::new(ManagerState {
                    pool: WorkerPool::new(concurrency),
                    controls: HashMap::new(),
                    tasks: HashMap::new(),
                    next_execution: 0,
                    shut_down: false,
                }),
            }),
        })
    }

    #[must_use]
    pub fn queue(&self) -> &Queue {
        &self.shared.ctx.queue
    }

    #[must_use]
    pub fn settings(&self) -> &SettingsStore {
        &self.shared.ctx.settings
    }

    /// Current pool size.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.shared.state().pool.size
    }

    /// Number of executions currently tracked (running or waiting for a slot).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.state().tasks.len()
    }

    /// Whether item `id` has a tracked execution.
    #[must_use]
    pub fn is_active(&self, id: i64) -> bool {
        self.shared.is_tracked(id)
    }

    /// Adds `url` to the queue and resolves its metadata in the background.
    ///
    /// The item is not started. `format` defaults to the configured format.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::EmptyUrl`] for a blank URL and
    /// [`ManagerError::Queue`] when the insert fails.
    #[instrument(skip(self))]
    pub async fn queue_url(&self, url: &str, format: Option<&str>) -> Result<i64, ManagerError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ManagerError::EmptyUrl);
        }
        let format = match format.map(str::trim).filter(|f| !f.is_empty()) {
            Some(format) => format.to_string(),
            None => self.settings().snapshot().format,
        };

        let id = self.queue().insert(url, &format).await?;
        info!(item_id = id, url, "queued");
        self.spawn_metadata(id, url.to_string());
        Ok(id)
    }

    fn spawn_metadata(&self, id: i64, url: String) {
        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(async move {
            let Some(_slot) = shared.acquire_slot().await else {
                return;
            };
            let outcome = resolve_metadata(
                &shared.ctx,
                &shared.thumbnails,
                shared.metadata_timeout,
                id,
                &url,
            )
            .await;

            if let MetadataOutcome::Failed(error) = outcome
                && shared.fail_unresolved_metadata
            {
                let message = format!("could not resolve media: {error}");
                // Checked while the row is locked, so a concurrent start() either
                // rolls the mark back or waits for it to commit.
                let unclaimed = || !shared.is_tracked(id);
                match shared.ctx.queue.mark_unresolved(id, &message, unclaimed).await {
                    Ok(true) => info!(item_id = id, "marked unresolved item as error"),
                    Ok(false) => debug!(item_id = id, "item already in use, left as is"),
                    Err(e) => warn!(item_id = id, error = %e, "failed to mark item unresolved"),
                }
            }
        });
    }

    /// Starts (or restarts) a worker for item `id`.
    ///
    /// Any existing execution of the item is aborted first; the new one waits
    /// for it to unwind, so at most one worker runs per item.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ShutDown`] after [`shutdown`](Self::shutdown).
    #[instrument(skip(self))]
    pub fn start(&self, id: i64) -> Result<(), ManagerError> {
        let mut state = self.shared.state();
        if state.shut_down {
            return Err(ManagerError::ShutDown);
        }

        let previous = state.tasks.remove(&id).map(|task| {
            debug!(item_id = id, "aborting previous execution");
            task.handle.abort();
            task.handle
        });

        let control = Arc::clone(
            state
                .controls
                .entry(id)
                .or_insert_with(|| Arc::new(TaskControl::new())),
        );
        control.reset();

        state.next_execution += 1;
        let execution = state.next_execution;
        let shared = Arc::clone(&self.shared);

        let handle = self.shared.runtime.spawn(async move {
            if let Some(previous) = previous {
                // Cancelled JoinError is the expected result.
                let _ = previous.await;
            }
            let Some(_slot) = shared.acquire_slot().await else {
                debug!(item_id = id, "manager shut down before a slot was free");
                return;
            };
            run_download(&shared.ctx, id, &control).await;
            shared.finish(id, execution);
        });

        state.tasks.insert(id, TrackedTask { execution, handle });
        Ok(())
    }

    /// Starts every item whose status is queued, paused or error.
    ///
    /// Returns the ids that were started.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Queue`] when listing fails.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> Result<Vec<i64>, ManagerError> {
        let items = self.queue().list(None).await?;
        let mut started = Vec::new();
        for item in items.iter().filter(|item| item.status().is_restartable()) {
            self.start(item.id)?;
            started.push(item.id);
        }
        info!(count = started.len(), "started restartable items");
        Ok(started)
    }

    /// Requests that item `id` pause at its next progress tick.
    ///
    /// Returns false when the item has never been started by this manager.
    pub fn pause(&self, id: i64) -> bool {
        self.with_control(id, TaskControl::request_pause)
    }

    /// Requests that item `id` cancel at its next progress tick.
    pub fn cancel(&self, id: i64) -> bool {
        self.with_control(id, TaskControl::request_cancel)
    }

    pub fn pause_all(&self) {
        for control in self.controls() {
            control.request_pause();
        }
    }

    pub fn cancel_all(&self) {
        for control in self.controls() {
            control.request_cancel();
        }
    }

    fn with_control(&self, id: i64, request: impl FnOnce(&TaskControl)) -> bool {
        let control = self.shared.state().controls.get(&id).cloned();
        match control {
            Some(control) => {
                request(&control);
                true
            }
            None => {
                debug!(item_id = id, "no control registered");
                false
            }
        }
    }

    fn controls(&self) -> Vec<Arc<TaskControl>> {
        self.shared.state().controls.values().cloned().collect()
    }

    /// Resets item `id` to queued, clears its error and starts it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: i64) -> Result<(), ManagerError> {
        if self.queue().get(id).await?.is_none() {
            return Err(QueueError::ItemNotFound(id).into());
        }
        self.queue()
            .update(
                id,
                &ItemUpdate::new().status(QueueStatus::Queued).clear_errmsg(),
            )
            .await?;
        self.start(id)
    }

    /// Resizes the worker pool and persists the new size.
    ///
    /// Values below 1 are clamped to 1. Running executions keep their slot;
    /// executions still waiting move to the new pool.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Config`] when the setting cannot be saved.
    #[instrument(skip(self))]
    pub fn set_concurrency(&self, size: usize) -> Result<(), ManagerError> {
        let size = size.max(1);
        if self.concurrency() == size {
            return Ok(());
        }
        self.settings()
            .update(|settings| settings.concurrent_downloads = size)?;

        let old = {
            let mut state = self.shared.state();
            std::mem::replace(&mut state.pool, WorkerPool::new(size))
        };
        old.slots.close();
        info!(from = old.size, to = size, "worker pool resized");
        Ok(())
    }

    /// Stops accepting work and abandons every tracked execution.
    ///
    /// Does not wait for workers to finish. Aborted items keep their stored
    /// status; `downloading` rows are recovered as queued on the next start.
    pub fn shutdown(&self) {
        let tasks = {
            let mut state = self.shared.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.pool.slots.close();
            std::mem::take(&mut state.tasks)
        };
        for task in tasks.into_values() {
            task.handle.abort();
        }
        info!("download manager shut down");
    }
}
