//! One execution of one queue item: engine call, retries, progress persistence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::control::TaskControl;
use super::progress::ProgressGate;
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use crate::config::SettingsStore;
use crate::engine::{
    DownloadOutcome, EngineConfig, EngineError, Interrupt, MediaEngine, ProgressEvent,
    ProgressSignal, ProgressSink,
};
use crate::queue::{ItemUpdate, Queue, QueueError, QueueStatus};

/// Collaborators shared by every worker of a manager.
pub(crate) struct WorkerContext {
    pub(crate) queue: Queue,
    pub(crate) engine: Arc<dyn MediaEngine>,
    pub(crate) settings: SettingsStore,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) progress_interval: Duration,
}

impl WorkerContext {
    /// Best-effort status write; a failed write is logged, never fatal.
    ///
    /// A write that hit a busy or locked database is tried once more.
    pub(crate) async fn persist(&self, id: i64, update: ItemUpdate) {
        let mut attempt = 1;
        loop {
            match self.queue.update(id, &update).await {
                Ok(()) => return,
                Err(e) if should_retry_write(&e, attempt) => {
                    debug!(item_id = id, attempt, error = %e, "store busy, retrying write");
                    attempt += 1;
                    tokio::time::sleep(BUSY_WRITE_DELAY).await;
                }
                Err(e) => {
                    warn!(
                        item_id = id,
                        kind = ?e.database_kind(),
                        error = %e,
                        "failed to persist item update"
                    );
                    return;
                }
            }
        }
    }
}

/// Attempts for one store write under busy/locked contention.
const MAX_WRITE_ATTEMPTS: u32 = 2;

const BUSY_WRITE_DELAY: Duration = Duration::from_millis(100);

fn should_retry_write(error: &QueueError, attempt: u32) -> bool {
    error.is_busy_or_locked() && attempt < MAX_WRITE_ATTEMPTS
}

/// Writes progress into the store and relays the item's stop flags.
struct StoreSink<'a> {
    ctx: &'a WorkerContext,
    id: i64,
    control: &'a TaskControl,
    gate: ProgressGate,
}

#[async_trait]
impl<'a> ProgressSink for StoreSink<'a> {
    async fn report(&mut self, event: ProgressEvent) -> ProgressSignal {
        match event {
            ProgressEvent::Downloading(tick) => {
                let signal = self.control.signal();
                if signal != ProgressSignal::Continue {
                    return signal;
                }
                if !self.gate.admit(tick.downloaded_bytes, Instant::now()) {
                    return ProgressSignal::Continue;
                }

                let mut update = ItemUpdate::new()
                    .status(QueueStatus::Downloading)
                    .downloaded_bytes(saturating_i64(tick.downloaded_bytes));
                if let Some(total) = tick.total_bytes {
                    update = update.total_bytes(saturating_i64(total));
                }
                if let Some(speed) = tick.speed {
                    update = update.speed(speed);
                }
                if let Some(eta) = tick.eta {
                    update = update.eta(eta);
                }
                if let Some(title) = tick.title {
                    update = update.title(title);
                }
                self.ctx.persist(self.id, update).await;
                ProgressSignal::Continue
            }
            // A finished file is not a finished item: playlists report one per
            // entry and the process can still fail afterwards.
            ProgressEvent::Finished { filepath } => {
                if let Some(path) = filepath {
                    self.ctx
                        .persist(self.id, ItemUpdate::new().filepath(path.to_string_lossy()))
                        .await;
                }
                ProgressSignal::Continue
            }
        }
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn interrupt_status(interrupt: Interrupt) -> QueueStatus {
    match interrupt {
        Interrupt::Pause => QueueStatus::Paused,
        Interrupt::Cancel => QueueStatus::Canceled,
    }
}

/// Runs one execution of item `id` to a resting state.
///
/// Returns the status written at the end, or `None` when the item no longer
/// exists.
#[instrument(skip(ctx, control), fields(item_id = id))]
pub(crate) async fn run_download(
    ctx: &WorkerContext,
    id: i64,
    control: &TaskControl,
) -> Option<QueueStatus> {
    let item = match ctx.queue.get(id).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            debug!("item removed before its worker ran");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "could not load item");
            return None;
        }
    };

    ctx.persist(
        id,
        ItemUpdate::new().status(QueueStatus::Queued).clear_errmsg(),
    )
    .await;

    let settings = ctx.settings.snapshot();
    let format = item
        .format
        .clone()
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| settings.format.clone());

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        if let ProgressSignal::Stop(interrupt) = control.signal() {
            return Some(finish_interrupted(ctx, id, interrupt).await);
        }

        debug!(attempt, url = %item.url, "starting attempt");
        let result = match EngineConfig::builder(&settings).format(format.as_str()).build() {
            Ok(config) => {
                let mut sink = StoreSink {
                    ctx,
                    id,
                    control,
                    gate: ProgressGate::new(ctx.progress_interval),
                };
                ctx.engine.download(&item.url, &config, &mut sink).await
            }
            Err(e) => Err(e),
        };

        let error: EngineError = match result {
            Ok(DownloadOutcome::Finished { filepath }) => {
                let mut update = ItemUpdate::new()
                    .status(QueueStatus::Completed)
                    .clear_errmsg();
                if let Some(path) = filepath {
                    update = update.filepath(path.to_string_lossy());
                }
                ctx.persist(id, update).await;
                info!(attempt, "download completed");
                return Some(QueueStatus::Completed);
            }
            Ok(DownloadOutcome::Interrupted(interrupt)) => {
                return Some(finish_interrupted(ctx, id, interrupt).await);
            }
            Err(error) => error,
        };

        // A stop request raced with the failure; honor the request.
        if let ProgressSignal::Stop(interrupt) = control.signal() {
            return Some(finish_interrupted(ctx, id, interrupt).await);
        }

        let failure = classify_error(&error);
        warn!(attempt, ?failure, error = %error, "attempt failed");

        match ctx.retry_policy.should_retry(failure, attempt) {
            RetryDecision::Retry { delay, .. } => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    interrupt = control.stopped() => {
                        return Some(finish_interrupted(ctx, id, interrupt).await);
                    }
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(reason = %reason, "giving up");
                let message = format!("download failed after {attempt} attempt(s): {error}");
                ctx.persist(
                    id,
                    ItemUpdate::new().status(QueueStatus::Error).errmsg(message),
                )
                .await;
                return Some(QueueStatus::Error);
            }
        }
    }
}

async fn finish_interrupted(ctx: &WorkerContext, id: i64, interrupt: Interrupt) -> QueueStatus {
    let status = interrupt_status(interrupt);
    info!(item_id = id, %status, "download interrupted");
    ctx.persist(id, ItemUpdate::new().status(status).clear_errmsg())
        .await;
    status
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::Database;
    use crate::config::Settings;
    use crate::engine::{MediaInfo, ProgressTick};

    /// Engine that replays one scripted result per call.
    struct Scripted {
        results: Mutex<VecDeque<Result<DownloadOutcome, EngineError>>>,
        ticks: Vec<u64>,
    }

    #[async_trait]
    impl MediaEngine for Scripted {
        async fn extract_info(&self, _url: &str) -> Result<MediaInfo, EngineError> {
            Ok(MediaInfo::default())
        }

        async fn download(
            &self,
            _url: &str,
            _config: &EngineConfig,
            sink: &mut dyn ProgressSink,
        ) -> Result<DownloadOutcome, EngineError> {
            for bytes in &self.ticks {
                let tick = ProgressTick {
                    downloaded_bytes: *bytes,
                    total_bytes: Some(100),
                    ..ProgressTick::default()
                };
                if let ProgressSignal::Stop(i) = sink.report(ProgressEvent::Downloading(tick)).await
                {
                    return Ok(DownloadOutcome::Interrupted(i));
                }
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(DownloadOutcome::Finished { filepath: None }))
        }
    }

    async fn context(
        results: Vec<Result<DownloadOutcome, EngineError>>,
        ticks: Vec<u64>,
    ) -> WorkerContext {
        let queue = Queue::new(Database::new_in_memory().await.unwrap());
        WorkerContext {
            queue,
            engine: Arc::new(Scripted {
                results: Mutex::new(results.into()),
                ticks,
            }),
            settings: SettingsStore::in_memory(Settings::default()),
            retry_policy: RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20), 2.0)
                .without_jitter(),
            progress_interval: Duration::ZERO,
        }
    }

    fn transient() -> Result<DownloadOutcome, EngineError> {
        Err(EngineError::failed(Some(1), "ERROR: Connection reset"))
    }

    #[tokio::test]
    async fn test_success_writes_completed_with_path() {
        let ctx = context(
            vec![Ok(DownloadOutcome::Finished {
                filepath: Some("/dl/a.mp4".into()),
            })],
            vec![50, 100],
        )
        .await;
        let id = ctx.queue.insert("https://a", "best").await.unwrap();

        let status = run_download(&ctx, id, &TaskControl::new()).await;
        assert_eq!(status, Some(QueueStatus::Completed));

        let item = ctx.queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status(), QueueStatus::Completed);
        assert_eq!(item.filepath.as_deref(), Some("/dl/a.mp4"));
        assert_eq!(item.downloaded_bytes, Some(100));
        assert_eq!(item.total_bytes, Some(100));
    }

    #[tokio::test]
    async fn test_retries_then_errors_with_attempt_count() {
        let ctx = context(vec![transient(), transient(), transient()], vec![]).await;
        let id = ctx.queue.insert("https://a", "best").await.unwrap();

        let status = run_download(&ctx, id, &TaskControl::new()).await;
        assert_eq!(status, Some(QueueStatus::Error));

        let item = ctx.queue.get(id).await.unwrap().unwrap();
        let errmsg = item.errmsg.unwrap();
        assert!(errmsg.starts_with("download failed after 3 attempt(s)"), "{errmsg}");
        assert!(errmsg.contains("Connection reset"));
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_after_one_attempt() {
        let ctx = context(
            vec![Err(EngineError::failed(Some(1), "ERROR: Unsupported URL: x"))],
            vec![],
        )
        .await;
        let id = ctx.queue.insert("https://a", "best").await.unwrap();

        run_download(&ctx, id, &TaskControl::new()).await;
        let item = ctx.queue.get(id).await.unwrap().unwrap();
        assert!(item.errmsg.unwrap().contains("after 1 attempt(s)"));
    }

    #[tokio::test]
    async fn test_cancel_flag_observed_on_tick() {
        let ctx = context(vec![], vec![10, 20]).await;
        let id = ctx.queue.insert("https://a", "best").await.unwrap();
        let control = TaskControl::new();
        control.request_cancel();

        let status = run_download(&ctx, id, &control).await;
        assert_eq!(status, Some(QueueStatus::Canceled));
        let item = ctx.queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status(), QueueStatus::Canceled);
        assert_eq!(item.errmsg, None);
    }

    #[test]
    fn test_busy_write_is_retried_once() {
        let busy = QueueError::Database {
            kind: crate::queue::QueueDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        };
        assert!(should_retry_write(&busy, 1));
        assert!(!should_retry_write(&busy, MAX_WRITE_ATTEMPTS));
        assert!(!should_retry_write(&QueueError::ItemNotFound(1), 1));
    }

    #[tokio::test]
    async fn test_missing_item_is_skipped() {
        let ctx = context(vec![], vec![]).await;
        assert_eq!(run_download(&ctx, 999, &TaskControl::new()).await, None);
    }
}
