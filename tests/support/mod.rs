//! Shared helpers for integration tests: a scripted engine and store polling.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mediaqueue_core::config::{Settings, SettingsStore};
use mediaqueue_core::engine::{
    DownloadOutcome, EngineConfig, EngineError, MediaEngine, MediaInfo, ProgressEvent,
    ProgressSignal, ProgressSink, ProgressTick,
};
use mediaqueue_core::{
    Database, DownloadManager, ManagerOptions, Queue, QueueItem, QueueStatus, RetryPolicy,
};
use tempfile::TempDir;

/// What one scripted download call does.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub ticks: Vec<u64>,
    pub tick_delay: Duration,
    pub total: u64,
    /// Files reported as finished before the attempt ends.
    pub files: Vec<PathBuf>,
    pub result: AttemptResult,
}

#[derive(Debug, Clone)]
pub enum AttemptResult {
    Finish(Option<PathBuf>),
    Fail(String),
}

impl Attempt {
    pub fn finish() -> Self {
        Self {
            ticks: vec![50, 100],
            tick_delay: Duration::ZERO,
            total: 100,
            files: Vec::new(),
            result: AttemptResult::Finish(Some(PathBuf::from("/downloads/clip.mp4"))),
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            ticks: Vec::new(),
            tick_delay: Duration::ZERO,
            total: 100,
            files: Vec::new(),
            result: AttemptResult::Fail(message.to_string()),
        }
    }

    /// A download that ticks `count` times, `delay` apart, then finishes.
    pub fn slow(count: u64, delay: Duration) -> Self {
        Self {
            ticks: (1..=count).collect(),
            tick_delay: delay,
            total: count,
            files: Vec::new(),
            result: AttemptResult::Finish(None),
        }
    }

    pub fn with_ticks(mut self, ticks: Vec<u64>) -> Self {
        self.ticks = ticks;
        self
    }

    /// Reports `path` as a finished file before the attempt's result.
    pub fn with_file(mut self, path: &str) -> Self {
        self.files.push(PathBuf::from(path));
        self
    }
}

/// Engine that replays scripted attempts and records concurrency.
pub struct ScriptedEngine {
    attempts: Mutex<VecDeque<Attempt>>,
    fallback: Attempt,
    info: Mutex<Result<MediaInfo, String>>,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            fallback: Attempt::finish(),
            info: Mutex::new(Ok(MediaInfo {
                title: Some("Scripted clip".to_string()),
                uploader: Some("Tester".to_string()),
                duration: Some(90),
                thumbnail: None,
            })),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Attempt used once the script runs out.
    pub fn with_fallback(mut self, attempt: Attempt) -> Self {
        self.fallback = attempt;
        self
    }

    pub fn with_info(self, info: Result<MediaInfo, String>) -> Self {
        *self.info.lock().unwrap() = info;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_attempt(&self) -> Attempt {
        self.attempts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Decrements the running counter even when the download future is dropped.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    async fn extract_info(&self, _url: &str) -> Result<MediaInfo, EngineError> {
        self.info
            .lock()
            .unwrap()
            .clone()
            .map_err(|message| EngineError::failed(Some(1), message))
    }

    async fn download(
        &self,
        _url: &str,
        _config: &EngineConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<DownloadOutcome, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        let attempt = self.next_attempt();
        for bytes in attempt.ticks {
            if !attempt.tick_delay.is_zero() {
                tokio::time::sleep(attempt.tick_delay).await;
            }
            let tick = ProgressTick {
                downloaded_bytes: bytes,
                total_bytes: Some(attempt.total),
                speed: Some(1024.0),
                eta: Some(1),
                title: None,
            };
            if let ProgressSignal::Stop(interrupt) =
                sink.report(ProgressEvent::Downloading(tick)).await
            {
                return Ok(DownloadOutcome::Interrupted(interrupt));
            }
        }

        for path in attempt.files {
            sink.report(ProgressEvent::Finished {
                filepath: Some(path),
            })
            .await;
        }

        match attempt.result {
            AttemptResult::Finish(filepath) => {
                sink.report(ProgressEvent::Finished {
                    filepath: filepath.clone(),
                })
                .await;
                Ok(DownloadOutcome::Finished { filepath })
            }
            AttemptResult::Fail(message) => Err(EngineError::failed(Some(1), message)),
        }
    }
}

/// Retry policy with millisecond backoff and no jitter.
pub fn fast_retries() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50), 2.0).without_jitter()
}

/// A manager over a fresh on-disk database in a temp dir.
pub struct Harness {
    pub manager: DownloadManager,
    pub engine: Arc<ScriptedEngine>,
    pub settings: SettingsStore,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(engine: ScriptedEngine) -> Self {
        Self::with_options(engine, |options| options).await
    }

    pub async fn with_options(
        engine: ScriptedEngine,
        configure: impl FnOnce(ManagerOptions) -> ManagerOptions,
    ) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::new(&dir.path().join("queue.db"))
            .await
            .expect("Failed to create database");
        let settings = SettingsStore::in_memory(Settings {
            download_dir: dir.path().join("downloads"),
            ..Settings::default()
        });
        let engine = Arc::new(engine);
        let options = configure(
            ManagerOptions::new(dir.path().join("thumbs"))
                .retry_policy(fast_retries())
                .progress_interval(Duration::ZERO),
        );
        let manager = DownloadManager::new(
            Queue::new(db),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            settings.clone(),
            options,
        )
        .expect("Failed to create manager");

        Self {
            manager,
            engine,
            settings,
            dir,
        }
    }

    pub fn queue(&self) -> &Queue {
        self.manager.queue()
    }
}

/// Polls the store until `id` reaches `status`, panicking after 5 seconds.
pub async fn wait_for_status(queue: &Queue, id: i64, status: QueueStatus) -> QueueItem {
    wait_for(queue, id, |item| item.status() == status)
        .await
        .unwrap_or_else(|last| panic!("item {id} never reached {status}; last seen {last:?}"))
}

/// Polls the store until `check` holds for `id`.
///
/// Returns the last observed status on timeout.
pub async fn wait_for(
    queue: &Queue,
    id: i64,
    check: impl Fn(&QueueItem) -> bool,
) -> Result<QueueItem, Option<QueueStatus>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut last = None;
    while tokio::time::Instant::now() < deadline {
        if let Some(item) = queue.get(id).await.expect("Failed to get item") {
            if check(&item) {
                return Ok(item);
            }
            last = Some(item.status());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(last)
}
