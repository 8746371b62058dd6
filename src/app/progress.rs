//! Progress bars for a download run, driven by polling the queue store.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use mediaqueue_core::{DownloadManager, QueueError, QueueItem, QueueStatus};
use tokio::time::Instant;
use tracing::{info, warn};

/// How often the store is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long to wait for workers to honor Ctrl-C before abandoning them.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Final tally of a watched run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct WatchSummary {
    pub(crate) completed: usize,
    pub(crate) failed: usize,
    pub(crate) paused: usize,
    pub(crate) canceled: usize,
    pub(crate) unfinished: usize,
    pub(crate) interrupted: bool,
}

impl WatchSummary {
    fn record(&mut self, status: QueueStatus) {
        match status {
            QueueStatus::Completed => self.completed += 1,
            QueueStatus::Error => self.failed += 1,
            QueueStatus::Paused => self.paused += 1,
            QueueStatus::Canceled => self.canceled += 1,
            QueueStatus::Queued | QueueStatus::Downloading => self.unfinished += 1,
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:>5} [{bar:30.cyan/blue}] {bytes:>10}/{total_bytes:<10} {binary_bytes_per_sec:>12} {wide_msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ")
}

fn update_bar(bar: &ProgressBar, item: &QueueItem) {
    if let Some(total) = item.total_bytes.and_then(|t| u64::try_from(t).ok()) {
        bar.set_length(total);
    }
    if let Some(done) = item.downloaded_bytes.and_then(|d| u64::try_from(d).ok()) {
        bar.set_position(done);
    }
    bar.set_message(format!("{:<11} {}", item.status().as_str(), item.display_name()));
}

/// Polls items `ids` until each reaches a resting status.
///
/// The first Ctrl-C cancels everything still pending; after
/// [`SETTLE_TIMEOUT`] the remaining items are left to the caller.
pub(crate) async fn watch(
    manager: &DownloadManager,
    ids: &[i64],
    show_bars: bool,
) -> Result<WatchSummary, QueueError> {
    let multi = if show_bars {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    };
    let style = bar_style();
    let bars: HashMap<i64, ProgressBar> = ids
        .iter()
        .map(|id| {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(style.clone());
            bar.set_prefix(id.to_string());
            (*id, bar)
        })
        .collect();

    let mut pending: BTreeSet<i64> = ids.iter().copied().collect();
    let mut summary = WatchSummary::default();
    let mut settle_deadline: Option<Instant> = None;
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut ctrl_c_armed = true;

    while !pending.is_empty() {
        for id in pending.clone() {
            let Some(bar) = bars.get(&id) else {
                continue;
            };
            let Some(item) = manager.queue().get(id).await? else {
                bar.abandon_with_message("removed");
                pending.remove(&id);
                continue;
            };
            update_bar(bar, &item);
            let status = item.status();
            if status.is_terminal() {
                pending.remove(&id);
                summary.record(status);
                if status == QueueStatus::Completed {
                    bar.finish();
                } else {
                    bar.abandon();
                }
            }
        }

        if pending.is_empty() {
            break;
        }
        if settle_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(remaining = pending.len(), "downloads did not stop in time");
            summary.unfinished += pending.len();
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            result = &mut ctrl_c, if ctrl_c_armed => {
                ctrl_c_armed = false;
                match result {
                    Ok(()) => {
                        info!(pending = pending.len(), "interrupted, canceling downloads");
                        for id in &pending {
                            manager.cancel(*id);
                        }
                        summary.interrupted = true;
                        settle_deadline = Some(Instant::now() + SETTLE_TIMEOUT);
                    }
                    Err(e) => warn!(error = %e, "could not listen for Ctrl-C"),
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_records_each_status() {
        let mut summary = WatchSummary::default();
        for status in QueueStatus::ALL {
            summary.record(status);
        }
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.paused, 1);
        assert_eq!(summary.canceled, 1);
        assert_eq!(summary.unfinished, 2);
    }
}
