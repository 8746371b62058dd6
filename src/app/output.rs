//! Plain-text rendering of queue items.

use mediaqueue_core::{QueueItem, QueueStatus};

/// Prints one line per item in queue order.
pub(crate) fn print_items(items: &[QueueItem]) {
    if items.is_empty() {
        println!("No items.");
        return;
    }

    println!(
        "{:>5}  {:<11}  {:>5}  {:>8}  TITLE",
        "ID", "STATUS", "DONE", "LENGTH"
    );
    for item in items {
        let status = item.status();
        let done = item
            .progress_fraction()
            .map_or_else(|| "-".to_string(), |f| format!("{:.0}%", f * 100.0));
        let length = item
            .duration
            .map_or_else(|| "-".to_string(), format_duration);
        println!(
            "{:>5}  {:<11}  {:>5}  {:>8}  {}",
            item.id,
            status.as_str(),
            done,
            length,
            item.display_name()
        );
        if status == QueueStatus::Error
            && let Some(errmsg) = &item.errmsg
        {
            println!("{:>5}  {errmsg}", "");
        }
    }
}

/// Formats seconds as `m:ss` or `h:mm:ss`.
pub(crate) fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (hours, minutes, secs) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}
