//! Binary-side helpers: terminal output and the download watcher.

mod output;
mod progress;

pub(crate) use output::print_items;
pub(crate) use progress::{WatchSummary, watch};
