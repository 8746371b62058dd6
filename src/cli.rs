//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mediaqueue_core::QueueStatus;

/// Queue and download media from video sites.
///
/// Without a subcommand, every URL given is queued, started, and watched
/// until it finishes. Press Ctrl-C to cancel the running downloads.
#[derive(Parser, Debug)]
#[command(name = "mediaqueue")]
#[command(author, version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// URLs to queue and download (read from stdin when piped)
    pub urls: Vec<String>,

    /// Download directory (saved to settings)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<PathBuf>,

    /// Format selection expression for new items, e.g. "bv*+ba/best"
    #[arg(short = 'f', long)]
    pub format: Option<String>,

    /// Maximum concurrent downloads (saved to settings)
    #[arg(short = 'c', long, global = true, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Download audio only, converted to mp3 (saved to settings)
    #[arg(long, global = true)]
    pub audio_only: bool,

    /// Path to the yt-dlp program
    #[arg(long, global = true, env = "MEDIAQUEUE_YTDLP")]
    pub engine_path: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List queue items in queue order
    List {
        /// Only show items with this status
        #[arg(long, value_parser = clap::value_parser!(QueueStatus))]
        status: Option<QueueStatus>,
    },

    /// Find items whose URL, title or uploader contains TERM
    Search { term: String },

    /// Restart every queued, paused or failed item and wait for them
    Resume,

    /// Delete an item from the queue
    Remove { id: i64 },

    /// Move an item one place earlier in the queue
    MoveUp { id: i64 },

    /// Move an item one place later in the queue
    MoveDown { id: i64 },

    /// Delete all completed, failed and canceled items
    ClearHistory,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["mediaqueue"]).unwrap();
        assert_eq!(args.command, None);
        assert!(args.urls.is_empty());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.concurrency, None);
    }

    #[test]
    fn test_cli_urls_are_positional() {
        let args =
            Args::try_parse_from(["mediaqueue", "https://a.example/1", "https://b.example/2"])
                .unwrap();
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.command, None);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["mediaqueue", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_download_options() {
        let args = Args::try_parse_from([
            "mediaqueue",
            "-o",
            "/tmp/videos",
            "-f",
            "worst",
            "-c",
            "5",
            "https://a.example/1",
        ])
        .unwrap();
        assert_eq!(args.output, Some(PathBuf::from("/tmp/videos")));
        assert_eq!(args.format.as_deref(), Some("worst"));
        assert_eq!(args.concurrency, Some(5));
    }

    #[test]
    fn test_cli_concurrency_zero_rejected() {
        let result = Args::try_parse_from(["mediaqueue", "-c", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_list_status_filter() {
        let args = Args::try_parse_from(["mediaqueue", "list", "--status", "paused"]).unwrap();
        assert_eq!(
            args.command,
            Some(Command::List {
                status: Some(QueueStatus::Paused)
            })
        );
        assert!(Args::try_parse_from(["mediaqueue", "list", "--status", "bogus"]).is_err());
    }

    #[test]
    fn test_cli_move_commands() {
        let args = Args::try_parse_from(["mediaqueue", "move-up", "3"]).unwrap();
        assert_eq!(args.command, Some(Command::MoveUp { id: 3 }));
        let args = Args::try_parse_from(["mediaqueue", "move-down", "4"]).unwrap();
        assert_eq!(args.command, Some(Command::MoveDown { id: 4 }));
    }

    #[test]
    fn test_cli_global_flag_after_subcommand() {
        let args = Args::try_parse_from(["mediaqueue", "resume", "-q"]).unwrap();
        assert_eq!(args.command, Some(Command::Resume));
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["mediaqueue", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
