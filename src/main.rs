//! CLI entry point for mediaqueue.

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mediaqueue_core::{
    AppPaths, Database, DownloadManager, ManagerOptions, Queue, QueueStatus, SettingsStore,
    YtDlpEngine,
};
use tracing::{debug, info, warn};

mod app;
mod cli;

use app::WatchSummary;
use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    init_tracing(&args);
    debug!(?args, "CLI arguments parsed");

    let paths = AppPaths::resolve()?;
    paths.ensure_dirs()?;
    let settings = SettingsStore::load(&paths.settings_file())?;
    apply_setting_overrides(&args, &settings)?;

    let db = Database::new(&paths.db_file())
        .await
        .context("failed to open the queue database")?;
    let queue = Queue::new(db.clone());

    let code = match args.command.clone() {
        Some(Command::List { status }) => {
            app::print_items(&queue.list(status).await?);
            ExitCode::SUCCESS
        }
        Some(Command::Search { term }) => {
            app::print_items(&queue.search(&term).await?);
            ExitCode::SUCCESS
        }
        Some(Command::Remove { id }) => {
            queue.delete(id).await?;
            println!("Removed item {id}.");
            ExitCode::SUCCESS
        }
        Some(Command::MoveUp { id }) => report_move(id, queue.move_up(id).await?, "up"),
        Some(Command::MoveDown { id }) => report_move(id, queue.move_down(id).await?, "down"),
        Some(Command::ClearHistory) => {
            let removed = queue.clear_history().await?;
            println!("Removed {removed} finished item(s).");
            ExitCode::SUCCESS
        }
        Some(Command::Resume) => {
            let manager = build_manager(&args, &paths, queue.clone(), settings).await?;
            let ids = resume_restartable(&manager).await?;
            run_and_watch(&args, &manager, &ids).await?
        }
        None => {
            let urls = collect_urls(&args)?;
            if urls.is_empty() {
                info!("No URLs given. Pass them as arguments or pipe them via stdin.");
                info!("Example: mediaqueue https://www.youtube.com/watch?v=...");
                ExitCode::SUCCESS
            } else {
                let manager = build_manager(&args, &paths, queue.clone(), settings).await?;
                let mut ids = Vec::with_capacity(urls.len());
                for url in &urls {
                    let id = manager.queue_url(url, args.format.as_deref()).await?;
                    manager.start(id)?;
                    ids.push(id);
                }
                run_and_watch(&args, &manager, &ids).await?
            }
        }
    };

    db.close().await;
    Ok(code)
}

fn init_tracing(args: &Args) {
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Persists the setting flags given on the command line.
fn apply_setting_overrides(args: &Args, settings: &SettingsStore) -> Result<()> {
    if args.output.is_none() && args.concurrency.is_none() && !args.audio_only {
        return Ok(());
    }
    let updated = settings.update(|s| {
        if let Some(output) = &args.output {
            s.download_dir.clone_from(output);
        }
        if let Some(concurrency) = args.concurrency {
            s.concurrent_downloads = usize::from(concurrency);
        }
        if args.audio_only {
            s.audio_only = true;
        }
    })?;
    debug!(?updated, "settings updated from command line");
    Ok(())
}

/// Builds the manager for a download run.
///
/// Rows a previous run left `downloading` are re-queued first; read-only
/// commands never touch them, since another process may own them.
async fn build_manager(
    args: &Args,
    paths: &AppPaths,
    queue: Queue,
    settings: SettingsStore,
) -> Result<DownloadManager> {
    let recovered = queue.reset_interrupted().await?;
    if recovered > 0 {
        info!(recovered, "re-queued downloads interrupted by the previous run");
    }

    let engine = match &args.engine_path {
        Some(path) => YtDlpEngine::with_program(path),
        None => YtDlpEngine::new(),
    };
    let manager = DownloadManager::new(
        queue,
        Arc::new(engine),
        settings,
        ManagerOptions::new(paths.thumb_dir()),
    )?;
    Ok(manager)
}

/// URLs from the arguments, or from stdin when it is piped.
fn collect_urls(args: &Args) -> Result<Vec<String>> {
    if !args.urls.is_empty() {
        return Ok(args.urls.clone());
    }
    if io::stdin().is_terminal() {
        return Ok(Vec::new());
    }
    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    Ok(buffer
        .split_whitespace()
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(str::to_string)
        .collect())
}

async fn resume_restartable(manager: &DownloadManager) -> Result<Vec<i64>> {
    let items = manager.queue().list(None).await?;
    let mut ids = Vec::new();
    for item in items.iter().filter(|item| item.status().is_restartable()) {
        manager.resume(item.id).await?;
        ids.push(item.id);
    }
    if ids.is_empty() {
        info!("Nothing to resume.");
    }
    Ok(ids)
}

async fn run_and_watch(args: &Args, manager: &DownloadManager, ids: &[i64]) -> Result<ExitCode> {
    let summary = app::watch(manager, ids, !args.quiet).await?;
    manager.shutdown();
    report_summary(manager, &summary).await;

    if summary.failed > 0 || summary.interrupted {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn report_summary(manager: &DownloadManager, summary: &WatchSummary) {
    info!(
        completed = summary.completed,
        failed = summary.failed,
        paused = summary.paused,
        canceled = summary.canceled,
        unfinished = summary.unfinished,
        "Download run finished"
    );
    if summary.failed > 0 {
        match manager.queue().list(Some(QueueStatus::Error)).await {
            Ok(failed) => {
                for item in failed {
                    warn!(
                        id = item.id,
                        item = item.display_name(),
                        error = item.errmsg.as_deref().unwrap_or("unknown error"),
                        "download failed"
                    );
                }
            }
            Err(e) => warn!(error = %e, "could not list failed items"),
        }
    }
}

fn report_move(id: i64, moved: bool, direction: &str) -> ExitCode {
    if moved {
        println!("Moved item {id} {direction}.");
    } else {
        println!("Item {id} is already at the boundary or does not exist.");
    }
    ExitCode::SUCCESS
}
