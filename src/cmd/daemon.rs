//! `tumbler daemon`: watch the workspace and feed triggers to the pool.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use tumbler::config::TumblerConfig;
use tumbler::context::RuntimeContext;
use tumbler::watcher::TriggerWatcher;

pub async fn cmd_daemon(workspace: PathBuf, config: TumblerConfig) -> Result<()> {
    if !workspace.is_dir() {
        anyhow::bail!("Workspace not found: {}", workspace.display());
    }
    let poll = Duration::from_millis(config.tumbler.poll_interval_ms);
    let debounce = Duration::from_millis(config.tumbler.debounce_ms);

    let mut ctx = RuntimeContext::build(workspace.clone(), config).await?;
    if !ctx.executor().is_available() {
        tracing::warn!("Sandbox unavailable; verification will be review-only");
    }
    ctx.start_scheduler();

    let (tx, mut rx) = mpsc::channel(64);
    let watcher = TriggerWatcher::new(&workspace, poll, debounce);
    let watcher_task = tokio::spawn(watcher.run(tx, ctx.cancel_token()));

    println!(
        "Watching {} ({} workers). Press Ctrl+C to stop.",
        console::style(workspace.display()).bold(),
        ctx.config().scheduler.workers
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                println!("Stopping; waiting for running phases to finish...");
                break;
            }
            trigger = rx.recv() => match trigger {
                Some(path) => {
                    if !ctx.submit(path.clone()) {
                        tracing::warn!(trigger = %path.display(), "Scheduler not accepting work");
                    }
                }
                None => break,
            },
        }
    }

    ctx.cancel_token().cancel();
    if let Err(e) = watcher_task.await {
        tracing::error!(error = %e, "Watcher task ended abnormally");
    }
    ctx.shutdown().await;
    println!("Daemon stopped.");
    Ok(())
}
