//! `tumbler run` and `tumbler verify`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tumbler_common::{PhaseReport, PhaseStatus, ProjectStatus, SandboxPhase};

use tumbler::config::TumblerConfig;
use tumbler::context::RuntimeContext;
use tumbler::orchestrator::plan::extract_strategy;
use tumbler::sandbox::{MarkerDetector, PhaseObserver, RuntimeDetector, SandboxExecutor};
use tumbler::state::{ProjectLayout, StateStore};

use super::resolve_project;

pub async fn cmd_run(workspace: PathBuf, config: TumblerConfig, project: &Path) -> Result<()> {
    let project = resolve_project(&workspace, project)?;
    let ctx = RuntimeContext::build(workspace, config).await?;
    if !ctx.executor().is_available() {
        println!(
            "{} sandbox unavailable; verification will be review-only",
            style("warning:").yellow().bold()
        );
    }

    let cancel = ctx.cancel_token();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let name = ProjectLayout::new(&project).name();
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg} [{elapsed}]")
            .context("Invalid spinner template")?,
    );
    spinner.set_message(format!("Running {}", name));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = ctx.orchestrator().run_cycle(&project, &cancel).await;
    spinner.finish_and_clear();
    ctx.shutdown().await;

    let state = result.with_context(|| format!("Project {} failed", name))?;
    let score = state
        .last_score
        .map(|s| format!("{:.1}", s))
        .unwrap_or_else(|| "-".to_string());
    match state.status {
        ProjectStatus::Completed => println!(
            "{} {} completed after {} iteration(s), score {}",
            style("✓").green().bold(),
            name,
            state.iteration,
            score
        ),
        ProjectStatus::Failed => println!(
            "{} {} failed after {} iteration(s): {}",
            style("✗").red().bold(),
            name,
            state.iteration,
            state.error.as_deref().unwrap_or("unknown reason")
        ),
        status => println!(
            "{} {} stopped while {} (iteration {}); run again to resume",
            style("■").yellow().bold(),
            name,
            status,
            state.iteration
        ),
    }
    Ok(())
}

pub async fn cmd_verify(workspace: PathBuf, config: TumblerConfig, project: &Path) -> Result<()> {
    let project = resolve_project(&workspace, project)?;
    let store = StateStore::open_local(&project)?;
    let layout = store.layout();
    let staging = layout.staging();
    if !staging.is_dir() {
        anyhow::bail!("Nothing staged at {}", staging.display());
    }

    let plan = fs::read_to_string(layout.plan()).unwrap_or_default();
    let strategy = extract_strategy(&plan);
    let runtime = MarkerDetector.detect(&staging, &plan);
    let executor = SandboxExecutor::connect(config.verification).await;

    let observer: PhaseObserver = Arc::new(|phase: SandboxPhase, report: PhaseReport| {
        print_phase(phase, &report);
    });
    let result = executor
        .run_verification(&staging, &strategy, runtime.as_ref(), &store.load().verification, Some(observer))
        .await;

    println!();
    if result.code_review_only {
        println!("{} automated verification did not run", style("Review only:").yellow().bold());
    } else {
        println!("Language:    {}", result.language.as_deref().unwrap_or("unknown"));
        println!(
            "Build:       {}",
            if result.build_success {
                style("ok").green()
            } else {
                style("failed").red()
            }
        );
        println!("Tests:       {}/{} passed", result.tests_passed, result.tests_total);
        println!("Lint issues: {}", result.lint_issues);
        if let Some(score) = result.preliminary_score() {
            println!("Score:       {:.1}/10", score);
        }
    }
    for error in &result.errors {
        println!("  {} {}", style("-").red(), error);
    }
    Ok(())
}

fn print_phase(phase: SandboxPhase, report: &PhaseReport) {
    let status = match report.status {
        PhaseStatus::Success => style("success").green(),
        PhaseStatus::Failed => style("failed").red(),
        PhaseStatus::Timeout => style("timeout").red(),
        PhaseStatus::Skipped => style("skipped").dim(),
    };
    println!(
        "{:<8} {:<8} exit {:<4} {:.1}s",
        phase.as_str(),
        status,
        report.exit_code,
        report.duration_secs
    );
}
