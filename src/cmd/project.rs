//! Project status, reset and delete commands.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::{StyledObject, style};
use tumbler_common::{ProjectState, ProjectStatus};

use tumbler::state::{INPUT_DIR, STATE_DIR, StateStore};

use super::resolve_project;

pub fn cmd_status(workspace: &Path, project: Option<&Path>) -> Result<()> {
    match project {
        Some(project) => {
            let project = resolve_project(workspace, project)?;
            print_detail(&StateStore::open_local(&project)?)
        }
        None => print_table(workspace),
    }
}

fn print_table(workspace: &Path) -> Result<()> {
    let projects = discover_projects(workspace)?;
    println!();
    if projects.is_empty() {
        println!("No projects found in {}", workspace.display());
        println!();
        println!("Create <project>/{}/requirements.txt to start one.", INPUT_DIR);
        println!();
        return Ok(());
    }

    println!(
        "{:<24} {:<12} {:>5} {:>6} {:>9}  Error",
        "Project", "Status", "Iter", "Score", "Cost"
    );
    println!(
        "{:<24} {:<12} {:>5} {:>6} {:>9}  -----",
        "------------------------", "------------", "-----", "------", "---------"
    );
    for project in projects {
        let store = StateStore::open_local(&project)?;
        let state = store.load();
        println!(
            "{:<24} {:<12} {:>5} {:>6} {:>9}  {}",
            state.name,
            status_style(state.status),
            state.iteration,
            score_text(&state),
            format!("${:.4}", store.total_cost()),
            state.error.as_deref().unwrap_or("")
        );
    }
    println!();
    Ok(())
}

fn print_detail(store: &StateStore) -> Result<()> {
    let state = store.load();
    let usage = store.load_usage();
    println!();
    println!("Project:    {}", style(&state.name).bold());
    println!("Status:     {}", status_style(state.status));
    println!(
        "Iteration:  {} of {} (threshold {:.1})",
        state.iteration, state.max_iterations, state.quality_threshold
    );
    println!("Score:      {}", score_text(&state));
    if !state.scores.is_empty() {
        let history: Vec<String> = state.scores.iter().map(|s| format!("{:.1}", s)).collect();
        println!("History:    {}", history.join(" → "));
    }
    println!(
        "Usage:      {} tokens, ${:.4} over {} call(s)",
        usage.total_tokens,
        usage.total_cost,
        usage.history.len()
    );
    if let Some(error) = &state.error {
        println!("Error:      {}", style(error).red());
    }
    if !state.verification.is_empty() {
        println!(
            "Overrides:  {}",
            serde_json::to_string(&state.verification).context("Failed to render overrides")?
        );
    }
    println!("Updated:    {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    let conversation = store.load_conversation();
    if !conversation.is_empty() {
        println!();
        println!("Recent activity:");
        for entry in conversation.iter().rev().take(5).rev() {
            let line = entry.content.lines().next().unwrap_or("");
            println!(
                "  {} [{}] {}",
                style(entry.timestamp.format("%H:%M:%S")).dim(),
                entry.agent,
                truncate(line, 80)
            );
        }
    }
    println!();
    Ok(())
}

pub fn cmd_reset(workspace: &Path, project: &Path, full: bool, force: bool) -> Result<()> {
    let project = resolve_project(workspace, project)?;
    let store = StateStore::open_local(&project)?;
    let prompt = if full {
        format!(
            "This clears the plan, staged code, feedback and archives of {}. Are you sure?",
            store.name()
        )
    } else {
        format!("This resets the run state of {}. Are you sure?", store.name())
    };
    if !confirm(&prompt, force)? {
        println!("Reset cancelled.");
        return Ok(());
    }

    if full {
        let report = store.full_reset()?;
        println!(
            "Project {} reset ({} removed, {} skipped).",
            store.name(),
            report.deleted,
            report.skipped
        );
    } else {
        store.reset_for_run()?;
        println!("Project {} reset. Requirements and plan were kept.", store.name());
    }
    Ok(())
}

pub fn cmd_delete(workspace: &Path, project: &Path, force: bool) -> Result<()> {
    let project = resolve_project(workspace, project)?;
    let store = StateStore::open_local(&project)?;
    let name = store.name();
    if !confirm(&format!("Permanently delete project {}?", name), force)? {
        println!("Delete cancelled.");
        return Ok(());
    }

    let report = store.safe_delete_project();
    if report.skipped > 0 {
        println!(
            "Deleted {} entries of {}; {} could not be removed safely and were left in place.",
            report.deleted, name, report.skipped
        );
    } else {
        println!("Deleted project {}.", name);
    }
    Ok(())
}

fn confirm(prompt: &str, force: bool) -> Result<bool> {
    if force {
        return Ok(true);
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Confirmation needs an interactive terminal; pass --force")
}

/// Directories directly under `workspace` that look like projects.
fn discover_projects(workspace: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(workspace)
        .with_context(|| format!("Failed to read workspace {}", workspace.display()))?;
    let mut projects: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.join(INPUT_DIR).is_dir() || path.join(STATE_DIR).is_dir())
        .collect();
    projects.sort();
    Ok(projects)
}

fn status_style(status: ProjectStatus) -> StyledObject<&'static str> {
    let text = style(status.as_str());
    match status {
        ProjectStatus::Completed => text.green(),
        ProjectStatus::Failed => text.red(),
        ProjectStatus::Idle => text.dim(),
        _ => text.cyan(),
    }
}

fn score_text(state: &ProjectState) -> String {
    state
        .last_score
        .map(|s| format!("{:.1}", s))
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut)
}
