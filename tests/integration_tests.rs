//! Integration tests for the tumbler CLI.
//!
//! Collaborators are shell commands that print canned replies, and sandbox
//! verification is disabled, so a full run needs neither a model nor Docker.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use tumbler::config::{AgentCommandConfig, TumblerConfig};

fn tumbler(workspace: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("tumbler");
    cmd.arg("--workspace").arg(workspace);
    cmd.env_remove("RUST_LOG");
    cmd
}

/// An agent that discards its prompt and prints `reply_file`.
fn canned_agent(reply_file: &Path) -> AgentCommandConfig {
    AgentCommandConfig {
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            format!("cat > /dev/null; cat '{}'", reply_file.display()),
        ],
        timeout_secs: 30,
    }
}

/// Workspace with a config wired to canned agents.
fn workspace_with_agents(score: f64) -> TempDir {
    let dir = TempDir::new().unwrap();
    let replies = dir.path().join(".replies");
    fs::create_dir_all(&replies).unwrap();
    fs::write(
        replies.join("plan.md"),
        "# Greeter\n\n## Files\n\n- src/app.py\n- tests/test_app.py\n",
    )
    .unwrap();
    fs::write(
        replies.join("files.json"),
        r#"[{"path": "src/app.py", "content": "print('hi')\n"}, {"path": "tests/test_app.py", "content": "def test(): pass\n"}]"#,
    )
    .unwrap();
    fs::write(
        replies.join("report.md"),
        format!("# Report\n\nLooks fine.\n\n**Overall Score**: {}/10\n", score),
    )
    .unwrap();

    let mut config = TumblerConfig::default();
    config.tumbler.max_iterations = 3;
    config.verification.enabled = false;
    config.agents.planner = canned_agent(&replies.join("plan.md"));
    config.agents.generator = canned_agent(&replies.join("files.json"));
    config.agents.validator = canned_agent(&replies.join("report.md"));
    config.save(&dir.path().join("tumbler.toml")).unwrap();
    dir
}

fn create_project(workspace: &Path, name: &str, requirements: Option<&str>) -> PathBuf {
    let project = workspace.join(name);
    fs::create_dir_all(project.join("01_input")).unwrap();
    if let Some(text) = requirements {
        fs::write(project.join("01_input/requirements.txt"), text).unwrap();
    }
    project
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        cargo_bin_cmd!("tumbler")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("daemon"));
    }

    #[test]
    fn test_version() {
        cargo_bin_cmd!("tumbler").arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_project_is_an_error() {
        let dir = TempDir::new().unwrap();
        tumbler(dir.path())
            .args(["run", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Project not found"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_writes_defaults_once() {
        let dir = TempDir::new().unwrap();
        tumbler(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        let written = fs::read_to_string(dir.path().join("tumbler.toml")).unwrap();
        assert!(written.contains("[tumbler]"));
        assert!(written.contains("max_iterations = 10"));

        tumbler(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_show_uses_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        tumbler(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("quality_threshold = 8.0"));
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tumbler.toml"), "[scheduler]\nworkers = 0\n").unwrap();
        tumbler(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("scheduler.workers must be at least 1"));
    }

    #[test]
    fn test_config_validate_accepts_defaults() {
        let dir = TempDir::new().unwrap();
        TumblerConfig::default()
            .save(&dir.path().join("tumbler.toml"))
            .unwrap();
        tumbler(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_broken_config_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tumbler.toml"), "[tumbler\n").unwrap();
        tumbler(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse tumbler.toml"));
    }
}

// =============================================================================
// Full runs with canned collaborators
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_run_completes_and_archives() {
        let dir = workspace_with_agents(9.0);
        let project = create_project(dir.path(), "greeter", Some("Print a greeting"));

        tumbler(dir.path())
            .args(["run", "greeter"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed after 1 iteration(s), score 9.0"));

        assert!(project.join("02_plan/PLAN.md").exists());
        assert_eq!(
            fs::read_to_string(project.join("03_staging/src/app.py")).unwrap(),
            "print('hi')\n"
        );
        assert!(project.join("03_staging/.manifest.json").exists());
        assert!(project.join("04_feedback/REPORT_iter1.md").exists());
        let archives = fs::read_dir(project.join("05_final")).unwrap().count();
        assert_eq!(archives, 1);

        tumbler(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("greeter"))
            .stdout(predicate::str::contains("completed"));
    }

    #[test]
    fn test_low_scores_stop_at_iteration_cap() {
        // A constant score plateaus after three iterations, which is also the cap.
        let dir = workspace_with_agents(3.0);
        create_project(dir.path(), "greeter", Some("Print a greeting"));

        tumbler(dir.path())
            .args(["run", "greeter"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed after 3 iteration(s): Score plateau"));

        tumbler(dir.path())
            .args(["status", "greeter"])
            .assert()
            .success()
            .stdout(predicate::str::contains("3.0 → 3.0 → 3.0"));
    }

    #[test]
    fn test_missing_requirements_marks_project_failed() {
        let dir = workspace_with_agents(9.0);
        create_project(dir.path(), "empty", None);

        tumbler(dir.path())
            .args(["run", "empty"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Requirements file not found"));

        tumbler(dir.path())
            .args(["status", "empty"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"))
            .stdout(predicate::str::contains("Requirements file not found"));
    }

    #[test]
    fn test_verify_without_sandbox_is_review_only() {
        let dir = workspace_with_agents(9.0);
        let project = create_project(dir.path(), "greeter", Some("Print a greeting"));
        fs::create_dir_all(project.join("03_staging")).unwrap();
        fs::write(project.join("03_staging/requirements.txt"), "flask\n").unwrap();

        tumbler(dir.path())
            .args(["verify", "greeter"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Review only"));
    }
}

// =============================================================================
// Project management
// =============================================================================

mod project_management {
    use super::*;

    #[test]
    fn test_status_empty_workspace() {
        let dir = TempDir::new().unwrap();
        tumbler(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No projects found"));
    }

    #[test]
    fn test_reset_keeps_inputs() {
        let dir = workspace_with_agents(9.0);
        let project = create_project(dir.path(), "greeter", Some("Print a greeting"));
        tumbler(dir.path()).args(["run", "greeter"]).assert().success();

        tumbler(dir.path())
            .args(["reset", "greeter", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("reset"));

        let state = fs::read_to_string(project.join(".tumbler/state.json")).unwrap();
        assert!(state.contains(r#""status": "idle""#));
        assert!(state.contains(r#""iteration": 0"#));
        assert!(project.join("02_plan/PLAN.md").exists());
        assert!(project.join("01_input/requirements.txt").exists());
    }

    #[test]
    fn test_full_reset_clears_generated_output() {
        let dir = workspace_with_agents(9.0);
        let project = create_project(dir.path(), "greeter", Some("Print a greeting"));
        tumbler(dir.path()).args(["run", "greeter"]).assert().success();

        tumbler(dir.path())
            .args(["reset", "greeter", "--full", "--force"])
            .assert()
            .success();

        assert!(project.join("03_staging").is_dir());
        assert_eq!(fs::read_dir(project.join("03_staging")).unwrap().count(), 0);
        assert!(!project.join("02_plan/PLAN.md").exists());
        assert!(!project.join(".tumbler/usage.json").exists());
        assert!(project.join("01_input/requirements.txt").exists());
    }

    #[test]
    fn test_delete_removes_project() {
        let dir = TempDir::new().unwrap();
        let project = create_project(dir.path(), "scratch", Some("anything"));

        tumbler(dir.path())
            .args(["delete", "scratch", "--force"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Deleted project scratch"));
        assert!(!project.exists());
    }
}
