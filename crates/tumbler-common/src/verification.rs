use std::fmt;

use serde::{Deserialize, Serialize};

/// The fixed phases of a sandbox verification run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPhase {
    Install,
    Build,
    Test,
    Lint,
}

impl SandboxPhase {
    pub const ALL: [SandboxPhase; 4] = [
        SandboxPhase::Install,
        SandboxPhase::Build,
        SandboxPhase::Test,
        SandboxPhase::Lint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxPhase::Install => "install",
            SandboxPhase::Build => "build",
            SandboxPhase::Test => "test",
            SandboxPhase::Lint => "lint",
        }
    }
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured outcome of one phase container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The phase's commands joined with ` && `.
    pub command: String,
    /// Container exit code; `-1` when the container never produced one.
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_secs: f64,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout followed by stderr, separated by a newline when both are present.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
}

/// Payload pushed to phase observers as soon as a phase finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub status: PhaseStatus,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_secs: f64,
    pub commands: Vec<String>,
}

impl PhaseReport {
    /// Observers get at most this many characters per stream.
    pub const MAX_STREAM_CHARS: usize = 10_000;

    pub fn skipped(commands: Vec<String>) -> Self {
        Self {
            status: PhaseStatus::Skipped,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_secs: 0.0,
            commands,
        }
    }

    pub fn from_result(result: &CommandResult, commands: Vec<String>) -> Self {
        let status = if result.timed_out {
            PhaseStatus::Timeout
        } else if result.exit_code == 0 {
            PhaseStatus::Success
        } else {
            PhaseStatus::Failed
        };
        Self {
            status,
            exit_code: result.exit_code,
            stdout: result.stdout.chars().take(Self::MAX_STREAM_CHARS).collect(),
            stderr: result.stderr.chars().take(Self::MAX_STREAM_CHARS).collect(),
            duration_secs: result.duration_secs,
            commands,
        }
    }
}

/// Aggregated result of a verification run. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub build_success: bool,
    pub build_output: String,
    pub tests_passed: u32,
    pub tests_total: u32,
    pub test_output: String,
    pub lint_issues: u32,
    pub lint_output: String,
    pub errors: Vec<String>,
    /// Set by the orchestrator once a final score is known.
    pub score: Option<f64>,
    /// No automated check ran; only a code review is possible.
    pub code_review_only: bool,
    pub language: Option<String>,
}

impl VerificationResult {
    pub fn review_only(reason: impl Into<String>) -> Self {
        Self {
            code_review_only: true,
            errors: vec![reason.into()],
            ..Default::default()
        }
    }

    /// Score derived from automated checks alone, out of 10.
    ///
    /// Build success is worth 3, test pass rate up to 4, lint 2 (clean) or 1
    /// (fewer than five issues), and an error-free run 1. Returns `None` when
    /// nothing was actually executed.
    pub fn preliminary_score(&self) -> Option<f64> {
        if self.code_review_only {
            return None;
        }
        let mut score = 0.0;
        if self.build_success {
            score += 3.0;
        }
        if self.tests_total > 0 {
            score += f64::from(self.tests_passed) / f64::from(self.tests_total) * 4.0;
        }
        if self.lint_issues == 0 {
            score += 2.0;
        } else if self.lint_issues < 5 {
            score += 1.0;
        }
        if self.errors.is_empty() {
            score += 1.0;
        }
        Some(f64::min(10.0, score))
    }
}
