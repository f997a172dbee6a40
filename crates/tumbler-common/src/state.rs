use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a project.
///
/// `Idle → Planning → Engineering → Verifying`, then either back to
/// `Engineering` for another refinement pass or into one of the two terminal
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Idle,
    Planning,
    Engineering,
    Verifying,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Idle => "idle",
            ProjectStatus::Planning => "planning",
            ProjectStatus::Engineering => "engineering",
            ProjectStatus::Verifying => "verifying",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` end a run; nothing advances from them
    /// without a reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Failed)
    }

    /// True while a phase is (or was, before a crash) running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProjectStatus::Planning | ProjectStatus::Engineering | ProjectStatus::Verifying
        )
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Invalid project status '{0}'. Valid values: idle, planning, engineering, verifying, completed, failed")]
pub struct ParseStatusError(pub String);

impl FromStr for ProjectStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(ProjectStatus::Idle),
            "planning" => Ok(ProjectStatus::Planning),
            "engineering" => Ok(ProjectStatus::Engineering),
            "verifying" => Ok(ProjectStatus::Verifying),
            "completed" => Ok(ProjectStatus::Completed),
            "failed" => Ok(ProjectStatus::Failed),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Prompt compression settings forwarded to the collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub rate: f64,
    pub preserve_code_blocks: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: 0.5,
            preserve_code_blocks: true,
        }
    }
}

/// Per-project overrides layered on top of the global `[verification]`
/// configuration. `None` means "use the global value".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_install: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_build: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_test: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_lint: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmpfs_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_install: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_verify: Option<bool>,
}

impl VerificationOverrides {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Fields set in `other` win over fields set in `self`.
    pub fn merge(&mut self, other: VerificationOverrides) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            timeout_install,
            timeout_build,
            timeout_test,
            timeout_lint,
            memory_limit,
            cpu_limit,
            tmpfs_size,
            network_install,
            network_verify
        );
    }
}

/// Per-project run limits. `None` means "use the `[tumbler]` value"; the
/// effective values are copied onto [`ProjectState`] when a run starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Fields set in `other` win over fields set in `self`.
    pub fn merge(&mut self, other: LimitOverrides) {
        if other.max_iterations.is_some() {
            self.max_iterations = other.max_iterations;
        }
        if other.quality_threshold.is_some() {
            self.quality_threshold = other.quality_threshold;
        }
        if other.max_cost.is_some() {
            self.max_cost = other.max_cost;
        }
    }
}

/// The persisted state document of one project (`.tumbler/state.json`).
///
/// `error` is set exactly when `status` is `Failed`; use [`ProjectState::transition`]
/// and [`ProjectState::fail`] rather than assigning `status` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectState {
    pub name: String,
    pub status: ProjectStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub quality_threshold: f64,
    /// Cumulative cost ceiling in USD for this run; 0.0 disables the check.
    pub max_cost: f64,
    pub last_score: Option<f64>,
    /// Scores of the current run, oldest first.
    pub scores: Vec<f64>,
    pub provider_overrides: BTreeMap<String, serde_json::Value>,
    pub verification: VerificationOverrides,
    pub limits: LimitOverrides,
    pub compression: CompressionConfig,
    pub error: Option<String>,
    /// SHA-256 of the plan produced by the last completed planning phase.
    pub plan_digest: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self::new("")
    }
}

impl ProjectState {
    pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
    pub const DEFAULT_QUALITY_THRESHOLD: f64 = 8.0;

    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status: ProjectStatus::Idle,
            iteration: 0,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            quality_threshold: Self::DEFAULT_QUALITY_THRESHOLD,
            max_cost: 0.0,
            last_score: None,
            scores: Vec::new(),
            provider_overrides: BTreeMap::new(),
            verification: VerificationOverrides::default(),
            limits: LimitOverrides::default(),
            compression: CompressionConfig::default(),
            error: None,
            plan_digest: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to a non-failed status, clearing any previous error.
    pub fn transition(&mut self, status: ProjectStatus) {
        self.status = status;
        if status != ProjectStatus::Failed {
            self.error = None;
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ProjectStatus::Failed;
        self.error = Some(reason.into());
    }

    pub fn record_score(&mut self, score: f64) {
        self.last_score = Some(score);
        self.scores.push(score);
    }

    /// Clear everything that belongs to a single run. Overrides and
    /// thresholds survive.
    pub fn reset_run(&mut self) {
        self.transition(ProjectStatus::Idle);
        self.iteration = 0;
        self.last_score = None;
        self.scores.clear();
        self.plan_digest = None;
        self.started_at = Utc::now();
    }

    pub fn is_complete(&self) -> bool {
        let met = self
            .last_score
            .is_some_and(|score| score >= self.quality_threshold);
        met || self.iteration >= self.max_iterations
    }

    /// Copy the effective limits for a new run: per-project overrides first,
    /// then the supplied defaults.
    pub fn apply_limits(&mut self, max_iterations: u32, quality_threshold: f64, max_cost: f64) {
        self.max_iterations = self.limits.max_iterations.unwrap_or(max_iterations);
        self.quality_threshold = self.limits.quality_threshold.unwrap_or(quality_threshold);
        self.max_cost = self.limits.max_cost.unwrap_or(max_cost);
    }
}
