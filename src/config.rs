//! Workspace configuration, read from `tumbler.toml` in the workspace root.
//!
//! Every field has a default, so an absent file or an empty section is valid.
//! Values are layered: file → environment (`.env` is loaded by the binary via
//! `dotenvy`) → command-line flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [tumbler]
//! max_iterations = 10
//! quality_threshold = 8.0
//! max_cost_per_project = 5.0   # 0.0 means unlimited
//! plateau_window = 3
//! plateau_delta = 0.5
//! debounce_ms = 3000
//!
//! [scheduler]
//! workers = 2
//! cpu_threshold = 85.0
//! memory_threshold = 90.0
//! backoff_secs = 5
//!
//! [verification]
//! timeout_install = 300
//! memory_limit = "2g"
//! network_verify = false
//!
//! [generation]
//! max_output_tokens = 8192
//! tokens_per_file = 550
//! max_fan_out = 7
//! parallel = true
//!
//! [agents.generator]
//! command = "claude"
//! args = ["--print", "--output-format", "json"]
//!
//! [logging]
//! level = "info"
//! format = "json"
//! file = "tumbler.log"
//!
//! [mirror]
//! path = "tumbler.db"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxConfig;

pub const CONFIG_FILE: &str = "tumbler.toml";

/// Refinement loop budgets and trigger timing (`[tumbler]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Cumulative cost ceiling per project in USD; 0.0 disables the check.
    #[serde(default)]
    pub max_cost_per_project: f64,
    /// Number of recent scores compared by the plateau check.
    #[serde(default = "default_plateau_window")]
    pub plateau_window: usize,
    /// Scores within this spread count as a plateau.
    #[serde(default = "default_plateau_delta")]
    pub plateau_delta: f64,
    /// Consecutive degenerate generator outputs tolerated before failing.
    #[serde(default = "default_max_degenerate_retries")]
    pub max_degenerate_retries: u32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause before handling a trigger so a writer can finish the file.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_quality_threshold() -> f64 {
    8.0
}

fn default_plateau_window() -> usize {
    3
}

fn default_plateau_delta() -> f64 {
    0.5
}

fn default_max_degenerate_retries() -> u32 {
    3
}

fn default_debounce_ms() -> u64 {
    3000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_settle_ms() -> u64 {
    1000
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            max_cost_per_project: 0.0,
            plateau_window: default_plateau_window(),
            plateau_delta: default_plateau_delta(),
            max_degenerate_retries: default_max_degenerate_retries(),
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Worker pool and load backoff settings (`[scheduler]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// CPU utilization percentage above which workers back off.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Emit the "waiting for resources" warning every Nth sample.
    #[serde(default = "default_warn_every")]
    pub warn_every: u32,
}

fn default_workers() -> usize {
    2
}

fn default_cpu_threshold() -> f64 {
    85.0
}

fn default_memory_threshold() -> f64 {
    90.0
}

fn default_backoff_secs() -> u64 {
    5
}

fn default_warn_every() -> u32 {
    6
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            backoff_secs: default_backoff_secs(),
            warn_every: default_warn_every(),
        }
    }
}

/// Chunked generation sizing (`[generation]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Output budget of a single generator call, in tokens.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u64,
    /// Estimated output cost of one generated file, in tokens.
    #[serde(default = "default_tokens_per_file")]
    pub tokens_per_file: u64,
    /// Upper bound on concurrent generator calls for one iteration.
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: usize,
    /// Run groups concurrently. When false, groups are generated one after
    /// another, for collaborators that cannot take parallel requests.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_max_output_tokens() -> u64 {
    8192
}

fn default_tokens_per_file() -> u64 {
    550
}

fn default_max_fan_out() -> usize {
    7
}

fn default_parallel() -> bool {
    true
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: default_max_output_tokens(),
            tokens_per_file: default_tokens_per_file(),
            max_fan_out: default_max_fan_out(),
            parallel: default_parallel(),
        }
    }
}

/// External command backing one collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ]
}

fn default_agent_timeout_secs() -> u64 {
    900
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub planner: AgentCommandConfig,
    #[serde(default)]
    pub generator: AgentCommandConfig,
    #[serde(default)]
    pub validator: AgentCommandConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write logs to this file (relative paths resolve against the workspace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Optional SQLite mirror of project state for analytics (`[mirror]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// The complete `tumbler.toml` structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TumblerConfig {
    #[serde(default)]
    pub tumbler: LoopConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub verification: SandboxConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

impl TumblerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse tumbler.toml")
    }

    /// Load `tumbler.toml` from the workspace, or defaults if it does not
    /// exist. Environment overrides are applied either way.
    pub fn load_or_default(workspace: &Path) -> Result<Self> {
        let path = workspace.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `TUMBLER_*` overrides. The lookup is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TUMBLER_MAX_ITERATIONS") {
            self.tumbler.max_iterations = v
                .parse()
                .with_context(|| format!("Invalid TUMBLER_MAX_ITERATIONS '{}'", v))?;
        }
        if let Some(v) = lookup("TUMBLER_QUALITY_THRESHOLD") {
            self.tumbler.quality_threshold = v
                .parse()
                .with_context(|| format!("Invalid TUMBLER_QUALITY_THRESHOLD '{}'", v))?;
        }
        if let Some(v) = lookup("TUMBLER_MAX_COST") {
            self.tumbler.max_cost_per_project = v
                .parse()
                .with_context(|| format!("Invalid TUMBLER_MAX_COST '{}'", v))?;
        }
        if let Some(v) = lookup("TUMBLER_WORKERS") {
            self.scheduler.workers = v
                .parse()
                .with_context(|| format!("Invalid TUMBLER_WORKERS '{}'", v))?;
        }
        if let Some(v) = lookup("TUMBLER_SANDBOX_ENABLED") {
            self.verification.enabled = v != "false" && v != "0";
        }
        if let Some(v) = lookup("TUMBLER_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize tumbler.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Return human-readable warnings; an empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.tumbler.max_iterations == 0 {
            warnings.push("tumbler.max_iterations must be at least 1".to_string());
        }
        if !(0.0..=10.0).contains(&self.tumbler.quality_threshold) {
            warnings.push(format!(
                "tumbler.quality_threshold {} is outside the 0-10 score range",
                self.tumbler.quality_threshold
            ));
        }
        if self.tumbler.max_cost_per_project < 0.0 {
            warnings.push("tumbler.max_cost_per_project cannot be negative".to_string());
        }
        if self.tumbler.plateau_window < 2 {
            warnings.push("tumbler.plateau_window below 2 disables plateau detection".to_string());
        }
        if self.scheduler.workers == 0 {
            warnings.push("scheduler.workers must be at least 1".to_string());
        }
        for (name, value) in [
            ("cpu_threshold", self.scheduler.cpu_threshold),
            ("memory_threshold", self.scheduler.memory_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                warnings.push(format!("scheduler.{} {} is not a percentage", name, value));
            }
        }
        if self.generation.max_fan_out == 0 {
            warnings.push("generation.max_fan_out must be at least 1".to_string());
        }
        if self.generation.tokens_per_file == 0 {
            warnings.push("generation.tokens_per_file must be at least 1".to_string());
        }
        if let Err(e) = self.logging.level.parse::<tracing_subscriber::EnvFilter>() {
            warnings.push(format!("Invalid logging.level '{}': {}", self.logging.level, e));
        }
        warnings.extend(
            self.verification
                .validate()
                .into_iter()
                .map(|w| format!("verification: {}", w)),
        );

        warnings
    }
}
