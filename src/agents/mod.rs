//! Planner, generator and validator collaborators.
//!
//! The orchestrator only sees the traits below. [`CommandAgent`] implements
//! all three by piping a prompt into an external CLI.

pub mod command;
pub mod parse;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tumbler_common::VerificationResult;

use crate::config::AgentsConfig;
use crate::errors::AgentError;

pub use command::CommandAgent;
pub use parse::{extract_report_score, is_degenerate, parse_generated_files};

/// Tokens and cost reported for one collaborator call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Free-text reply (a plan or a report).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub project: String,
    pub requirements: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub project: String,
    pub plan: String,
    pub iteration: u32,
    /// Validator feedback from the previous iteration.
    pub feedback: Option<String>,
    /// Files staged by the previous iteration.
    pub previous_code: BTreeMap<String, String>,
    /// Restrict output to these planned files; empty means the whole plan.
    pub target_files: Vec<String>,
}

/// Files produced by one generator call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedFiles {
    pub files: BTreeMap<String, String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationRequest {
    pub project: String,
    pub plan: String,
    pub iteration: u32,
    pub files: BTreeMap<String, String>,
    pub verification: VerificationResult,
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce the contents of `PLAN.md`.
    async fn plan(&self, request: &PlanRequest) -> Result<AgentReply, AgentError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedFiles, AgentError>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// Produce a markdown report, ideally carrying `**Overall Score**: N/10`.
    async fn validate(&self, request: &ValidationRequest) -> Result<AgentReply, AgentError>;
}

/// The three collaborators a cycle needs.
#[derive(Clone)]
pub struct Agents {
    pub planner: Arc<dyn Planner>,
    pub generator: Arc<dyn Generator>,
    pub validator: Arc<dyn Validator>,
}

impl Agents {
    pub fn new(
        planner: Arc<dyn Planner>,
        generator: Arc<dyn Generator>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self {
            planner,
            generator,
            validator,
        }
    }

    /// Command-backed collaborators from `[agents]`.
    pub fn from_config(config: &AgentsConfig) -> Self {
        Self {
            planner: Arc::new(CommandAgent::planner(config.planner.clone())),
            generator: Arc::new(CommandAgent::generator(config.generator.clone())),
            validator: Arc::new(CommandAgent::validator(config.validator.clone())),
        }
    }
}
