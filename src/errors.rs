//! Typed error hierarchy for Tumbler.
//!
//! One enum per subsystem:
//! - `StoreError`: project state, usage and conversation persistence
//! - `SandboxError`: container runtime and archive transfer failures
//! - `AgentError`: planner/generator/validator collaborator failures
//! - `OrchestratorError`: phase and cycle failures
//!
//! Budget outcomes (cost, plateau, iteration cap) are not errors; they are
//! reported through `orchestrator::Outcome`.

use std::path::PathBuf;

use thiserror::Error;
use tumbler_common::{AgentKind, SandboxPhase};

/// Errors from the project state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Project directory {0} does not exist")]
    MissingProject(PathBuf),
}

/// Errors from the container runtime. The executor never lets these escape a
/// verification run; they become failed phases or a review-only result.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Container operation failed during {phase}: {reason}")]
    Container { phase: SandboxPhase, reason: String },

    #[error("Archive transfer failed: {0}")]
    Archive(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a collaborator call.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{agent} produced degenerate repetitive output")]
    Degenerate { agent: AgentKind },

    #[error("Failed to spawn {agent} command '{command}': {source}")]
    Spawn {
        agent: AgentKind,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{agent} exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        agent: AgentKind,
        exit_code: i32,
        stderr: String,
    },

    #[error("Malformed {agent} output: {message}")]
    Malformed { agent: AgentKind, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn is_degenerate(&self) -> bool {
        matches!(self, AgentError::Degenerate { .. })
    }
}

/// Errors that end a phase and mark the project failed.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Requirements file not found")]
    MissingRequirements(PathBuf),

    #[error("Plan file not found at {0}")]
    MissingPlan(PathBuf),

    #[error("Could not determine project root for {0}")]
    NoProjectRoot(PathBuf),

    #[error("Generation produced no files ({chunks} chunk(s) attempted)")]
    NoFilesGenerated { chunks: usize },

    #[error("Generator produced degenerate output {attempts} times in a row")]
    DegenerateLimit { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_write_carries_path() {
        let path = PathBuf::from("/work/demo/.tumbler/state.json");
        let err = StoreError::Write {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        match &err {
            StoreError::Write { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Write"),
        }
        assert!(err.to_string().contains("state.json"));
    }

    #[test]
    fn agent_error_degenerate_is_detected() {
        let err = AgentError::Degenerate {
            agent: AgentKind::Generator,
        };
        assert!(err.is_degenerate());
        assert!(err.to_string().contains("generator"));
        assert!(!AgentError::Other(anyhow::anyhow!("x")).is_degenerate());
    }

    #[test]
    fn orchestrator_error_converts_from_agent_error() {
        let inner = AgentError::Malformed {
            agent: AgentKind::Generator,
            message: "not json".into(),
        };
        let err: OrchestratorError = inner.into();
        assert!(matches!(
            err,
            OrchestratorError::Agent(AgentError::Malformed { .. })
        ));
    }

    #[test]
    fn missing_requirements_message_is_stable() {
        let err = OrchestratorError::MissingRequirements(PathBuf::from("01_input/requirements.txt"));
        assert_eq!(err.to_string(), "Requirements file not found");
    }

    #[test]
    fn sandbox_error_names_phase() {
        let err = SandboxError::Container {
            phase: SandboxPhase::Build,
            reason: "no such image".into(),
        };
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::MissingProject(PathBuf::from("/x")));
        assert_std_error(&SandboxError::Unavailable("down".into()));
        assert_std_error(&AgentError::Degenerate {
            agent: AgentKind::Validator,
        });
        assert_std_error(&OrchestratorError::NoFilesGenerated { chunks: 3 });
    }
}
