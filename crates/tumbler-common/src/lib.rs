//! Shared domain types for the Tumbler orchestrator.
//!
//! Everything in this crate is plain data: the persisted project state, the
//! append-only usage ledger and conversation log, and the per-run results the
//! sandbox hands back to the orchestrator. None of it does I/O.

pub mod conversation;
pub mod state;
pub mod usage;
pub mod verification;

pub use conversation::{AgentKind, ConversationEntry, Role};
pub use state::{
    CompressionConfig, LimitOverrides, ParseStatusError, ProjectState, ProjectStatus,
    VerificationOverrides,
};
pub use usage::{AgentUsage, UsageLedger, UsageRecord};
pub use verification::{CommandResult, PhaseReport, PhaseStatus, SandboxPhase, VerificationResult};
