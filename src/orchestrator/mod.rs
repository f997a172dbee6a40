//! Project phase state machine: IDLE → PLANNING → ENGINEERING → VERIFYING →
//! {ENGINEERING | COMPLETED | FAILED}.

pub mod cycle;
pub mod evaluate;
pub mod finalize;
pub mod generation;
pub mod plan;

pub use cycle::Orchestrator;
pub use evaluate::{Outcome, evaluate};
pub use generation::{GenerationStrategy, Manifest};
