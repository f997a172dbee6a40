//! Sandboxed verification of generated projects.
//!
//! Each phase (install, build, test, lint) runs in its own freshly created,
//! hardened container that is force-removed afterwards. Project files move in
//! and out as tar archives rather than bind mounts.

pub mod archive;
pub mod config;
pub mod docker;
pub mod executor;
pub mod interpret;
pub mod runtime;

pub use config::SandboxConfig;
pub use docker::{ContainerRuntime, ContainerSpec, DockerRuntime};
pub use executor::{PhaseObserver, SandboxExecutor};
pub use interpret::{OutputInterpreter, RegexInterpreter};
pub use runtime::{MarkerDetector, RuntimeDetector, RuntimeInfo, Toolchain, VerificationStrategy};
