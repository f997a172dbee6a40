pub mod agents;
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod sandbox;
pub mod scheduler;
pub mod state;
pub mod watcher;
