//! CLI command implementations.
//!
//! | Module    | Commands handled                 |
//! |-----------|----------------------------------|
//! | `daemon`  | `Daemon`                         |
//! | `run`     | `Run`, `Verify`                  |
//! | `project` | `Status`, `Reset`, `Delete`      |
//! | `config`  | `Config`                         |

pub mod config;
pub mod daemon;
pub mod project;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::Result;

pub use config::{cmd_config, cmd_config_init};
pub use daemon::cmd_daemon;
pub use project::{cmd_delete, cmd_reset, cmd_status};
pub use run::{cmd_run, cmd_verify};

/// Resolve a project argument against the workspace and require it to exist.
pub fn resolve_project(workspace: &Path, project: &Path) -> Result<PathBuf> {
    let path = if project.is_absolute() {
        project.to_path_buf()
    } else {
        workspace.join(project)
    };
    if !path.is_dir() {
        anyhow::bail!("Project not found: {}", path.display());
    }
    Ok(path)
}
