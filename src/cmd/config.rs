//! Configuration view and validation commands: `tumbler config`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use tumbler::config::{CONFIG_FILE, TumblerConfig};

use super::super::ConfigCommands;

fn config_path(workspace: &Path, explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| workspace.join(CONFIG_FILE))
}

pub fn cmd_config(
    workspace: &Path,
    explicit: Option<&Path>,
    config: &TumblerConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let path = config_path(workspace, explicit);
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No {} found at {}; using defaults.", CONFIG_FILE, path.display());
            }
            println!("Effective values (with environment overrides):");
            println!();
            let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();
            if !path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                println!();
                anyhow::bail!("{} configuration problem(s) found", warnings.len());
            }
            println!();
        }
        Some(ConfigCommands::Init) => cmd_config_init(workspace, explicit)?,
    }
    Ok(())
}

/// Write a default configuration file unless one already exists.
pub fn cmd_config_init(workspace: &Path, explicit: Option<&Path>) -> Result<()> {
    let path = config_path(workspace, explicit);
    if path.exists() {
        println!("{} already exists at {}", CONFIG_FILE, path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    TumblerConfig::default().save(&path)?;
    println!("Created {}", path.display());
    Ok(())
}
