use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tumbler::config::TumblerConfig;
use tumbler::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "tumbler")]
#[command(version, about = "Plan, generate, verify and refine projects in sandboxed loops")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding project folders (defaults to the current directory)
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Configuration file (defaults to <workspace>/tumbler.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the workspace and process trigger files as they change
    Daemon,
    /// Drive one project from requirements to a finished state
    Run {
        /// Project directory name or path
        project: PathBuf,
    },
    /// Show project status (all projects when none is given)
    Status {
        project: Option<PathBuf>,
    },
    /// Reset a project's run state
    Reset {
        project: PathBuf,
        /// Also clear generated plan, staging, feedback and final output
        #[arg(long)]
        full: bool,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Delete a project directory
    Delete {
        project: PathBuf,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Run sandbox verification on a project's staged files without scoring
    Verify {
        project: PathBuf,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default tumbler.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let workspace = match cli.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // `config init` must work even when the existing file is broken.
    if let Commands::Config {
        command: Some(ConfigCommands::Init),
    } = &cli.command
    {
        return cmd::cmd_config_init(&workspace, cli.config.as_deref());
    }

    let config = load_config(&cli, &workspace)?;
    let _log_guard = init_logging(&config.logging, &workspace, cli.verbose)?;

    match &cli.command {
        Commands::Daemon => cmd::cmd_daemon(workspace, config).await?,
        Commands::Run { project } => cmd::cmd_run(workspace, config, project).await?,
        Commands::Status { project } => cmd::cmd_status(&workspace, project.as_deref())?,
        Commands::Reset {
            project,
            full,
            force,
        } => cmd::cmd_reset(&workspace, project, *full, *force)?,
        Commands::Delete { project, force } => cmd::cmd_delete(&workspace, project, *force)?,
        Commands::Verify { project } => cmd::cmd_verify(workspace, config, project).await?,
        Commands::Config { command } => {
            cmd::cmd_config(&workspace, cli.config.as_deref(), &config, command.clone())?
        }
    }

    Ok(())
}

fn load_config(cli: &Cli, workspace: &std::path::Path) -> Result<TumblerConfig> {
    match &cli.config {
        Some(path) => {
            let mut config = TumblerConfig::load(path)?;
            config.apply_env(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => TumblerConfig::load_or_default(workspace),
    }
}
