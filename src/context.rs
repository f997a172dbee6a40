//! Process-wide wiring: configuration, mirror, sandbox executor,
//! collaborators, the worker pool and the cancellation token.
//!
//! Nothing here is global. Commands build one `RuntimeContext`, use it, and
//! call [`RuntimeContext::shutdown`] on the way out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::agents::Agents;
use crate::config::TumblerConfig;
use crate::orchestrator::Orchestrator;
use crate::sandbox::SandboxExecutor;
use crate::scheduler::{LoadMonitor, ProcLoadMonitor, Scheduler};
use crate::state::{NoopMirror, SqliteMirror, StateMirror, StateStore};

pub struct RuntimeContext {
    workspace: PathBuf,
    config: TumblerConfig,
    mirror: Arc<dyn StateMirror>,
    executor: Arc<SandboxExecutor>,
    orchestrator: Orchestrator,
    cancel: CancellationToken,
    scheduler: Option<Scheduler>,
}

impl RuntimeContext {
    /// Connect to the container runtime, open the mirror and build
    /// command-backed collaborators from `config`.
    pub async fn build(workspace: impl Into<PathBuf>, config: TumblerConfig) -> Result<Self> {
        let workspace = workspace.into();
        let executor = SandboxExecutor::connect(config.verification.clone()).await;
        let agents = Agents::from_config(&config.agents);
        Ok(Self::with_parts(workspace, config, agents, executor))
    }

    /// Assemble from already-built collaborators and executor.
    pub fn with_parts(
        workspace: PathBuf,
        config: TumblerConfig,
        agents: Agents,
        executor: SandboxExecutor,
    ) -> Self {
        let mirror = open_mirror(&workspace, &config);
        let executor = Arc::new(executor);
        let orchestrator = Orchestrator::new(
            workspace.clone(),
            agents,
            executor.clone(),
            config.tumbler.clone(),
            config.generation.clone(),
        )
        .with_mirror(mirror.clone());
        Self {
            workspace,
            config,
            mirror,
            executor,
            orchestrator,
            cancel: CancellationToken::new(),
            scheduler: None,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &TumblerConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn open_store(&self, project: &Path) -> Result<StateStore> {
        Ok(StateStore::open(project, self.mirror.clone())?)
    }

    /// Start the worker pool with the `/proc` load monitor.
    pub fn start_scheduler(&mut self) -> &Scheduler {
        self.start_scheduler_with(Arc::new(ProcLoadMonitor::default()))
    }

    pub fn start_scheduler_with(&mut self, monitor: Arc<dyn LoadMonitor>) -> &Scheduler {
        let settle = Duration::from_millis(self.config.tumbler.settle_ms);
        let handler = Arc::new(self.orchestrator.clone());
        let config = self.config.scheduler.clone();
        let cancel = self.cancel.clone();
        let workspace = self.workspace.clone();
        self.scheduler
            .get_or_insert_with(|| Scheduler::start(workspace, config, settle, handler, monitor, cancel))
    }

    /// Queue a trigger on the worker pool. False when the pool is not
    /// running or is shutting down.
    pub fn submit(&self, trigger: PathBuf) -> bool {
        self.scheduler
            .as_ref()
            .is_some_and(|scheduler| scheduler.submit(trigger))
    }

    /// Cancel outstanding work and wait for the pool to drain.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
        tracing::debug!(workspace = %self.workspace.display(), "Runtime context shut down");
    }
}

fn open_mirror(workspace: &Path, config: &TumblerConfig) -> Arc<dyn StateMirror> {
    let Some(path) = &config.mirror.path else {
        return Arc::new(NoopMirror);
    };
    let path = if path.is_absolute() {
        path.clone()
    } else {
        workspace.join(path)
    };
    match SqliteMirror::open(&path) {
        Ok(mirror) => {
            tracing::info!(path = %path.display(), "State mirror enabled");
            Arc::new(mirror)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "State mirror unavailable; continuing without it");
            Arc::new(NoopMirror)
        }
    }
}
