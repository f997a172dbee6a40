//! Resource-aware worker pool for trigger handling.
//!
//! Triggers go onto one shared queue. Each worker waits for system load to
//! drop below the configured thresholds before taking a unit, and a project
//! that is already being processed drops further triggers until it is free.

pub mod load;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::orchestrator::Orchestrator;
use crate::state::find_project_root;

pub use load::{FixedLoadMonitor, LoadMonitor, LoadSample, ProcLoadMonitor};

/// Work executed for one dequeued trigger.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle(&self, trigger: &Path) -> Result<()>;
}

#[async_trait]
impl TriggerHandler for Orchestrator {
    async fn handle(&self, trigger: &Path) -> Result<()> {
        self.handle_trigger(trigger).await?;
        Ok(())
    }
}

type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

pub struct Scheduler {
    tx: Option<mpsc::UnboundedSender<PathBuf>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: InFlight,
    cancel: CancellationToken,
}

/// Settings shared by all workers.
#[derive(Clone)]
struct WorkerContext {
    workspace: PathBuf,
    config: SchedulerConfig,
    settle: Duration,
    handler: Arc<dyn TriggerHandler>,
    monitor: Arc<dyn LoadMonitor>,
    in_flight: InFlight,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Spawn `config.workers` workers. `settle` is slept (inside the project
    /// slot) before each unit so a trigger file can finish being written.
    /// Slots are keyed by project roots found below `workspace`.
    pub fn start(
        workspace: PathBuf,
        config: SchedulerConfig,
        settle: Duration,
        handler: Arc<dyn TriggerHandler>,
        monitor: Arc<dyn LoadMonitor>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let worker_count = config.workers.max(1);

        let context = WorkerContext {
            workspace,
            config,
            settle,
            handler,
            monitor,
            in_flight: in_flight.clone(),
            cancel: cancel.clone(),
        };
        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker_loop(id, rx.clone(), context.clone())))
            .collect();

        tracing::info!(
            workers = worker_count,
            cpu_threshold = context.config.cpu_threshold,
            memory_threshold = context.config.memory_threshold,
            "Scheduler started"
        );
        Self {
            tx: Some(tx),
            workers,
            in_flight,
            cancel,
        }
    }

    /// Queue a trigger. Returns false once the scheduler is shutting down.
    pub fn submit(&self, trigger: PathBuf) -> bool {
        match &self.tx {
            Some(tx) if !self.cancel.is_cancelled() => tx.send(trigger).is_ok(),
            _ => false,
        }
    }

    /// Projects currently being processed.
    pub fn in_flight(&self) -> Vec<PathBuf> {
        let mut projects: Vec<PathBuf> = self
            .in_flight
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        projects.sort();
        projects
    }

    /// Stop taking work, close the queue and wait for workers. Units already
    /// running finish first.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.tx.take();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Scheduler worker ended abnormally");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PathBuf>>>,
    ctx: WorkerContext,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => None,
                trigger = rx.recv() => trigger,
            }
        };
        let Some(trigger) = next else {
            break;
        };
        if !wait_for_capacity(id, &ctx).await {
            break;
        }

        let project = find_project_root(&trigger, &ctx.workspace).unwrap_or_else(|| trigger.clone());
        let Some(_slot) = ProjectSlot::claim(&ctx.in_flight, &project) else {
            tracing::info!(
                worker = id,
                project = %project.display(),
                "Project already processing, skipping trigger"
            );
            continue;
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.settle) => {}
        }

        tracing::debug!(worker = id, trigger = %trigger.display(), "Processing trigger");
        let handler = ctx.handler.clone();
        let path = trigger.clone();
        match tokio::spawn(async move { handler.handle(&path).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(worker = id, trigger = %trigger.display(), error = %e, "Trigger failed")
            }
            Err(e) => {
                tracing::error!(worker = id, trigger = %trigger.display(), error = %e, "Trigger handler panicked")
            }
        }
    }
    tracing::debug!(worker = id, "Worker exiting");
}

/// Block until load is under both thresholds. Returns false if cancelled.
async fn wait_for_capacity(id: usize, ctx: &WorkerContext) -> bool {
    let mut waits: u32 = 0;
    loop {
        let Some(sample) = ctx.monitor.sample().await else {
            return true;
        };
        if sample.cpu_percent <= ctx.config.cpu_threshold
            && sample.memory_percent <= ctx.config.memory_threshold
        {
            return true;
        }
        if waits % ctx.config.warn_every.max(1) == 0 {
            tracing::warn!(
                worker = id,
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                cpu_threshold = ctx.config.cpu_threshold,
                memory_threshold = ctx.config.memory_threshold,
                "System busy; waiting for load to drop"
            );
        }
        waits = waits.saturating_add(1);
        tokio::select! {
            _ = ctx.cancel.cancelled() => return false,
            _ = tokio::time::sleep(Duration::from_secs(ctx.config.backoff_secs)) => {}
        }
    }
}

/// A project's entry in the in-flight set, released on drop.
struct ProjectSlot {
    set: InFlight,
    project: PathBuf,
}

impl ProjectSlot {
    fn claim(set: &InFlight, project: &Path) -> Option<Self> {
        let mut guard = set.lock().ok()?;
        if !guard.insert(project.to_path_buf()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            project: project.to_path_buf(),
        })
    }
}

impl Drop for ProjectSlot {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.project);
        }
    }
}
