//! Polling watcher for trigger artifacts.
//!
//! The workspace is scanned on a fixed interval with `walkdir`; a trigger
//! file that appears or whose modification time changes is reported once
//! per debounce window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::state::{INPUT_DIR, MANIFEST_FILE, PLAN_DIR, PLAN_FILE, REQUIREMENTS_FILE, STAGING_DIR};

/// Workspace → project → phase dir → trigger file.
const SCAN_DEPTH: usize = 3;

const SKIPPED_DIRS: &[&str] = &[".tumbler", ".git", "node_modules", "target", "05_final"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// `01_input/requirements.txt`: start or resume a run.
    Requirements,
    /// `02_plan/PLAN.md`: run an engineering iteration.
    Plan,
    /// `03_staging/.manifest.json`: verify and evaluate.
    Manifest,
}

/// Which trigger, if any, `path` is.
pub fn classify_trigger(path: &Path) -> Option<TriggerKind> {
    let file = path.file_name()?.to_str()?;
    let dir = path.parent()?.file_name()?.to_str()?;
    match (dir, file) {
        (INPUT_DIR, REQUIREMENTS_FILE) => Some(TriggerKind::Requirements),
        (PLAN_DIR, PLAN_FILE) => Some(TriggerKind::Plan),
        (STAGING_DIR, MANIFEST_FILE) => Some(TriggerKind::Manifest),
        _ => None,
    }
}

/// Suppresses repeat events for the same path inside `window`.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// True if `path` has not fired within the window ending at `now`;
    /// records the firing when it returns true.
    pub fn should_fire(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(previous) = self.last.get(path)
            && now.saturating_duration_since(*previous) < self.window
        {
            return false;
        }
        self.last.insert(path.to_path_buf(), now);
        true
    }
}

/// Scans a workspace for new or modified trigger files.
pub struct TriggerWatcher {
    root: PathBuf,
    interval: Duration,
    debouncer: Debouncer,
    seen: HashMap<PathBuf, SystemTime>,
}

impl TriggerWatcher {
    pub fn new(root: impl Into<PathBuf>, interval: Duration, debounce: Duration) -> Self {
        Self {
            root: root.into(),
            interval,
            debouncer: Debouncer::new(debounce),
            seen: HashMap::new(),
        }
    }

    /// Record the current modification times without reporting anything, so
    /// triggers that existed before the watcher started do not fire.
    pub fn prime(&mut self) {
        self.seen = self.snapshot();
        tracing::debug!(root = %self.root.display(), triggers = self.seen.len(), "Watcher primed");
    }

    /// Trigger files created or modified since the previous scan, after
    /// debouncing.
    pub fn scan(&mut self, now: Instant) -> Vec<PathBuf> {
        let current = self.snapshot();
        let mut changed: Vec<PathBuf> = current
            .iter()
            .filter(|(path, mtime)| self.seen.get(*path) != Some(*mtime))
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();
        self.seen = current;

        changed
            .into_iter()
            .filter(|path| {
                let fire = self.debouncer.should_fire(path, now);
                if !fire {
                    tracing::debug!(path = %path.display(), "Debounced trigger");
                }
                fire
            })
            .collect()
    }

    fn snapshot(&self) -> HashMap<PathBuf, SystemTime> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(SCAN_DEPTH)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && SKIPPED_DIRS.contains(&&*entry.file_name().to_string_lossy()))
            })
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && classify_trigger(entry.path()).is_some())
            .filter_map(|entry| {
                let mtime = entry.metadata().ok()?.modified().ok()?;
                Some((entry.into_path(), mtime))
            })
            .collect()
    }

    /// Poll until `cancel` fires or the receiver goes away, sending each
    /// trigger on `tx`.
    pub async fn run(mut self, tx: mpsc::Sender<PathBuf>, cancel: CancellationToken) {
        self.prime();
        tracing::info!(
            root = %self.root.display(),
            interval_ms = self.interval.as_millis() as u64,
            "Watching for triggers"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for path in self.scan(Instant::now()) {
                tracing::info!(path = %path.display(), "Trigger detected");
                if tx.send(path).await.is_err() {
                    return;
                }
            }
        }
        tracing::info!("Watcher stopped");
    }
}
