use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tumbler_common::{
    AgentKind, CompressionConfig, ConversationEntry, LimitOverrides, ProjectState, ProjectStatus,
    UsageLedger, UsageRecord, VerificationOverrides,
};

use super::mirror::{NoopMirror, StateMirror};
use super::safety::{DeletionReport, safe_clear_dir, safe_delete_tree};
use super::{ProjectLayout, REGENERABLE_DIRS, STATE_SUBDIRS};
use crate::errors::StoreError;

/// Reads and writes one project's `.tumbler/` documents.
///
/// Every mutation is a whole-document read-modify-write; callers serialize
/// access per project (the scheduler runs at most one unit per project).
#[derive(Clone)]
pub struct StateStore {
    layout: ProjectLayout,
    mirror: Arc<dyn StateMirror>,
}

impl StateStore {
    /// Open the store for an existing project directory, creating `.tumbler/`
    /// and its `logs/` directory if needed.
    pub fn open(root: impl Into<PathBuf>, mirror: Arc<dyn StateMirror>) -> Result<Self, StoreError> {
        let layout = ProjectLayout::new(root);
        if !layout.root().is_dir() {
            return Err(StoreError::MissingProject(layout.root().to_path_buf()));
        }
        let logs = layout.logs_dir();
        fs::create_dir_all(&logs).map_err(|source| StoreError::Write { path: logs, source })?;
        Ok(Self { layout, mirror })
    }

    /// Open without a mirror.
    pub fn open_local(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open(root, Arc::new(NoopMirror))
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn name(&self) -> String {
        self.layout.name()
    }

    /// Load the state document. A missing or unreadable document yields a
    /// fresh default state rather than an error.
    pub fn load(&self) -> ProjectState {
        let path = self.layout.state_file();
        let mut state = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<ProjectState>(&content) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(
                        project = %self.name(),
                        error = %e,
                        "State file is corrupt; starting from defaults"
                    );
                    ProjectState::new(self.name())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProjectState::new(self.name()),
            Err(e) => {
                tracing::warn!(project = %self.name(), error = %e, "State file unreadable; starting from defaults");
                ProjectState::new(self.name())
            }
        };
        if state.name.is_empty() {
            state.name = self.name();
        }
        state
    }

    /// Persist `state`, stamping `updated_at`. The mirror is updated afterwards
    /// and its failures are only logged.
    pub fn save(&self, state: &mut ProjectState) -> Result<(), StoreError> {
        state.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(state).map_err(|source| StoreError::Serialize {
            what: "project state",
            source,
        })?;
        write_atomic(&self.layout.state_file(), json.as_bytes())?;

        if let Err(e) = self.mirror.upsert_project(self.layout.root(), state) {
            tracing::warn!(project = %state.name, error = %e, "State mirror update failed");
        }
        Ok(())
    }

    /// Load, apply `f`, save, and return the saved state.
    pub fn update<F>(&self, f: F) -> Result<ProjectState, StoreError>
    where
        F: FnOnce(&mut ProjectState),
    {
        let mut state = self.load();
        f(&mut state);
        self.save(&mut state)?;
        Ok(state)
    }

    pub fn update_status(&self, status: ProjectStatus) -> Result<ProjectState, StoreError> {
        self.update(|s| s.transition(status))
    }

    /// Bump the iteration counter and return the new value.
    pub fn increment_iteration(&self) -> Result<u32, StoreError> {
        self.update(|s| s.iteration += 1).map(|s| s.iteration)
    }

    pub fn set_score(&self, score: f64) -> Result<ProjectState, StoreError> {
        self.update(|s| s.record_score(score))
    }

    pub fn mark_failed(&self, reason: &str) -> Result<ProjectState, StoreError> {
        tracing::error!(project = %self.name(), reason = %reason, "Project failed");
        self.update(|s| s.fail(reason))
    }

    pub fn set_plan_digest(&self, digest: Option<String>) -> Result<ProjectState, StoreError> {
        self.update(|s| s.plan_digest = digest)
    }

    pub fn set_provider_overrides(
        &self,
        overrides: BTreeMap<String, serde_json::Value>,
    ) -> Result<ProjectState, StoreError> {
        self.update(|s| s.provider_overrides = overrides)
    }

    pub fn set_compression_config(
        &self,
        compression: CompressionConfig,
    ) -> Result<ProjectState, StoreError> {
        self.update(|s| s.compression = compression)
    }

    /// Merge `overrides` into the project's verification overrides.
    pub fn set_verification_overrides(
        &self,
        overrides: VerificationOverrides,
    ) -> Result<ProjectState, StoreError> {
        self.update(|s| s.verification.merge(overrides))
    }

    /// Merge `limits` into the project's run limits. They take effect on the
    /// next fresh run.
    pub fn set_limit_overrides(&self, limits: LimitOverrides) -> Result<ProjectState, StoreError> {
        self.update(|s| s.limits.merge(limits))
    }

    /// Prepare for a fresh run: clear iteration, score history, error and
    /// plan digest, and empty the conversation log. Overrides are kept.
    pub fn reset_for_run(&self) -> Result<ProjectState, StoreError> {
        let state = self.update(|s| s.reset_run())?;
        self.clear_conversation();
        Ok(state)
    }

    /// Return the project to a pristine state.
    ///
    /// Provider overrides and run limits survive; usage, conversation, logs and every
    /// regenerable project directory are removed. The directories are
    /// recreated empty.
    pub fn full_reset(&self) -> Result<DeletionReport, StoreError> {
        let previous = self.load();
        let mut state = ProjectState::new(self.name());
        state.provider_overrides = previous.provider_overrides;
        state.limits = previous.limits;
        self.save(&mut state)?;

        let mut report = DeletionReport::default();
        let usage = self.layout.usage_file();
        match fs::remove_file(&usage) {
            Ok(()) => report.deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %usage.display(), error = %e, "Usage file not removed");
                report.skipped += 1;
            }
        }
        self.clear_conversation();

        let root = self.layout.root();
        let state_dir = self.layout.state_dir();
        for name in STATE_SUBDIRS {
            report += safe_clear_dir(root, &state_dir, name, &STATE_SUBDIRS);
        }
        for name in REGENERABLE_DIRS {
            report += safe_clear_dir(root, root, name, &REGENERABLE_DIRS);
            let dir = root.join(name);
            if !dir.exists() {
                fs::create_dir_all(&dir).map_err(|source| StoreError::Write { path: dir, source })?;
            }
        }

        tracing::info!(
            project = %self.name(),
            deleted = report.deleted,
            skipped = report.skipped,
            "Project reset"
        );
        Ok(report)
    }

    /// Delete the whole project directory. Consumes the store since nothing
    /// is left to operate on.
    pub fn safe_delete_project(self) -> DeletionReport {
        let report = safe_delete_tree(self.layout.root());
        tracing::info!(
            project = %self.name(),
            deleted = report.deleted,
            skipped = report.skipped,
            "Project deleted"
        );
        report
    }

    // ── usage ────────────────────────────────────────────────────────────

    pub fn load_usage(&self) -> UsageLedger {
        let path = self.layout.usage_file();
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(project = %self.name(), error = %e, "Usage file is corrupt; treating as empty");
                UsageLedger::default()
            }),
            Err(_) => UsageLedger::default(),
        }
    }

    /// Append a usage record and update the running totals.
    pub fn log_usage(
        &self,
        agent: AgentKind,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        compression: Option<serde_json::Value>,
    ) -> Result<UsageLedger, StoreError> {
        let mut record = UsageRecord::new(agent, input_tokens, output_tokens, cost);
        record.compression = compression;

        let mut ledger = self.load_usage();
        ledger.record(record.clone());
        let json = serde_json::to_string_pretty(&ledger).map_err(|source| StoreError::Serialize {
            what: "usage ledger",
            source,
        })?;
        write_atomic(&self.layout.usage_file(), json.as_bytes())?;

        let iteration = self.load().iteration;
        if let Err(e) = self.mirror.record_usage(&self.name(), iteration, &record) {
            tracing::warn!(project = %self.name(), error = %e, "Usage mirror update failed");
        }
        Ok(ledger)
    }

    /// Cumulative cost; 0.0 when no usage has been recorded or the file is unreadable.
    pub fn total_cost(&self) -> f64 {
        self.load_usage().total_cost
    }

    // ── conversation ─────────────────────────────────────────────────────

    /// Append one entry. Failures are logged; the audit trail never blocks a phase.
    pub fn log_conversation(&self, entry: &ConversationEntry) {
        let path = self.layout.conversation_file();
        let result = serde_json::to_string(entry)
            .map_err(std::io::Error::other)
            .and_then(|line| {
                let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
                writeln!(file, "{}", line)
            });
        if let Err(e) = result {
            tracing::warn!(project = %self.name(), error = %e, "Failed to append conversation entry");
        }
    }

    /// All readable entries, oldest first. Malformed lines are skipped.
    pub fn load_conversation(&self) -> Vec<ConversationEntry> {
        let Ok(content) = fs::read_to_string(self.layout.conversation_file()) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed conversation line");
                    None
                }
            })
            .collect()
    }

    pub fn clear_conversation(&self) {
        let path = self.layout.conversation_file();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to clear conversation log")
            }
        }
    }
}

/// Write to a sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SqliteMirror, STAGING_DIR};
    use tumbler_common::Role;

    fn make_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("todo-app");
        fs::create_dir_all(root.join("01_input")).unwrap();
        let store = StateStore::open_local(&root).unwrap();
        (dir, store)
    }

    struct FailingMirror;

    impl StateMirror for FailingMirror {
        fn upsert_project(&self, _root: &Path, _state: &ProjectState) -> anyhow::Result<()> {
            anyhow::bail!("database is down")
        }

        fn record_usage(&self, _: &str, _: u32, _: &UsageRecord) -> anyhow::Result<()> {
            anyhow::bail!("database is down")
        }
    }

    #[test]
    fn test_open_missing_project_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = StateStore::open_local(dir.path().join("nope"));
        assert!(matches!(result, Err(StoreError::MissingProject(_))));
    }

    #[test]
    fn test_load_defaults_when_absent() {
        let (_dir, store) = make_store();
        let state = store.load();
        assert_eq!(state.name, "todo-app");
        assert_eq!(state.status, ProjectStatus::Idle);
        assert_eq!(state.iteration, 0);
    }

    #[test]
    fn test_load_defaults_when_corrupt() {
        let (_dir, store) = make_store();
        fs::write(store.layout().state_file(), "{ not json").unwrap();
        let state = store.load();
        assert_eq!(state.name, "todo-app");
        assert_eq!(state.status, ProjectStatus::Idle);
    }

    #[test]
    fn test_recovery_after_restart() {
        let (_dir, store) = make_store();
        store.update_status(ProjectStatus::Engineering).unwrap();
        store.increment_iteration().unwrap();
        store.set_score(6.5).unwrap();

        let reopened = StateStore::open_local(store.layout().root()).unwrap();
        let state = reopened.load();
        assert_eq!(state.status, ProjectStatus::Engineering);
        assert_eq!(state.iteration, 1);
        assert_eq!(state.last_score, Some(6.5));
        assert_eq!(state.scores, vec![6.5]);
        assert!(!store.layout().state_dir().join("state.tmp").exists());
    }

    #[test]
    fn test_increment_iteration_returns_new_value() {
        let (_dir, store) = make_store();
        assert_eq!(store.increment_iteration().unwrap(), 1);
        assert_eq!(store.increment_iteration().unwrap(), 2);
    }

    #[test]
    fn test_mark_failed_sets_error() {
        let (_dir, store) = make_store();
        let state = store.mark_failed("Requirements file not found").unwrap();
        assert_eq!(state.status, ProjectStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("Requirements file not found"));
        let state = store.update_status(ProjectStatus::Idle).unwrap();
        assert!(state.error.is_none());
    }

    #[test]
    fn test_mirror_failure_does_not_fail_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), Arc::new(FailingMirror)).unwrap();
        store.update_status(ProjectStatus::Planning).unwrap();
        store
            .log_usage(AgentKind::Planner, 10, 10, 0.1, None)
            .unwrap();
        assert_eq!(store.load().status, ProjectStatus::Planning);
    }

    #[test]
    fn test_save_reaches_sqlite_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mirrored");
        fs::create_dir_all(&root).unwrap();
        let mirror = Arc::new(SqliteMirror::open_in_memory().unwrap());
        let store = StateStore::open(&root, mirror.clone()).unwrap();
        store.update_status(ProjectStatus::Verifying).unwrap();
        let (status, _, _) = mirror.project_summary("mirrored").unwrap().unwrap();
        assert_eq!(status, "verifying");
    }

    #[test]
    fn test_log_usage_accumulates() {
        let (_dir, store) = make_store();
        assert_eq!(store.total_cost(), 0.0);
        store
            .log_usage(AgentKind::Generator, 100, 200, 0.5, None)
            .unwrap();
        let ledger = store
            .log_usage(
                AgentKind::Generator,
                10,
                20,
                0.25,
                Some(serde_json::json!({"ratio": 0.4})),
            )
            .unwrap();
        assert_eq!(ledger.total_tokens, 330);
        assert_eq!(ledger.by_agent["generator"].calls, 2);
        assert!((store.total_cost() - 0.75).abs() < 1e-9);
        assert!(store.load_usage().history[1].compression.is_some());
    }

    #[test]
    fn test_total_cost_zero_when_usage_corrupt() {
        let (_dir, store) = make_store();
        fs::write(store.layout().usage_file(), "garbage").unwrap();
        assert_eq!(store.total_cost(), 0.0);
    }

    #[test]
    fn test_conversation_append_and_skip_malformed() {
        let (_dir, store) = make_store();
        store.log_conversation(&ConversationEntry::new(
            AgentKind::System,
            Role::Status,
            0,
            "Starting",
        ));
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.layout().conversation_file())
            .unwrap();
        writeln!(file, "{{ broken").unwrap();
        store.log_conversation(&ConversationEntry::new(
            AgentKind::Planner,
            Role::Output,
            0,
            "# Plan",
        ));

        let entries = store.load_conversation();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].agent, AgentKind::Planner);

        store.clear_conversation();
        assert!(store.load_conversation().is_empty());
    }

    #[test]
    fn test_reset_for_run_preserves_overrides() {
        let (_dir, store) = make_store();
        store
            .set_verification_overrides(VerificationOverrides {
                timeout_build: Some(900),
                ..Default::default()
            })
            .unwrap();
        store.increment_iteration().unwrap();
        store.set_score(4.0).unwrap();
        store.set_plan_digest(Some("abc".into())).unwrap();
        store.log_conversation(&ConversationEntry::new(
            AgentKind::System,
            Role::Status,
            1,
            "x",
        ));

        let state = store.reset_for_run().unwrap();
        assert_eq!(state.iteration, 0);
        assert!(state.last_score.is_none());
        assert!(state.plan_digest.is_none());
        assert_eq!(state.verification.timeout_build, Some(900));
        assert!(store.load_conversation().is_empty());
    }

    #[test]
    fn test_full_reset_clears_regenerable_dirs_only() {
        let (_dir, store) = make_store();
        let root = store.layout().root().to_path_buf();
        fs::write(root.join("01_input/requirements.txt"), "make a todo app").unwrap();
        fs::create_dir_all(root.join(STAGING_DIR).join("src")).unwrap();
        fs::write(root.join(STAGING_DIR).join("src/main.py"), "print()").unwrap();
        fs::write(store.layout().logs_dir().join("run.log"), "log").unwrap();
        let mut overrides = BTreeMap::new();
        overrides.insert("generator".to_string(), serde_json::json!({"model": "big"}));
        store.set_provider_overrides(overrides).unwrap();
        store.log_usage(AgentKind::Planner, 1, 1, 0.1, None).unwrap();
        store.increment_iteration().unwrap();
        store
            .set_limit_overrides(LimitOverrides {
                max_cost: Some(3.0),
                ..Default::default()
            })
            .unwrap();

        let report = store.full_reset().unwrap();
        assert!(report.deleted >= 4);
        assert_eq!(report.skipped, 0);

        assert!(root.join("01_input/requirements.txt").exists());
        for name in REGENERABLE_DIRS {
            assert!(root.join(name).is_dir(), "{} should be recreated", name);
        }
        assert!(!root.join(STAGING_DIR).join("src").exists());
        assert!(!store.layout().usage_file().exists());
        assert!(!store.layout().logs_dir().join("run.log").exists());

        let state = store.load();
        assert_eq!(state.iteration, 0);
        assert_eq!(state.provider_overrides.len(), 1);
        assert_eq!(state.limits.max_cost, Some(3.0));
    }

    #[test]
    fn test_compression_config_is_replaced() {
        let (_dir, store) = make_store();
        assert!(store.load().compression.enabled);

        let compression = CompressionConfig {
            enabled: false,
            rate: 0.3,
            preserve_code_blocks: false,
        };
        store.set_compression_config(compression.clone()).unwrap();
        assert_eq!(store.load().compression, compression);

        // Survives a run reset.
        store.reset_for_run().unwrap();
        assert_eq!(store.load().compression, compression);
    }

    #[test]
    fn test_safe_delete_project() {
        let (dir, store) = make_store();
        let root = store.layout().root().to_path_buf();
        store.update_status(ProjectStatus::Completed).unwrap();
        let report = store.safe_delete_project();
        assert!(report.deleted > 0);
        assert!(!root.exists());
        assert!(dir.path().exists());
    }
}
