//! Best-effort secondary copy of project state for analytics.
//!
//! The state files under `.tumbler/` are authoritative. A mirror error is
//! logged by the store and otherwise ignored.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tumbler_common::{ProjectState, UsageRecord};

pub trait StateMirror: Send + Sync {
    fn upsert_project(&self, root: &Path, state: &ProjectState) -> Result<()>;

    fn record_usage(&self, project: &str, iteration: u32, record: &UsageRecord) -> Result<()>;
}

/// Mirror that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMirror;

impl StateMirror for NoopMirror {
    fn upsert_project(&self, _root: &Path, _state: &ProjectState) -> Result<()> {
        Ok(())
    }

    fn record_usage(&self, _project: &str, _iteration: u32, _record: &UsageRecord) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed mirror (`[mirror] path`).
pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl SqliteMirror {
    /// Open (or create) the mirror database and ensure its tables exist.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open mirror database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory mirror database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                name TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                status TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                last_score REAL,
                error TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                agent TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );
            ",
        )
        .context("Failed to create mirror tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Mirror lock poisoned: {}", e))
    }

    /// `(status, iteration, last_score)` of a mirrored project.
    pub fn project_summary(&self, name: &str) -> Result<Option<(String, u32, Option<f64>)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT status, iteration, last_score FROM projects WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("Failed to query mirrored project")
    }

    pub fn usage_total(&self, project: &str) -> Result<f64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(SUM(cost), 0.0) FROM usage WHERE project = ?1",
            params![project],
            |row| row.get(0),
        )
        .context("Failed to sum mirrored usage")
    }
}

impl StateMirror for SqliteMirror {
    fn upsert_project(&self, root: &Path, state: &ProjectState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO projects (name, path, status, iteration, last_score, error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                path = excluded.path,
                status = excluded.status,
                iteration = excluded.iteration,
                last_score = excluded.last_score,
                error = excluded.error,
                updated_at = excluded.updated_at",
            params![
                state.name,
                root.to_string_lossy().into_owned(),
                state.status.as_str(),
                state.iteration,
                state.last_score,
                state.error,
                state.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to upsert mirrored project")?;
        Ok(())
    }

    fn record_usage(&self, project: &str, iteration: u32, record: &UsageRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO usage (project, iteration, agent, input_tokens, output_tokens, cost, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                project,
                iteration,
                record.agent.to_string(),
                record.input_tokens as i64,
                record.output_tokens as i64,
                record.cost,
                record.timestamp.to_rfc3339(),
            ],
        )
        .context("Failed to insert mirrored usage")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tumbler_common::{AgentKind, ProjectStatus};

    #[test]
    fn test_upsert_overwrites_previous_row() {
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let mut state = ProjectState::new("demo");
        mirror.upsert_project(Path::new("/w/demo"), &state).unwrap();

        state.transition(ProjectStatus::Verifying);
        state.iteration = 2;
        state.record_score(6.5);
        mirror.upsert_project(Path::new("/w/demo"), &state).unwrap();

        let (status, iteration, score) = mirror.project_summary("demo").unwrap().unwrap();
        assert_eq!(status, "verifying");
        assert_eq!(iteration, 2);
        assert_eq!(score, Some(6.5));
        assert!(mirror.project_summary("other").unwrap().is_none());
    }

    #[test]
    fn test_usage_rows_accumulate() {
        let mirror = SqliteMirror::open_in_memory().unwrap();
        mirror
            .record_usage("demo", 1, &UsageRecord::new(AgentKind::Generator, 10, 20, 0.25))
            .unwrap();
        mirror
            .record_usage("demo", 1, &UsageRecord::new(AgentKind::Validator, 5, 5, 0.5))
            .unwrap();
        assert!((mirror.usage_total("demo").unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(mirror.usage_total("nobody").unwrap(), 0.0);
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        SqliteMirror::open(&path).unwrap();
        assert!(path.exists());
    }
}
