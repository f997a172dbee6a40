//! Durable per-project state.
//!
//! A project is a directory with a fixed layout:
//!
//! ```text
//! <project>/
//!   01_input/requirements.txt     requirements trigger
//!   02_plan/PLAN.md               plan trigger
//!   03_staging/                   generated files
//!   03_staging/.manifest.json     generation-complete trigger
//!   04_feedback/REPORT_iter{N}.md validator reports
//!   05_final/                     archives of finished runs
//!   .tumbler/state.json           ProjectState
//!   .tumbler/usage.json           UsageLedger
//!   .tumbler/conversation.jsonl   ConversationEntry per line
//!   .tumbler/logs/
//! ```

pub mod mirror;
pub mod safety;
pub mod store;

use std::path::{Path, PathBuf};

pub use mirror::{NoopMirror, SqliteMirror, StateMirror};
pub use safety::DeletionReport;
pub use store::StateStore;

pub const STATE_DIR: &str = ".tumbler";
pub const LOGS_DIR: &str = "logs";
pub const INPUT_DIR: &str = "01_input";
pub const PLAN_DIR: &str = "02_plan";
pub const STAGING_DIR: &str = "03_staging";
pub const FEEDBACK_DIR: &str = "04_feedback";
pub const FINAL_DIR: &str = "05_final";

pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const PLAN_FILE: &str = "PLAN.md";
pub const MANIFEST_FILE: &str = ".manifest.json";

/// Project subdirectories that a full reset may clear and recreate.
pub const REGENERABLE_DIRS: [&str; 4] = [PLAN_DIR, STAGING_DIR, FEEDBACK_DIR, FINAL_DIR];

/// Subdirectories of `.tumbler/` that a full reset may clear.
pub const STATE_SUBDIRS: [&str; 1] = [LOGS_DIR];

/// Path arithmetic for one project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The project name is its directory name.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    pub fn usage_file(&self) -> PathBuf {
        self.state_dir().join("usage.json")
    }

    pub fn conversation_file(&self) -> PathBuf {
        self.state_dir().join("conversation.jsonl")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join(LOGS_DIR)
    }

    pub fn requirements(&self) -> PathBuf {
        self.root.join(INPUT_DIR).join(REQUIREMENTS_FILE)
    }

    pub fn plan(&self) -> PathBuf {
        self.root.join(PLAN_DIR).join(PLAN_FILE)
    }

    pub fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn manifest(&self) -> PathBuf {
        self.staging().join(MANIFEST_FILE)
    }

    pub fn feedback_dir(&self) -> PathBuf {
        self.root.join(FEEDBACK_DIR)
    }

    pub fn report(&self, iteration: u32) -> PathBuf {
        self.feedback_dir().join(format!("REPORT_iter{}.md", iteration))
    }

    pub fn final_dir(&self) -> PathBuf {
        self.root.join(FINAL_DIR)
    }
}

/// Walk up from `path` to the nearest directory that looks like a project
/// (contains `01_input` or `.tumbler`). Only directories strictly below
/// `workspace` qualify; the walk stops there.
pub fn find_project_root(path: &Path, workspace: &Path) -> Option<PathBuf> {
    path.ancestors()
        .take_while(|dir| *dir != workspace && dir.starts_with(workspace))
        .find(|dir| dir.join(INPUT_DIR).is_dir() || dir.join(STATE_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_layout_paths() {
        let layout = ProjectLayout::new("/work/todo-app");
        assert_eq!(layout.name(), "todo-app");
        assert_eq!(
            layout.requirements(),
            PathBuf::from("/work/todo-app/01_input/requirements.txt")
        );
        assert_eq!(
            layout.manifest(),
            PathBuf::from("/work/todo-app/03_staging/.manifest.json")
        );
        assert_eq!(
            layout.report(3),
            PathBuf::from("/work/todo-app/04_feedback/REPORT_iter3.md")
        );
        assert_eq!(
            layout.state_file(),
            PathBuf::from("/work/todo-app/.tumbler/state.json")
        );
    }

    #[test]
    fn test_find_project_root_from_nested_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("todo-app");
        fs::create_dir_all(project.join(INPUT_DIR)).unwrap();
        fs::create_dir_all(project.join(STAGING_DIR).join("src")).unwrap();

        let trigger = project.join(STAGING_DIR).join(MANIFEST_FILE);
        assert_eq!(find_project_root(&trigger, dir.path()), Some(project.clone()));
        assert_eq!(
            find_project_root(&project.join(STAGING_DIR).join("src"), dir.path()),
            Some(project)
        );
    }

    #[test]
    fn test_find_project_root_none_outside_projects() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("random")).unwrap();
        assert!(find_project_root(&dir.path().join("random").join("file.txt"), dir.path()).is_none());
    }

    #[test]
    fn test_find_project_root_stops_at_workspace() {
        // A project-looking directory above the workspace must not match.
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(INPUT_DIR)).unwrap();
        let workspace = dir.path().join("ws");
        fs::create_dir_all(workspace.join("stray")).unwrap();
        assert!(find_project_root(&workspace.join("stray/notes.txt"), &workspace).is_none());

        // Nor does the workspace itself count as a project.
        fs::create_dir_all(workspace.join(STATE_DIR)).unwrap();
        assert!(find_project_root(&workspace.join("stray/notes.txt"), &workspace).is_none());

        // Paths outside the workspace never resolve.
        let elsewhere = tempfile::tempdir().unwrap();
        fs::create_dir_all(elsewhere.path().join("p").join(INPUT_DIR)).unwrap();
        assert!(find_project_root(&elsewhere.path().join("p/01_input/requirements.txt"), &workspace).is_none());
    }
}
