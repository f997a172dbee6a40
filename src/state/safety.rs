//! Containment-checked deletion.
//!
//! Project directories may live on shared or mounted volumes, so nothing here
//! ever fails hard: anything that cannot be proven safe to remove is skipped,
//! logged, and counted. Symlinks are never followed, mount points are never
//! removed, and directories are only removed once empty.

use std::ops::AddAssign;
use std::path::Path;

use walkdir::WalkDir;

/// Outcome of a deletion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub deleted: usize,
    pub skipped: usize,
}

impl AddAssign for DeletionReport {
    fn add_assign(&mut self, other: Self) {
        self.deleted += other.deleted;
        self.skipped += other.skipped;
    }
}

/// Remove the contents of `base/name`, leaving the directory itself in place.
///
/// `name` must be a single path component present in `allowed`; `base` must be
/// `project_root` or a descendant of it.
pub fn safe_clear_dir(
    project_root: &Path,
    base: &Path,
    name: &str,
    allowed: &[&str],
) -> DeletionReport {
    if !allowed.contains(&name) || name.contains('/') || name.contains("..") {
        tracing::warn!(dir = %name, "Refusing to clear directory outside the allow-list");
        return DeletionReport {
            deleted: 0,
            skipped: 1,
        };
    }

    let Ok(root) = project_root.canonicalize() else {
        tracing::warn!(root = %project_root.display(), "Project root cannot be resolved; nothing cleared");
        return DeletionReport {
            deleted: 0,
            skipped: 1,
        };
    };

    let target = base.join(name);
    let Ok(meta) = std::fs::symlink_metadata(&target) else {
        return DeletionReport::default();
    };

    if meta.file_type().is_symlink() {
        // Remove the link itself, never what it points at.
        return remove_link(&root, &target);
    }
    if !meta.is_dir() {
        tracing::warn!(path = %target.display(), "Expected a directory; skipping");
        return DeletionReport {
            deleted: 0,
            skipped: 1,
        };
    }

    match target.canonicalize() {
        Ok(resolved) if is_strict_descendant(&root, &resolved) => {}
        _ => {
            tracing::warn!(path = %target.display(), "Directory resolves outside the project; skipping");
            return DeletionReport {
                deleted: 0,
                skipped: 1,
            };
        }
    }
    if is_mount_point(&target) {
        tracing::warn!(path = %target.display(), "Directory is a mount point; skipping");
        return DeletionReport {
            deleted: 0,
            skipped: 1,
        };
    }

    clear_tree(&root, &target)
}

/// Remove an entire project directory, including the root once it is empty.
pub fn safe_delete_tree(project_root: &Path) -> DeletionReport {
    let Ok(root) = project_root.canonicalize() else {
        return DeletionReport::default();
    };
    if is_mount_point(&root) {
        tracing::warn!(path = %root.display(), "Project root is a mount point; only clearing contents");
        return clear_tree(&root, &root);
    }

    let mut report = clear_tree(&root, &root);
    match std::fs::remove_dir(&root) {
        Ok(()) => report.deleted += 1,
        Err(e) => {
            tracing::warn!(path = %root.display(), error = %e, "Project root left in place");
            report.skipped += 1;
        }
    }
    report
}

/// Bottom-up removal of everything below `target`.
fn clear_tree(root: &Path, target: &Path) -> DeletionReport {
    let mut report = DeletionReport::default();
    let walker = WalkDir::new(target)
        .min_depth(1)
        .follow_links(false)
        .same_file_system(true)
        .contents_first(true);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Unreadable entry during clear");
                report.skipped += 1;
                continue;
            }
        };
        let path = entry.path();
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            report += remove_link(root, path);
            continue;
        }

        let inside = path
            .canonicalize()
            .map(|resolved| is_strict_descendant(root, &resolved))
            .unwrap_or(false);
        if !inside {
            tracing::warn!(path = %path.display(), "Path resolves outside the project; skipping");
            report.skipped += 1;
            continue;
        }

        if file_type.is_dir() {
            if is_mount_point(path) {
                tracing::warn!(path = %path.display(), "Nested mount point; skipping");
                report.skipped += 1;
                continue;
            }
            match std::fs::remove_dir(path) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Directory not removed");
                    report.skipped += 1;
                }
            }
        } else {
            match std::fs::remove_file(path) {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "File not removed");
                    report.skipped += 1;
                }
            }
        }
    }

    report
}

/// Unlink a symlink whose own location is inside the project.
fn remove_link(root: &Path, link: &Path) -> DeletionReport {
    let parent_inside = link
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .map(|parent| parent == root || is_strict_descendant(root, &parent))
        .unwrap_or(false);
    if !parent_inside {
        tracing::warn!(path = %link.display(), "Symlink sits outside the project; skipping");
        return DeletionReport {
            deleted: 0,
            skipped: 1,
        };
    }
    match std::fs::remove_file(link) {
        Ok(()) => DeletionReport {
            deleted: 1,
            skipped: 0,
        },
        Err(e) => {
            tracing::debug!(path = %link.display(), error = %e, "Symlink not removed");
            DeletionReport {
                deleted: 0,
                skipped: 1,
            }
        }
    }
}

/// `path` is below `root` and not `root` itself. Both must already be resolved.
pub fn is_strict_descendant(root: &Path, path: &Path) -> bool {
    path != root && path.starts_with(root)
}

#[cfg(unix)]
fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Some(parent) = path.parent() else {
        return true;
    };
    match (std::fs::symlink_metadata(path), std::fs::metadata(parent)) {
        (Ok(meta), Ok(parent_meta)) => meta.dev() != parent_meta.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_mount_point(_path: &Path) -> bool {
    false
}
