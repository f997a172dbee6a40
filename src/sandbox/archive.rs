//! Tar transfer between a host workspace and a container's `/workspace`.
//!
//! Both directions refuse anything that could reach outside the workspace:
//! symlinks and hard links are skipped, and every path is checked against the
//! resolved workspace root.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::state::safety::is_strict_descendant;

/// Counts from one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub written: usize,
    pub skipped: usize,
}

/// Pack the contents of `workspace` (not the directory itself) into an
/// in-memory tar.
pub fn build_archive(workspace: &Path) -> io::Result<(Vec<u8>, TransferReport)> {
    let root = workspace.canonicalize()?;
    let mut report = TransferReport::default();
    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for entry in WalkDir::new(&root).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Unreadable entry while packing workspace");
                report.skipped += 1;
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_symlink() {
            tracing::warn!(path = %path.display(), "Skipping symlink in workspace archive");
            report.skipped += 1;
            continue;
        }
        let inside = path
            .canonicalize()
            .map(|resolved| is_strict_descendant(&root, &resolved))
            .unwrap_or(false);
        if !inside {
            report.skipped += 1;
            continue;
        }
        let Ok(relative) = path.strip_prefix(&root) else {
            report.skipped += 1;
            continue;
        };

        if entry.file_type().is_dir() {
            builder.append_dir(relative, path)?;
        } else if entry.file_type().is_file() {
            builder.append_path_with_name(path, relative)?;
        } else {
            report.skipped += 1;
            continue;
        }
        report.written += 1;
    }

    if report.skipped > 0 {
        tracing::info!(skipped = report.skipped, "Workspace archive skipped symlinks or out-of-scope entries");
    }
    let bytes = builder.into_inner()?;
    Ok((bytes, report))
}

/// Unpack a tar downloaded from a container into `workspace`.
///
/// Entries are expected under `prefix/` (Docker names the archive after the
/// requested directory); anything else is dropped. An entry that cannot be
/// read or written is skipped with a warning and the rest still land.
pub fn extract_archive(bytes: &[u8], workspace: &Path, prefix: &str) -> io::Result<TransferReport> {
    fs::create_dir_all(workspace)?;
    let root = workspace.canonicalize()?;
    let mut report = TransferReport::default();
    let mut archive = Archive::new(bytes);

    for entry in archive.entries()? {
        let outcome = entry.and_then(|mut entry| unpack_entry(&mut entry, &root, prefix));
        match outcome {
            Ok(Unpacked::Written) => report.written += 1,
            Ok(Unpacked::Skipped) => report.skipped += 1,
            Ok(Unpacked::Foreign) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry in container archive");
                report.skipped += 1;
            }
        }
    }

    Ok(report)
}

enum Unpacked {
    Written,
    Skipped,
    /// Outside the expected prefix, or the prefix directory itself.
    Foreign,
}

fn unpack_entry<R: Read>(entry: &mut tar::Entry<'_, R>, root: &Path, prefix: &str) -> io::Result<Unpacked> {
    let raw = entry.path()?.into_owned();
    let Some(relative) = strip_archive_prefix(&raw, prefix) else {
        return Ok(Unpacked::Foreign);
    };
    if relative.as_os_str().is_empty() {
        return Ok(Unpacked::Foreign);
    }

    let kind = entry.header().entry_type();
    if matches!(kind, EntryType::Symlink | EntryType::Link) {
        tracing::warn!(path = %relative.display(), "Skipping link in container archive");
        return Ok(Unpacked::Skipped);
    }

    let dest = root.join(&relative);
    if !parent_inside(root, &dest) {
        tracing::warn!(path = %relative.display(), "Archive entry escapes the workspace; skipping");
        return Ok(Unpacked::Skipped);
    }
    if fs::symlink_metadata(&dest)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
    {
        return Ok(Unpacked::Skipped);
    }

    match kind {
        EntryType::Directory => {
            fs::create_dir_all(&dest)?;
            Ok(Unpacked::Written)
        }
        EntryType::Regular | EntryType::Continuous => {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            fs::write(&dest, content)?;
            set_mode(&dest, entry.header());
            Ok(Unpacked::Written)
        }
        _ => Ok(Unpacked::Skipped),
    }
}

/// `workspace/src/app.py` → `src/app.py`. Returns `None` for paths outside
/// the prefix or containing `..` or an absolute root.
fn strip_archive_prefix(path: &Path, prefix: &str) -> Option<PathBuf> {
    let mut components = path.components();
    match components.next()? {
        Component::Normal(first) if first == prefix => {}
        _ => return None,
    }
    let mut relative = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

/// The nearest existing ancestor of `dest` resolves inside `root`.
fn parent_inside(root: &Path, dest: &Path) -> bool {
    let mut current = dest.parent();
    while let Some(dir) = current {
        if let Ok(resolved) = dir.canonicalize() {
            return resolved == root || is_strict_descendant(root, &resolved);
        }
        current = dir.parent();
    }
    false
}

#[cfg(unix)]
fn set_mode(path: &Path, header: &Header) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(mode) = header.mode() else {
        return;
    };
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to set file mode from archive");
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _header: &Header) {}
