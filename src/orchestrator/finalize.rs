use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use flate2::Compression;
use flate2::write::GzEncoder;
use walkdir::WalkDir;

use crate::state::ProjectLayout;

/// Archive the staging directory into `05_final/<name>_<timestamp>.tar.gz`.
/// Symlinks are left out. Returns the archive path.
pub fn archive_staging(layout: &ProjectLayout) -> Result<PathBuf> {
    let final_dir = layout.final_dir();
    fs::create_dir_all(&final_dir)
        .with_context(|| format!("Failed to create {}", final_dir.display()))?;

    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let archive_path = final_dir.join(format!("{}_{}.tar.gz", layout.name(), stamp));
    let file = File::create(&archive_path)
        .with_context(|| format!("Failed to create {}", archive_path.display()))?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    let count = append_tree(&mut builder, &layout.staging())?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .with_context(|| format!("Failed to finish {}", archive_path.display()))?;

    tracing::info!(archive = %archive_path.display(), files = count, "Archived final output");
    Ok(archive_path)
}

fn append_tree<W: std::io::Write>(builder: &mut tar::Builder<W>, root: &Path) -> Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.context("Failed to walk staging")?;
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            tracing::debug!(path = %relative.display(), "Leaving symlink out of archive");
        } else if file_type.is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), relative)?;
            count += 1;
        }
    }
    Ok(count)
}
