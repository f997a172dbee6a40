//! Code generation: one call, or the planned file list split into groups
//! generated concurrently and merged.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::agents::{GenerationRequest, Generator, TokenUsage};
use crate::config::GenerationConfig;
use crate::errors::{AgentError, OrchestratorError};
use crate::state::MANIFEST_FILE;
use crate::state::safety::is_strict_descendant;

/// Files above this size are passed as a placeholder rather than content.
pub const MAX_CONTEXT_FILE_BYTES: u64 = 50_000;

const BINARY_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "so", "dll", "exe", "bin", "png", "jpg", "jpeg", "gif", "ico", "woff", "woff2",
    "ttf", "eot", "zip", "tar", "gz",
];

/// Installed dependencies extracted from the install container.
const DEPENDENCY_DIRS: &[&str] = &["node_modules", "__pycache__", ".venv", "venv", "target"];

/// How a generation request is split into collaborator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStrategy {
    /// One call for the whole plan.
    Single,
    /// One call per group, one after another.
    Sequential,
    /// One call per group, at most `max_concurrency` in flight.
    FanOut { max_concurrency: usize },
}

impl GenerationStrategy {
    fn concurrency(self) -> usize {
        match self {
            GenerationStrategy::Single | GenerationStrategy::Sequential => 1,
            GenerationStrategy::FanOut { max_concurrency } => max_concurrency.max(1),
        }
    }
}

/// Strategy and file groups for a plan's file list.
pub fn plan_generation(
    planned_files: &[String],
    config: &GenerationConfig,
) -> (GenerationStrategy, Vec<Vec<String>>) {
    if !needs_chunking(planned_files.len(), config) {
        return (GenerationStrategy::Single, Vec::new());
    }
    let groups = chunk_files(planned_files, config);
    if groups.len() <= 1 {
        return (GenerationStrategy::Single, Vec::new());
    }
    if !config.parallel {
        return (GenerationStrategy::Sequential, groups);
    }
    let max_concurrency = groups.len().min(config.max_fan_out.max(1));
    (GenerationStrategy::FanOut { max_concurrency }, groups)
}

/// Expected output (files × tokens per file) exceeds the output budget.
pub fn needs_chunking(file_count: usize, config: &GenerationConfig) -> bool {
    file_count > 0 && file_count as u64 * config.tokens_per_file > config.max_output_tokens
}

/// Groups of at most `max_output_tokens / tokens_per_file` files, with tail
/// groups merged until there are no more than `max_fan_out`.
pub fn chunk_files(files: &[String], config: &GenerationConfig) -> Vec<Vec<String>> {
    let per_group = (config.max_output_tokens / config.tokens_per_file.max(1)).max(1) as usize;
    let mut groups: Vec<Vec<String>> = files.chunks(per_group).map(<[String]>::to_vec).collect();
    let limit = config.max_fan_out.max(1);
    while groups.len() > limit {
        if let Some(last) = groups.pop()
            && let Some(prev) = groups.last_mut()
        {
            prev.extend(last);
        }
    }
    groups
}

/// Merged result of all generator calls for one iteration.
#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub files: BTreeMap<String, String>,
    /// One entry per successful call, for the usage ledger.
    pub usage: Vec<TokenUsage>,
    pub failed_groups: usize,
}

/// Run the generator according to `strategy`.
///
/// With a single call, its error is returned as is so degenerate output can
/// be retried. With groups, a failing group contributes no files; only when
/// every group fails is the iteration an error.
pub async fn run_generation(
    generator: &dyn Generator,
    base: &GenerationRequest,
    strategy: GenerationStrategy,
    groups: Vec<Vec<String>>,
) -> Result<GenerationOutcome, OrchestratorError> {
    if strategy == GenerationStrategy::Single || groups.is_empty() {
        let generated = generator.generate(base).await?;
        if generated.files.is_empty() {
            return Err(OrchestratorError::NoFilesGenerated { chunks: 1 });
        }
        return Ok(GenerationOutcome {
            files: generated.files,
            usage: vec![generated.usage],
            failed_groups: 0,
        });
    }

    let total = groups.len();
    tracing::info!(groups = total, strategy = ?strategy, "Generating in groups");

    let results: Vec<(usize, Result<_, AgentError>)> = futures::stream::iter(
        groups.into_iter().enumerate(),
    )
    .map(|(index, target_files)| {
        let request = GenerationRequest {
            previous_code: base
                .previous_code
                .iter()
                .filter(|(path, _)| target_files.contains(path))
                .map(|(path, content)| (path.clone(), content.clone()))
                .collect(),
            target_files,
            ..base.clone()
        };
        async move { (index, generator.generate(&request).await) }
    })
    .buffer_unordered(strategy.concurrency())
    .collect()
    .await;

    let mut outcome = GenerationOutcome::default();
    let mut degenerate = 0;
    for (index, result) in results {
        match result {
            Ok(generated) => {
                tracing::info!(group = index + 1, total, files = generated.files.len(), "Group generated");
                outcome.files.extend(generated.files);
                outcome.usage.push(generated.usage);
            }
            Err(e) => {
                tracing::error!(group = index + 1, total, error = %e, "Group generation failed");
                if e.is_degenerate() {
                    degenerate += 1;
                }
                outcome.failed_groups += 1;
            }
        }
    }

    if outcome.files.is_empty() {
        if degenerate == total {
            return Err(AgentError::Degenerate {
                agent: tumbler_common::AgentKind::Generator,
            }
            .into());
        }
        return Err(OrchestratorError::NoFilesGenerated { chunks: total });
    }
    Ok(outcome)
}

/// Manifest written after all generated files; its appearance starts
/// verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub file_count: usize,
    pub files: Vec<String>,
}

/// Write generated files under `staging`, then the manifest. Paths that are
/// absolute, climb out with `..`, or land on a symlink are skipped.
pub fn write_generated_files(
    staging: &Path,
    files: &BTreeMap<String, String>,
) -> Result<Manifest, OrchestratorError> {
    fs::create_dir_all(staging).map_err(|e| anyhow::anyhow!("Failed to create staging: {}", e))?;
    let root = staging
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("Failed to resolve staging: {}", e))?;

    let mut written = Vec::new();
    for (path, content) in files {
        let Some(relative) = safe_relative(path) else {
            tracing::warn!(path = %path, "Skipping generated file with unsafe path");
            continue;
        };
        if relative.as_os_str() == MANIFEST_FILE {
            continue;
        }
        let dest = root.join(&relative);
        if let Some(parent) = dest.parent() {
            if !resolves_inside(&root, parent) {
                tracing::warn!(path = %path, "Generated file resolves outside staging; skipping");
                continue;
            }
            fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }
        if fs::symlink_metadata(&dest)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
        {
            tracing::warn!(path = %path, "Refusing to write through symlink");
            continue;
        }
        fs::write(&dest, content)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", dest.display(), e))?;
        written.push(relative.to_string_lossy().replace('\\', "/"));
    }

    let manifest = Manifest {
        file_count: written.len(),
        files: written,
    };
    let json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| anyhow::anyhow!("Failed to serialize manifest: {}", e))?;
    crate::state::store::write_atomic(&root.join(MANIFEST_FILE), &json)?;
    Ok(manifest)
}

/// The deepest existing ancestor of `dir` must resolve under `root`. Missing
/// components below it are created as plain directories afterwards.
fn resolves_inside(root: &Path, dir: &Path) -> bool {
    let mut existing = dir.to_path_buf();
    while fs::symlink_metadata(&existing).is_err() {
        if !existing.pop() {
            return false;
        }
    }
    existing
        .canonicalize()
        .map(|resolved| resolved == root || is_strict_descendant(root, &resolved))
        .unwrap_or(false)
}

fn safe_relative(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(path.trim()).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}

/// Text files currently staged, keyed by relative path, for refinement
/// context. Oversized or unreadable files are represented by a placeholder.
pub fn collect_previous_code(staging: &Path) -> BTreeMap<String, String> {
    let mut code = BTreeMap::new();
    let walker = WalkDir::new(staging)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && DEPENDENCY_DIRS.contains(&&*entry.file_name().to_string_lossy()))
        });

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() || entry.file_name() == MANIFEST_FILE {
            continue;
        }
        let path = entry.path();
        let binary = path
            .extension()
            .map(|ext| BINARY_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false);
        if binary {
            continue;
        }
        let Ok(relative) = path.strip_prefix(staging) else {
            continue;
        };
        let key = relative.to_string_lossy().replace('\\', "/");
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let content = if size > MAX_CONTEXT_FILE_BYTES {
            format!("[File too large: {} bytes]", size)
        } else {
            fs::read_to_string(path).unwrap_or_else(|_| "[Binary or unreadable file]".to_string())
        };
        code.insert(key, content);
    }
    code
}
