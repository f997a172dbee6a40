//! Structured data pulled out of a `PLAN.md`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tumbler_common::VerificationOverrides;

use crate::sandbox::VerificationStrategy;

static RESOURCE_SECTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)##\s*Resource\s+Requirements.*?\n(.*?)(?:\n##|\z)").unwrap()
});

// Tree diagrams, bullet lists and numbered lists.
static PLANNED_FILE_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"[├└│─\s]+([a-zA-Z0-9_\-./]+\.[a-zA-Z0-9]+)",
        r"(?m)^\s*[-*]\s+`?([a-zA-Z0-9_\-./]+\.[a-zA-Z0-9]+)`?",
        r"(?m)^\s*\d+\.\s+`?([a-zA-Z0-9_\-./]+\.[a-zA-Z0-9]+)`?",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Hex SHA-256 of the plan file contents.
pub fn plan_digest(plan: &[u8]) -> String {
    format!("{:x}", Sha256::digest(plan))
}

/// Commands listed under `Install Commands`, `Build Commands` and
/// `Test Commands` fenced blocks. Comment and blank lines are dropped.
pub fn extract_strategy(plan: &str) -> VerificationStrategy {
    VerificationStrategy {
        install: commands_in_section(plan, "Install Commands"),
        build: commands_in_section(plan, "Build Commands"),
        test: commands_in_section(plan, "Test Commands"),
    }
}

fn commands_in_section(plan: &str, section: &str) -> Vec<String> {
    let pattern = format!(r"(?is){}[:\s]*```(?:bash)?\s*\n(.*?)```", regex::escape(section));
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures(plan)
        .and_then(|caps| caps.get(1))
        .map(|block| {
            block
                .as_str()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Overrides declared in a `## Resource Requirements` section. Placeholder
/// values (`[...]`, `default...`) and unparsable values are ignored.
pub fn extract_resource_requirements(plan: &str) -> VerificationOverrides {
    let mut overrides = VerificationOverrides::default();
    let Some(section) = RESOURCE_SECTION_REGEX
        .captures(plan)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    else {
        return overrides;
    };

    let value = |field: &str| -> Option<String> {
        let pattern = format!(r"(?i)(?:\*\*)?{}(?:\*\*)?\s*:\s*(.+)", regex::escape(field));
        let re = Regex::new(&pattern).ok()?;
        let raw = re.captures(section)?.get(1)?.as_str().trim();
        let raw = raw.trim_matches('"').trim_matches('\'').trim();
        if raw.starts_with('[') || raw.to_lowercase().starts_with("default") {
            return None;
        }
        Some(raw.to_string())
    };

    overrides.timeout_install = value("timeout_install").and_then(|v| v.parse().ok());
    overrides.timeout_build = value("timeout_build").and_then(|v| v.parse().ok());
    overrides.timeout_test = value("timeout_test").and_then(|v| v.parse().ok());
    overrides.timeout_lint = value("timeout_lint").and_then(|v| v.parse().ok());
    overrides.cpu_limit = value("cpu_limit").and_then(|v| v.parse().ok());
    overrides.memory_limit = value("memory_limit");
    overrides.tmpfs_size = value("tmpfs_size");

    if !overrides.is_empty() {
        tracing::info!(overrides = ?overrides, "Plan declared resource requirements");
    }
    overrides
}

/// Paths the plan says will be produced, in order of first mention. Only
/// entries with a directory part and an extension count.
pub fn extract_planned_files(plan: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for re in PLANNED_FILE_REGEXES.iter() {
        for caps in re.captures_iter(plan) {
            let Some(path) = caps.get(1).map(|m| m.as_str().trim()) else {
                continue;
            };
            if path.contains('.') && path.contains('/') && seen.insert(path.to_string()) {
                files.push(path.to_string());
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"# Todo API

## File Structure

```
todo/
├── src/app.py
├── src/models.py
└── tests/test_app.py
```

- `README.md`
- src/app.py

1. config/settings.toml

## Install Commands
```bash
# dependencies
pip install -r requirements.txt

```

## Test Commands:
```
python -m pytest -q
```

## Resource Requirements

- **timeout_test**: 600
- memory_limit: "4g"
- cpu_limit: 2.5
- timeout_build: [seconds]
- tmpfs_size: default

## Notes
timeout_lint: 5
"#;

    #[test]
    fn test_extract_strategy() {
        let strategy = extract_strategy(PLAN);
        assert_eq!(strategy.install, vec!["pip install -r requirements.txt"]);
        assert_eq!(strategy.test, vec!["python -m pytest -q"]);
        assert!(strategy.build.is_empty());
    }

    #[test]
    fn test_extract_resource_requirements() {
        let overrides = extract_resource_requirements(PLAN);
        assert_eq!(overrides.timeout_test, Some(600));
        assert_eq!(overrides.memory_limit.as_deref(), Some("4g"));
        assert_eq!(overrides.cpu_limit, Some(2.5));
        // Placeholders are ignored.
        assert_eq!(overrides.timeout_build, None);
        assert_eq!(overrides.tmpfs_size, None);
        // Outside the section.
        assert_eq!(overrides.timeout_lint, None);
    }

    #[test]
    fn test_no_resource_section() {
        assert!(extract_resource_requirements("# Plan\nNothing here").is_empty());
    }

    #[test]
    fn test_extract_planned_files() {
        let files = extract_planned_files(PLAN);
        assert_eq!(
            files,
            vec![
                "src/app.py",
                "src/models.py",
                "tests/test_app.py",
                "config/settings.toml",
            ]
        );
    }

    #[test]
    fn test_plan_digest_is_stable() {
        assert_eq!(plan_digest(b"abc"), plan_digest(b"abc"));
        assert_ne!(plan_digest(b"abc"), plan_digest(b"abd"));
        assert_eq!(plan_digest(b"").len(), 64);
    }
}
