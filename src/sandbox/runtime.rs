//! Toolchain detection: which base image and default commands a generated
//! project needs.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Languages the sandbox knows how to build. Adding one means adding a
/// variant here and a row to [`MARKERS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Toolchain {
    Node,
    Python,
    PythonProject,
    Go,
    Rust,
    Java,
}

/// Marker file → toolchain, checked in order.
pub const MARKERS: &[(&str, Toolchain)] = &[
    ("package.json", Toolchain::Node),
    ("requirements.txt", Toolchain::Python),
    ("pyproject.toml", Toolchain::PythonProject),
    ("go.mod", Toolchain::Go),
    ("Cargo.toml", Toolchain::Rust),
    ("pom.xml", Toolchain::Java),
];

/// Plan keywords used when no marker file exists yet.
const PLAN_KEYWORDS: &[(&[&str], Toolchain)] = &[
    (
        &["react", "node", "npm", "javascript", "typescript", "next.js", "express"],
        Toolchain::Node,
    ),
    (
        &["python", "flask", "django", "fastapi", "pytest"],
        Toolchain::Python,
    ),
    (&["golang", "go module", "go.mod"], Toolchain::Go),
];

/// Base image and default phase commands for a detected toolchain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub language: String,
    pub base_image: String,
    pub install_commands: Vec<String>,
    pub build_commands: Vec<String>,
    pub test_commands: Vec<String>,
    pub lint_commands: Vec<String>,
}

fn cmds(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

impl Toolchain {
    pub fn runtime(self) -> RuntimeInfo {
        let python_test = "python -m pytest -x --tb=short 2>&1 || true";
        let python_lint = "python -m flake8 --max-line-length=120 --statistics 2>&1 || true";
        let (language, image, install, build, test, lint) = match self {
            Toolchain::Node => (
                "javascript",
                "node:20-slim",
                cmds(&["npm install --ignore-scripts"]),
                cmds(&["npm run build --if-present"]),
                cmds(&["npm test --if-present"]),
                cmds(&["npx eslint . --no-error-on-unmatched-pattern 2>/dev/null || true"]),
            ),
            Toolchain::Python => (
                "python",
                "python:3.12-slim",
                cmds(&["pip install --no-cache-dir -r requirements.txt"]),
                Vec::new(),
                cmds(&[python_test]),
                cmds(&[python_lint]),
            ),
            Toolchain::PythonProject => (
                "python",
                "python:3.12-slim",
                cmds(&[
                    "pip install --no-cache-dir -e '.[dev]' 2>/dev/null || pip install --no-cache-dir .",
                ]),
                Vec::new(),
                cmds(&[python_test]),
                cmds(&[python_lint]),
            ),
            Toolchain::Go => (
                "go",
                "golang:1.22-alpine",
                cmds(&["go mod download"]),
                cmds(&["go build ./..."]),
                cmds(&["go test ./... -count=1 -timeout 30s"]),
                cmds(&["go vet ./..."]),
            ),
            Toolchain::Rust => (
                "rust",
                "rust:1.78-slim",
                Vec::new(),
                cmds(&["cargo build 2>&1"]),
                cmds(&["cargo test 2>&1"]),
                cmds(&["cargo clippy 2>&1 || true"]),
            ),
            Toolchain::Java => (
                "java",
                "eclipse-temurin:21-jdk-alpine",
                Vec::new(),
                cmds(&["mvn -q compile 2>&1"]),
                cmds(&["mvn -q test 2>&1"]),
                Vec::new(),
            ),
        };
        RuntimeInfo {
            language: language.to_string(),
            base_image: image.to_string(),
            install_commands: install,
            build_commands: build,
            test_commands: test,
            lint_commands: lint,
        }
    }
}

/// Pluggable runtime detection.
pub trait RuntimeDetector: Send + Sync {
    fn detect(&self, workspace: &Path, plan: &str) -> Option<RuntimeInfo>;
}

/// Marker files first, then plan keywords.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerDetector;

impl RuntimeDetector for MarkerDetector {
    fn detect(&self, workspace: &Path, plan: &str) -> Option<RuntimeInfo> {
        if let Some((marker, toolchain)) = MARKERS
            .iter()
            .find(|(marker, _)| workspace.join(marker).exists())
        {
            tracing::info!(marker = %marker, toolchain = ?toolchain, "Detected runtime from marker file");
            return Some(toolchain.runtime());
        }

        let plan = plan.to_lowercase();
        if let Some((_, toolchain)) = PLAN_KEYWORDS
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|kw| plan.contains(kw)))
        {
            tracing::info!(toolchain = ?toolchain, "Detected runtime from plan text");
            return Some(toolchain.runtime());
        }

        tracing::warn!("Could not detect project runtime; sandbox verification skipped");
        None
    }
}

/// Commands a plan asks for explicitly. Empty lists fall back to the
/// runtime's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationStrategy {
    pub install: Vec<String>,
    pub build: Vec<String>,
    pub test: Vec<String>,
}

impl VerificationStrategy {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.build.is_empty() && self.test.is_empty()
    }
}
