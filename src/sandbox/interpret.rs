//! Turning raw test and lint output into counts.

use regex::Regex;
use std::sync::LazyLock;

static PASSED_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+passed").unwrap());

static FAILED_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+failed").unwrap());

// Jest/Vitest: "Tests:  3 passed, 4 total"
static JEST_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tests:\s+(\d+)\s+passed.*?(\d+)\s+total").unwrap());

static GO_OK_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^ok\s+").unwrap());

static GO_FAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^FAIL\s+").unwrap());

static RATIO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)/(\d+)\s*(?:tests?\s+)?passed").unwrap());

// path:line:col: message (eslint, flake8, pylint, go vet)
static LINT_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\S+:\d+:\d+:?\s+").unwrap());

static LINT_SUMMARY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s+(?:problems?|errors?|warnings?)").unwrap());

/// Reads test and lint tool output.
pub trait OutputInterpreter: Send + Sync {
    /// `(passed, total)`; `(0, 0)` when nothing recognizable is present.
    fn test_counts(&self, output: &str) -> (u32, u32);

    fn lint_issues(&self, output: &str) -> u32;
}

/// Heuristics covering pytest, jest, go test and the usual linters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexInterpreter;

fn capture_u32(caps: &regex::Captures<'_>, group: usize) -> u32 {
    caps.get(group)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

impl OutputInterpreter for RegexInterpreter {
    fn test_counts(&self, output: &str) -> (u32, u32) {
        if let Some(passed) = PASSED_REGEX.captures(output) {
            let passed = capture_u32(&passed, 1);
            let failed = FAILED_REGEX
                .captures(output)
                .map(|caps| capture_u32(&caps, 1))
                .unwrap_or(0);
            return (passed, passed + failed);
        }

        if let Some(caps) = JEST_REGEX.captures(output) {
            return (capture_u32(&caps, 1), capture_u32(&caps, 2));
        }

        let ok = GO_OK_REGEX.find_iter(output).count() as u32;
        let fail = GO_FAIL_REGEX.find_iter(output).count() as u32;
        if ok + fail > 0 {
            return (ok, ok + fail);
        }

        if let Some(caps) = RATIO_REGEX.captures(output) {
            return (capture_u32(&caps, 1), capture_u32(&caps, 2));
        }

        (0, 0)
    }

    fn lint_issues(&self, output: &str) -> u32 {
        let lines = LINT_LINE_REGEX.find_iter(output).count() as u32;
        if lines > 0 {
            return lines;
        }
        LINT_SUMMARY_REGEX
            .captures(output)
            .map(|caps| capture_u32(&caps, 1))
            .unwrap_or(0)
    }
}
