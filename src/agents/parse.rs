//! Reading collaborator output: degenerate-loop detection, generated file
//! payloads and report scores.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

static FENCED_JSON_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").unwrap());

static FILE_OBJECT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)"path"\s*:\s*"([^"]+)"\s*,\s*"content"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap()
});

static SCORE_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\*\*Overall Score\*\*:\s*(\d+(?:\.\d+)?)/10",
        r"(?i)\*\*Total\*\*:\s*(\d+(?:\.\d+)?)/10",
        r"(?i)Score:\s*(\d+(?:\.\d+)?)/10",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

const MIN_PATTERN_LEN: usize = 2;
const MAX_PATTERN_LEN: usize = 20;
const REPEAT_THRESHOLD: usize = 10;

/// True when `text` ends in a short pattern repeated over and over, the
/// signature of a model stuck in a loop.
pub fn is_degenerate(text: &str) -> bool {
    let window = MAX_PATTERN_LEN * REPEAT_THRESHOLD;
    let mut tail: Vec<char> = text.trim_end().chars().rev().take(window).collect();
    if tail.len() < window {
        return false;
    }
    tail.reverse();

    (MIN_PATTERN_LEN..=MAX_PATTERN_LEN).any(|len| {
        let pattern = &tail[tail.len() - len..];
        tail[tail.len() - len * REPEAT_THRESHOLD..]
            .chunks(len)
            .all(|chunk| chunk == pattern)
    })
}

#[derive(Debug, Deserialize)]
struct FileObject {
    path: String,
    content: String,
}

/// Parse a generator reply into `path → content`.
///
/// Accepts a bare JSON array of `{path, content}` objects, the same inside a
/// fenced block, or (as a last resort) loosely formed objects matched one at
/// a time.
pub fn parse_generated_files(response: &str) -> Result<BTreeMap<String, String>, String> {
    let mut body = response.trim();
    if let Some(caps) = FENCED_JSON_REGEX.captures(body)
        && let Some(inner) = caps.get(1)
    {
        body = inner.as_str().trim();
    }

    if let Ok(objects) = serde_json::from_str::<Vec<FileObject>>(body) {
        return Ok(into_map(objects));
    }

    // Prose around the array.
    if let (Some(start), Some(end)) = (body.find('['), body.rfind(']'))
        && start < end
        && let Ok(objects) = serde_json::from_str::<Vec<FileObject>>(&body[start..=end])
    {
        return Ok(into_map(objects));
    }

    let files: BTreeMap<String, String> = FILE_OBJECT_REGEX
        .captures_iter(body)
        .filter_map(|caps| {
            let path = caps.get(1)?.as_str().to_string();
            let raw = caps.get(2)?.as_str();
            Some((path, unescape_json(raw)))
        })
        .collect();
    if files.is_empty() {
        return Err("no file objects found in generator output".to_string());
    }
    Ok(files)
}

fn into_map(objects: Vec<FileObject>) -> BTreeMap<String, String> {
    objects
        .into_iter()
        .filter(|obj| !obj.path.trim().is_empty())
        .map(|obj| (obj.path, obj.content))
        .collect()
}

fn unescape_json(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| {
        raw.replace("\\n", "\n")
            .replace("\\t", "\t")
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    })
}

/// Score out of 10 declared in a validator report, if any.
pub fn extract_report_score(report: &str) -> Option<f64> {
    SCORE_REGEXES.iter().find_map(|re| {
        re.captures(report)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    })
}
