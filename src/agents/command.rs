//! Collaborators backed by an external CLI (by default `claude --print`).
//!
//! The prompt is written to the child's stdin. When stdout is the CLI's JSON
//! envelope the `result` text and usage figures are taken from it; otherwise
//! stdout is used verbatim with zero usage.

use std::fmt::Write as _;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tumbler_common::AgentKind;

use super::parse::{is_degenerate, parse_generated_files};
use super::{
    AgentReply, GeneratedFiles, GenerationRequest, Generator, PlanRequest, Planner, TokenUsage,
    ValidationRequest, Validator,
};
use crate::config::AgentCommandConfig;
use crate::errors::AgentError;

/// Previous-code context is cut at this many characters per file.
const MAX_CONTEXT_FILE_CHARS: usize = 20_000;

pub struct CommandAgent {
    kind: AgentKind,
    config: AgentCommandConfig,
}

#[derive(Debug, Deserialize)]
struct CliEnvelope {
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    usage: CliUsage,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl CommandAgent {
    pub fn new(kind: AgentKind, config: AgentCommandConfig) -> Self {
        Self { kind, config }
    }

    pub fn planner(config: AgentCommandConfig) -> Self {
        Self::new(AgentKind::Planner, config)
    }

    pub fn generator(config: AgentCommandConfig) -> Self {
        Self::new(AgentKind::Generator, config)
    }

    pub fn validator(config: AgentCommandConfig) -> Self {
        Self::new(AgentKind::Validator, config)
    }

    /// Run the command once with `prompt` on stdin.
    pub async fn invoke(&self, prompt: &str) -> Result<AgentReply, AgentError> {
        let start = Instant::now();
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                agent: self.kind,
                command: self.config.command.clone(),
                source,
            })?;

        tracing::debug!(
            agent = %self.kind,
            pid = child.id().unwrap_or(0),
            prompt_chars = prompt.len(),
            "Collaborator process spawned"
        );

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading its input is reported
            // through its exit status below.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::debug!(agent = %self.kind, error = %e, "Collaborator closed stdin early");
            }
            drop(stdin);
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| AgentError::Other(e.into()))?,
            Err(_) => {
                return Err(AgentError::Other(anyhow::anyhow!(
                    "{} did not finish within {}s",
                    self.kind,
                    self.config.timeout_secs
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(AgentError::NonZeroExit {
                agent: self.kind,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let reply = self.read_reply(&stdout)?;
        tracing::info!(
            agent = %self.kind,
            duration_secs = start.elapsed().as_secs_f64(),
            input_tokens = reply.usage.input_tokens,
            output_tokens = reply.usage.output_tokens,
            cost = reply.usage.cost,
            "Collaborator call finished"
        );
        Ok(reply)
    }

    fn read_reply(&self, stdout: &str) -> Result<AgentReply, AgentError> {
        let trimmed = stdout.trim();
        if trimmed.starts_with('{')
            && let Ok(envelope) = serde_json::from_str::<CliEnvelope>(trimmed)
        {
            let text = envelope.result.unwrap_or_default();
            if envelope.is_error {
                return Err(AgentError::Malformed {
                    agent: self.kind,
                    message: format!("command reported an error: {}", text),
                });
            }
            return Ok(AgentReply {
                text,
                usage: TokenUsage {
                    input_tokens: envelope.usage.input_tokens,
                    output_tokens: envelope.usage.output_tokens,
                    cost: envelope.total_cost_usd,
                },
            });
        }
        Ok(AgentReply {
            text: stdout.to_string(),
            usage: TokenUsage::default(),
        })
    }

    fn check_degenerate(&self, reply: &AgentReply) -> Result<(), AgentError> {
        if is_degenerate(&reply.text) {
            tracing::warn!(agent = %self.kind, "Degenerate output detected");
            return Err(AgentError::Degenerate { agent: self.kind });
        }
        Ok(())
    }
}

fn plan_prompt(request: &PlanRequest) -> String {
    format!(
        "You are the planning agent for project '{project}'.\n\
         Write a complete implementation plan in markdown for the requirements below.\n\
         Include:\n\
         - an overview and the chosen language/framework\n\
         - a file tree listing every file with its path (e.g. `src/app.py`)\n\
         - `Install Commands`, `Build Commands` and `Test Commands` sections, each a ```bash block\n\
         - an optional `## Resource Requirements` section (timeout_install, timeout_build, \
           timeout_test, timeout_lint, memory_limit, cpu_limit, tmpfs_size)\n\n\
         # Requirements\n\n{requirements}\n",
        project = request.project,
        requirements = request.requirements,
    )
}

fn generation_prompt(request: &GenerationRequest) -> String {
    let mut prompt = format!(
        "You are the engineering agent for project '{}' (iteration {}).\n\
         Implement the plan below. Respond with ONLY a JSON array of objects \
         {{\"path\": \"relative/path\", \"content\": \"file contents\"}}.\n\n\
         # Plan\n\n{}\n",
        request.project, request.iteration, request.plan
    );
    if !request.target_files.is_empty() {
        let _ = writeln!(
            prompt,
            "\n# Files to produce in this response\n\n{}",
            request
                .target_files
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        );
    }
    if let Some(feedback) = &request.feedback {
        let _ = writeln!(prompt, "\n# Feedback from the previous iteration\n\n{}", feedback);
    }
    if !request.previous_code.is_empty() {
        prompt.push_str("\n# Current code\n");
        for (path, content) in &request.previous_code {
            let content: String = content.chars().take(MAX_CONTEXT_FILE_CHARS).collect();
            let _ = write!(prompt, "\n## {}\n```\n{}\n```\n", path, content);
        }
    }
    prompt
}

fn validation_prompt(request: &ValidationRequest) -> String {
    let v = &request.verification;
    let mut prompt = format!(
        "You are the verification agent for project '{}' (iteration {}).\n\
         Review the code against the plan and the automated results, then write a \
         markdown report ending with `**Overall Score**: N/10`.\n\n\
         # Plan\n\n{}\n\n# Automated verification\n\n",
        request.project, request.iteration, request.plan
    );
    if v.code_review_only {
        let _ = writeln!(
            prompt,
            "No automated checks ran ({}). Score from code review alone.",
            v.errors.join("; ")
        );
    } else {
        let _ = writeln!(
            prompt,
            "- build: {}\n- tests: {}/{} passed\n- lint issues: {}\n- errors: {}\n\n\
             ## Build output\n```\n{}\n```\n\n## Test output\n```\n{}\n```\n\n## Lint output\n```\n{}\n```",
            if v.build_success { "success" } else { "failed" },
            v.tests_passed,
            v.tests_total,
            v.lint_issues,
            if v.errors.is_empty() { "none".to_string() } else { v.errors.join("; ") },
            tail_chars(&v.build_output, 4_000),
            tail_chars(&v.test_output, 4_000),
            tail_chars(&v.lint_output, 2_000),
        );
    }
    prompt.push_str("\n# Code\n");
    for (path, content) in &request.files {
        let content: String = content.chars().take(MAX_CONTEXT_FILE_CHARS).collect();
        let _ = write!(prompt, "\n## {}\n```\n{}\n```\n", path, content);
    }
    prompt
}

/// Last `max` characters of `text`; tool output is most useful at the end.
fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[async_trait]
impl Planner for CommandAgent {
    async fn plan(&self, request: &PlanRequest) -> Result<AgentReply, AgentError> {
        let reply = self.invoke(&plan_prompt(request)).await?;
        self.check_degenerate(&reply)?;
        if reply.text.trim().is_empty() {
            return Err(AgentError::Malformed {
                agent: self.kind,
                message: "empty plan".to_string(),
            });
        }
        Ok(reply)
    }
}

#[async_trait]
impl Generator for CommandAgent {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedFiles, AgentError> {
        let reply = self.invoke(&generation_prompt(request)).await?;
        self.check_degenerate(&reply)?;
        let files = parse_generated_files(&reply.text).map_err(|message| AgentError::Malformed {
            agent: self.kind,
            message,
        })?;
        Ok(GeneratedFiles {
            files,
            usage: reply.usage,
        })
    }
}

#[async_trait]
impl Validator for CommandAgent {
    async fn validate(&self, request: &ValidationRequest) -> Result<AgentReply, AgentError> {
        let reply = self.invoke(&validation_prompt(request)).await?;
        self.check_degenerate(&reply)?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> AgentCommandConfig {
        AgentCommandConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_secs: 10,
        }
    }

    #[tokio::test]
    async fn test_raw_stdout_is_the_reply() {
        let agent = CommandAgent::planner(AgentCommandConfig {
            command: "cat".to_string(),
            args: Vec::new(),
            timeout_secs: 10,
        });
        let reply = agent.invoke("hello planner").await.unwrap();
        assert_eq!(reply.text, "hello planner");
        assert_eq!(reply.usage, TokenUsage::default());
    }

    #[tokio::test]
    async fn test_json_envelope_carries_usage() {
        let agent = CommandAgent::validator(sh(
            r#"cat >/dev/null; echo '{"type":"result","result":"**Overall Score**: 7/10","total_cost_usd":0.02,"usage":{"input_tokens":30,"output_tokens":40}}'"#,
        ));
        let reply = agent
            .validate(&ValidationRequest::default())
            .await
            .unwrap();
        assert_eq!(reply.text, "**Overall Score**: 7/10");
        assert_eq!(reply.usage.input_tokens, 30);
        assert_eq!(reply.usage.output_tokens, 40);
        assert!((reply.usage.cost - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_generator_parses_files() {
        let agent = CommandAgent::generator(sh(
            r#"cat >/dev/null; echo '[{"path":"app.py","content":"print(1)"}]'"#,
        ));
        let out = agent.generate(&GenerationRequest::default()).await.unwrap();
        assert_eq!(out.files["app.py"], "print(1)");
    }

    #[tokio::test]
    async fn test_generator_degenerate_output() {
        let agent = CommandAgent::generator(sh(
            "cat >/dev/null; i=0; while [ $i -lt 100 ]; do printf 'ab'; i=$((i+1)); done",
        ));
        let err = agent.generate(&GenerationRequest::default()).await.unwrap_err();
        assert!(err.is_degenerate());
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let agent = CommandAgent::planner(sh("echo boom >&2; exit 3"));
        match agent.invoke("x").await.unwrap_err() {
            AgentError::NonZeroExit {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_command() {
        let agent = CommandAgent::planner(AgentCommandConfig {
            command: "tumbler-no-such-binary".to_string(),
            args: Vec::new(),
            timeout_secs: 10,
        });
        assert!(matches!(
            agent.invoke("x").await.unwrap_err(),
            AgentError::Spawn { .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut config = sh("sleep 5");
        config.timeout_secs = 1;
        let agent = CommandAgent::planner(config);
        let err = agent.invoke("x").await.unwrap_err();
        assert!(err.to_string().contains("did not finish"));
    }

    #[test]
    fn test_generation_prompt_lists_targets_and_feedback() {
        let request = GenerationRequest {
            project: "demo".into(),
            plan: "Build it".into(),
            iteration: 2,
            feedback: Some("Add tests".into()),
            target_files: vec!["src/a.py".into()],
            ..Default::default()
        };
        let prompt = generation_prompt(&request);
        assert!(prompt.contains("- src/a.py"));
        assert!(prompt.contains("Add tests"));
        assert!(prompt.contains("iteration 2"));
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
