//! Phase pipeline: install, build, then test and lint side by side.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tumbler_common::{
    CommandResult, PhaseReport, SandboxPhase, VerificationOverrides, VerificationResult,
};

use super::archive;
use super::config::SandboxConfig;
use super::docker::{CONTAINER_WORKSPACE, ContainerRuntime, ContainerSpec, DockerRuntime};
use super::interpret::{OutputInterpreter, RegexInterpreter};
use super::runtime::{RuntimeInfo, VerificationStrategy};
use crate::errors::SandboxError;

/// Called once per phase as soon as that phase finishes.
pub type PhaseObserver = Arc<dyn Fn(SandboxPhase, PhaseReport) + Send + Sync>;

/// Runs verification phases in throwaway containers.
pub struct SandboxExecutor {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    config: SandboxConfig,
    interpreter: Arc<dyn OutputInterpreter>,
}

impl SandboxExecutor {
    pub fn new(runtime: Option<Arc<dyn ContainerRuntime>>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            interpreter: Arc::new(RegexInterpreter),
        }
    }

    /// Connect to Docker when the sandbox is enabled. An unreachable engine
    /// is not an error: every run then degrades to review-only.
    pub async fn connect(config: SandboxConfig) -> Self {
        if !config.enabled {
            tracing::info!("Sandbox verification disabled");
            return Self::new(None, config);
        }
        match DockerRuntime::connect().await {
            Ok(docker) => Self::new(Some(Arc::new(docker)), config),
            Err(e) => {
                tracing::warn!(error = %e, "Docker unavailable; verification will be review-only");
                Self::new(None, config)
            }
        }
    }

    pub fn with_interpreter(mut self, interpreter: Arc<dyn OutputInterpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.config.enabled && self.runtime.is_some()
    }

    pub async fn run_verification(
        &self,
        workspace: &Path,
        strategy: &VerificationStrategy,
        runtime_info: Option<&RuntimeInfo>,
        overrides: &VerificationOverrides,
        observer: Option<PhaseObserver>,
    ) -> VerificationResult {
        if !self.config.enabled {
            return VerificationResult::review_only("Sandbox verification is disabled");
        }
        let Some(runtime) = self.runtime.clone() else {
            return VerificationResult::review_only("Container runtime unavailable");
        };
        let Some(info) = runtime_info else {
            return VerificationResult::review_only("Could not detect project runtime");
        };

        if let Err(e) = runtime.ensure_image(&info.base_image).await {
            tracing::error!(image = %info.base_image, error = %e, "Sandbox image unavailable");
            return VerificationResult::review_only(format!("Failed to pull sandbox image: {}", e));
        }

        let config = self.config.with_overrides(overrides);
        let workspace = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.to_path_buf());
        let pick = |planned: &Vec<String>, default: &Vec<String>| {
            if planned.is_empty() {
                default.clone()
            } else {
                planned.clone()
            }
        };
        let install_cmds = pick(&strategy.install, &info.install_commands);
        let build_cmds = pick(&strategy.build, &info.build_commands);
        let test_cmds = pick(&strategy.test, &info.test_commands);
        let lint_cmds = info.lint_commands.clone();

        let phase = PhaseRun {
            runtime,
            config: &config,
            image: &info.base_image,
            workspace: &workspace,
        };
        let mut result = VerificationResult {
            language: Some(info.language.clone()),
            ..Default::default()
        };

        // Install
        if install_cmds.is_empty() {
            result.build_success = true;
            result.build_output = "No install commands required.".to_string();
            notify(&observer, SandboxPhase::Install, PhaseReport::skipped(Vec::new()));
        } else {
            tracing::info!(commands = ?install_cmds, "Sandbox install phase");
            let r = phase.run(SandboxPhase::Install, &install_cmds, true).await;
            report(&observer, SandboxPhase::Install, &install_cmds, &r);
            let r = match r {
                Ok(r) => r,
                Err(e) => return unrunnable(SandboxPhase::Install, &e, result),
            };
            result.build_output = r.combined_output();
            result.build_success = r.succeeded();
            if r.timed_out {
                result
                    .errors
                    .push(format!("Install timed out after {}s", config.timeout_install));
            } else if r.exit_code != 0 {
                result
                    .errors
                    .push(format!("Install failed with exit code {}", r.exit_code));
            }
        }

        // Build
        if !build_cmds.is_empty() && result.build_success {
            tracing::info!(commands = ?build_cmds, "Sandbox build phase");
            let r = phase.run(SandboxPhase::Build, &build_cmds, false).await;
            report(&observer, SandboxPhase::Build, &build_cmds, &r);
            let r = match r {
                Ok(r) => r,
                Err(e) => return unrunnable(SandboxPhase::Build, &e, result),
            };
            result.build_output.push_str("\n\n--- Build ---\n");
            result.build_output.push_str(&r.combined_output());
            if r.exit_code != 0 {
                result.build_success = false;
                result
                    .errors
                    .push(format!("Build failed with exit code {}", r.exit_code));
            }
            if r.timed_out {
                result.build_success = false;
                result
                    .errors
                    .push(format!("Build timed out after {}s", config.timeout_build));
            }
        } else {
            notify(&observer, SandboxPhase::Build, PhaseReport::skipped(build_cmds.clone()));
        }

        // Test and lint share nothing, so they run in separate containers at
        // once. Each reports as soon as it finishes.
        let (test, lint) = tokio::join!(
            async {
                let r = phase.run_optional(SandboxPhase::Test, &test_cmds).await;
                report_optional(&observer, SandboxPhase::Test, &test_cmds, &r);
                r
            },
            async {
                let r = phase.run_optional(SandboxPhase::Lint, &lint_cmds).await;
                report_optional(&observer, SandboxPhase::Lint, &lint_cmds, &r);
                r
            },
        );
        let test = match test {
            Ok(test) => test,
            Err(e) => return unrunnable(SandboxPhase::Test, &e, result),
        };
        let lint = match lint {
            Ok(lint) => lint,
            Err(e) => return unrunnable(SandboxPhase::Lint, &e, result),
        };

        if let Some(r) = test {
            result.test_output = r.combined_output();
            let (passed, total) = self
                .interpreter
                .test_counts(&format!("{}{}", r.stdout, r.stderr));
            result.tests_passed = passed;
            result.tests_total = total;
            if r.timed_out {
                result
                    .errors
                    .push(format!("Tests timed out after {}s", config.timeout_test));
            }
        }

        if let Some(r) = lint {
            result.lint_output = r.combined_output();
            result.lint_issues = self
                .interpreter
                .lint_issues(&format!("{}{}", r.stdout, r.stderr));
        }

        tracing::info!(
            build_success = result.build_success,
            tests_passed = result.tests_passed,
            tests_total = result.tests_total,
            lint_issues = result.lint_issues,
            "Sandbox verification finished"
        );
        result
    }
}

/// A phase container could not be created or driven: the run as a whole
/// becomes review-only. Output gathered so far is kept for the validator.
fn unrunnable(phase: SandboxPhase, err: &SandboxError, partial: VerificationResult) -> VerificationResult {
    tracing::error!(phase = %phase, error = %err, "Sandbox phase could not run; degrading to review-only");
    let mut result = VerificationResult::review_only(format!("{} phase could not run: {}", phase, err));
    result.language = partial.language;
    result.build_output = partial.build_output;
    result.errors.splice(0..0, partial.errors);
    result
}

/// Hand a report to the observer. A panicking observer is logged and ignored.
fn notify(observer: &Option<PhaseObserver>, phase: SandboxPhase, report: PhaseReport) {
    let Some(observer) = observer else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| observer(phase, report))).is_err() {
        tracing::warn!(phase = %phase, "Phase observer panicked");
    }
}

fn report(
    observer: &Option<PhaseObserver>,
    phase: SandboxPhase,
    commands: &[String],
    outcome: &Result<CommandResult, SandboxError>,
) {
    let result = match outcome {
        Ok(result) => PhaseReport::from_result(result, commands.to_vec()),
        Err(e) => PhaseReport::from_result(&failed(commands.join(" && "), e, 0.0), commands.to_vec()),
    };
    notify(observer, phase, result);
}

fn report_optional(
    observer: &Option<PhaseObserver>,
    phase: SandboxPhase,
    commands: &[String],
    outcome: &Result<Option<CommandResult>, SandboxError>,
) {
    match outcome {
        Ok(Some(result)) => notify(observer, phase, PhaseReport::from_result(result, commands.to_vec())),
        Ok(None) => notify(observer, phase, PhaseReport::skipped(commands.to_vec())),
        Err(e) => notify(
            observer,
            phase,
            PhaseReport::from_result(&failed(commands.join(" && "), e, 0.0), commands.to_vec()),
        ),
    }
}

/// Shared inputs for every phase container of one verification run.
struct PhaseRun<'a> {
    runtime: Arc<dyn ContainerRuntime>,
    config: &'a SandboxConfig,
    image: &'a str,
    workspace: &'a Path,
}

impl PhaseRun<'_> {
    async fn run_optional(
        &self,
        phase: SandboxPhase,
        commands: &[String],
    ) -> Result<Option<CommandResult>, SandboxError> {
        if commands.is_empty() {
            return Ok(None);
        }
        tracing::info!(phase = %phase, commands = ?commands, "Sandbox phase");
        self.run(phase, commands, false).await.map(Some)
    }

    /// Create, run and always remove one container. `Err` means the container
    /// runtime failed; a failing or timed-out command is an `Ok` result.
    async fn run(
        &self,
        phase: SandboxPhase,
        commands: &[String],
        extract: bool,
    ) -> Result<CommandResult, SandboxError> {
        let started = Instant::now();
        let spec = ContainerSpec::for_phase(self.config, self.image, phase, commands);

        let id = self.runtime.create(&spec).await.inspect_err(|e| {
            tracing::warn!(phase = %phase, error = %e, "Failed to create sandbox container");
        })?;
        let mut guard = ContainerGuard::new(self.runtime.clone(), id.clone());

        let result = self.drive(&id, phase, commands, extract, started).await;

        guard.disarm();
        if let Err(e) = self.runtime.remove(&id).await {
            tracing::warn!(container = %id, error = %e, "Failed to remove sandbox container");
        }

        match &result {
            Ok(result) => tracing::info!(
                phase = %phase,
                exit_code = result.exit_code,
                timed_out = result.timed_out,
                duration_secs = result.duration_secs,
                stdout_chars = result.stdout.len(),
                "Sandbox phase finished"
            ),
            Err(e) => tracing::warn!(phase = %phase, error = %e, "Sandbox container failed"),
        }
        result
    }

    async fn drive(
        &self,
        id: &str,
        phase: SandboxPhase,
        commands: &[String],
        extract: bool,
        started: Instant,
    ) -> Result<CommandResult, SandboxError> {
        let root = self.workspace.to_path_buf();
        let (tar, _) = tokio::task::spawn_blocking(move || archive::build_archive(&root))
            .await
            .map_err(|e| SandboxError::Other(e.into()))?
            .map_err(SandboxError::Archive)?;
        self.runtime.upload(id, CONTAINER_WORKSPACE, tar).await?;
        self.runtime.start(id).await?;

        let per_command = self.config.timeout_for(phase);
        let limit = Duration::from_secs(per_command.saturating_mul(commands.len().max(1) as u64));
        let max = self.config.max_output_chars;

        let exit_code = match tokio::time::timeout(limit, self.runtime.wait(id)).await {
            Ok(code) => code?,
            Err(_) => {
                tracing::warn!(phase = %phase, timeout_secs = limit.as_secs(), "Sandbox phase timed out; killing container");
                if let Err(e) = self.runtime.kill(id).await {
                    tracing::warn!(container = %id, error = %e, "Failed to kill timed-out container");
                }
                let (stdout, stderr) = self.runtime.logs(id).await.unwrap_or_default();
                let mut stderr = truncate_output(&stderr, max);
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("Timed out after {}s", limit.as_secs()));
                return Ok(CommandResult {
                    command: commands.join(" && "),
                    exit_code: -1,
                    stdout: truncate_output(&stdout, max),
                    stderr,
                    timed_out: true,
                    duration_secs: started.elapsed().as_secs_f64(),
                });
            }
        };

        let (stdout, stderr) = self.runtime.logs(id).await?;

        if extract && exit_code == 0 {
            self.extract_workspace(id).await;
        }

        Ok(CommandResult {
            command: commands.join(" && "),
            exit_code,
            stdout: truncate_output(&stdout, max),
            stderr: truncate_output(&stderr, max),
            timed_out: false,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Copy `/workspace` back to the host so later phases see installed
    /// dependencies. Failures are logged; the phase result stands.
    async fn extract_workspace(&self, id: &str) {
        let bytes = match self.runtime.download(id, CONTAINER_WORKSPACE).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to download workspace from container");
                return;
            }
        };
        let dest: PathBuf = self.workspace.to_path_buf();
        let prefix = CONTAINER_WORKSPACE.trim_start_matches('/').to_string();
        match tokio::task::spawn_blocking(move || archive::extract_archive(&bytes, &dest, &prefix))
            .await
        {
            Ok(Ok(report)) => {
                tracing::info!(written = report.written, skipped = report.skipped, "Extracted workspace from install container")
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to extract workspace archive"),
            Err(e) => tracing::warn!(error = %e, "Workspace extraction task failed"),
        }
    }
}

fn failed(command: String, err: &SandboxError, duration_secs: f64) -> CommandResult {
    CommandResult {
        command,
        exit_code: -1,
        stdout: String::new(),
        stderr: format!("Container execution failed: {}", err),
        timed_out: false,
        duration_secs,
    }
}

/// Cut `text` to `max` characters, appending a marker when anything was cut.
pub fn truncate_output(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n\n[... truncated at {} chars ...]", &text[..cut], max),
        None => text.to_string(),
    }
}

/// Removes the container if the phase future is dropped before cleanup ran.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(container = %self.id, "No runtime to remove abandoned container");
            return;
        };
        let runtime = self.runtime.clone();
        let id = std::mem::take(&mut self.id);
        handle.spawn(async move {
            if let Err(e) = runtime.remove(&id).await {
                tracing::warn!(container = %id, error = %e, "Failed to remove abandoned container");
            }
        });
    }
}
