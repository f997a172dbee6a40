//! The project phase state machine.
//!
//! `run_cycle` drives a project from requirements to a terminal state in one
//! task. `handle_trigger` runs exactly one phase for a trigger file and hands
//! off to the next phase by touching its trigger artifact, which the watcher
//! picks up.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tumbler_common::{
    AgentKind, ConversationEntry, PhaseReport, ProjectState, ProjectStatus, Role, SandboxPhase,
    VerificationResult,
};

use super::evaluate::{Outcome, evaluate};
use super::finalize::archive_staging;
use super::generation::{
    collect_previous_code, plan_generation, run_generation, write_generated_files, Manifest,
};
use super::plan::{extract_planned_files, extract_resource_requirements, extract_strategy, plan_digest};
use crate::agents::{
    Agents, GenerationRequest, PlanRequest, TokenUsage, ValidationRequest, extract_report_score,
};
use crate::config::{GenerationConfig, LoopConfig};
use crate::errors::{AgentError, OrchestratorError};
use crate::sandbox::{MarkerDetector, PhaseObserver, RuntimeDetector, SandboxExecutor};
use crate::state::{NoopMirror, StateMirror, StateStore, find_project_root};
use crate::watcher::{TriggerKind, classify_trigger};

/// Guidance handed to the generator when the previous report is missing.
const FALLBACK_FEEDBACK: &str = "No validator report is available for the previous iteration. \
Re-read the plan, make sure every planned file exists and is complete, fix anything that would \
stop the project from installing, building or passing its tests, and keep working code intact.";

/// Score used when neither the validator nor the sandbox produced one.
const DEFAULT_SCORE: f64 = 5.0;

/// Where a requirements trigger leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Start {
    /// A new plan was written.
    Planned,
    /// The current plan matches persisted state; continue iterating.
    Resumed,
    /// The plan matches but the run already hit a limit; nothing to do.
    Finished,
}

/// Runs phases for projects. Cheap to clone; shared by all workers.
#[derive(Clone)]
pub struct Orchestrator {
    workspace: PathBuf,
    agents: Agents,
    executor: Arc<SandboxExecutor>,
    detector: Arc<dyn RuntimeDetector>,
    mirror: Arc<dyn StateMirror>,
    loop_config: LoopConfig,
    generation: GenerationConfig,
}

impl Orchestrator {
    /// Trigger paths are resolved to projects strictly inside `workspace`.
    pub fn new(
        workspace: PathBuf,
        agents: Agents,
        executor: Arc<SandboxExecutor>,
        loop_config: LoopConfig,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            workspace,
            agents,
            executor,
            detector: Arc::new(MarkerDetector),
            mirror: Arc::new(NoopMirror),
            loop_config,
            generation,
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn RuntimeDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn StateMirror>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn open_store(&self, project: &Path) -> Result<StateStore, OrchestratorError> {
        Ok(StateStore::open(project, self.mirror.clone())?)
    }

    /// Run a project until it completes, fails, or `cancel` fires. A phase
    /// error marks the project failed and is returned.
    pub async fn run_cycle(
        &self,
        project: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProjectState, OrchestratorError> {
        let store = self.open_store(project)?;
        match self.drive(&store, cancel).await {
            Ok(()) => Ok(store.load()),
            Err(e) => {
                store.mark_failed(&e.to_string())?;
                Err(e)
            }
        }
    }

    async fn drive(&self, store: &StateStore, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        if self.start(store).await? == Start::Finished {
            return Ok(());
        }
        loop {
            if cancel.is_cancelled() {
                tracing::info!(project = %store.name(), "Cycle cancelled between phases");
                return Ok(());
            }
            self.engineer(store).await?;
            if cancel.is_cancelled() {
                tracing::info!(project = %store.name(), "Cycle cancelled before verification");
                return Ok(());
            }
            match self.verify(store).await? {
                Outcome::Continue => continue,
                Outcome::Completed | Outcome::Failed(_) => return Ok(()),
            }
        }
    }

    /// Run the phase a trigger file stands for. Errors mark the project
    /// failed and are returned for logging; they never propagate further.
    pub async fn handle_trigger(&self, path: &Path) -> Result<(), OrchestratorError> {
        let Some(kind) = classify_trigger(path) else {
            tracing::debug!(path = %path.display(), "Not a trigger file");
            return Ok(());
        };
        let root =
            find_project_root(path, &self.workspace).ok_or_else(|| OrchestratorError::NoProjectRoot(path.to_path_buf()))?;
        let store = self.open_store(&root)?;
        let state = store.load();
        tracing::info!(project = %store.name(), trigger = ?kind, status = %state.status, "Handling trigger");

        let result = match kind {
            TriggerKind::Requirements => match self.start(&store).await {
                Ok(Start::Resumed) => touch(&store.layout().plan()),
                Ok(Start::Planned | Start::Finished) => Ok(()),
                Err(e) => Err(e),
            },
            TriggerKind::Plan => {
                // The planner's own write lands while planning is in flight.
                if state.status.is_terminal() || state.status == ProjectStatus::Planning {
                    tracing::info!(
                        project = %store.name(),
                        status = %state.status,
                        "Ignoring plan trigger"
                    );
                    return Ok(());
                }
                self.engineer(&store).await.map(|_| ())
            }
            TriggerKind::Manifest => {
                if state.status != ProjectStatus::Engineering {
                    tracing::info!(
                        project = %store.name(),
                        status = %state.status,
                        "Ignoring manifest trigger outside engineering"
                    );
                    return Ok(());
                }
                match self.verify(&store).await {
                    Ok(Outcome::Continue) => touch(&store.layout().plan()),
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = &result {
            store.mark_failed(&e.to_string())?;
        }
        result
    }

    /// Requirements arrived: resume if the plan on disk is the one this state
    /// was built from, otherwise reset and plan from scratch.
    async fn start(&self, store: &StateStore) -> Result<Start, OrchestratorError> {
        let layout = store.layout();
        let requirements = match fs::read_to_string(layout.requirements()) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => return Err(OrchestratorError::MissingRequirements(layout.requirements())),
        };

        let state = store.load();
        let plan = fs::read(layout.plan()).unwrap_or_default();
        let resumable = !plan.is_empty()
            && state.iteration > 0
            && state.plan_digest.as_deref() == Some(plan_digest(&plan).as_str());
        if resumable {
            let outcome = evaluate(&state, store.total_cost(), &self.loop_config);
            if outcome != Outcome::Continue {
                tracing::info!(
                    project = %store.name(),
                    iteration = state.iteration,
                    outcome = ?outcome,
                    "Plan unchanged but run is over; not resuming"
                );
                self.conclude(store, &state, &outcome)?;
                return Ok(Start::Finished);
            }
            tracing::info!(
                project = %store.name(),
                iteration = state.iteration,
                "Plan unchanged; resuming"
            );
            store.update(|s| s.transition(ProjectStatus::Engineering))?;
            self.record(store, AgentKind::System, Role::Status, state.iteration, "Resumed from existing plan");
            return Ok(Start::Resumed);
        }

        let limits = &self.loop_config;
        store.update(|s| {
            s.reset_run();
            s.apply_limits(limits.max_iterations, limits.quality_threshold, limits.max_cost_per_project);
        })?;
        store.clear_conversation();
        self.plan(store, &requirements).await?;
        Ok(Start::Planned)
    }

    async fn plan(&self, store: &StateStore, requirements: &str) -> Result<(), OrchestratorError> {
        let name = store.name();
        store.update_status(ProjectStatus::Planning)?;
        tracing::info!(project = %name, phase = "planning", "Planning");
        self.record(store, AgentKind::Planner, Role::Input, 0, requirements);

        let reply = self
            .agents
            .planner
            .plan(&PlanRequest {
                project: name.clone(),
                requirements: requirements.to_string(),
            })
            .await?;
        self.log_usage(store, AgentKind::Planner, reply.usage)?;

        let plan_path = store.layout().plan();
        if let Some(parent) = plan_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }
        crate::state::store::write_atomic(&plan_path, reply.text.as_bytes())?;

        let overrides = extract_resource_requirements(&reply.text);
        store.update(|s| {
            s.plan_digest = Some(plan_digest(reply.text.as_bytes()));
            s.verification.merge(overrides);
            s.transition(ProjectStatus::Engineering);
        })?;
        self.record(store, AgentKind::Planner, Role::Output, 0, &reply.text);
        tracing::info!(project = %name, bytes = reply.text.len(), "Plan written");
        Ok(())
    }

    /// One engineering pass: bump the iteration, generate, stage, write the
    /// manifest.
    async fn engineer(&self, store: &StateStore) -> Result<Manifest, OrchestratorError> {
        let name = store.name();
        let layout = store.layout();
        let plan = fs::read_to_string(layout.plan())
            .map_err(|_| OrchestratorError::MissingPlan(layout.plan()))?;

        store.update_status(ProjectStatus::Engineering)?;
        let iteration = store.increment_iteration()?;
        tracing::info!(project = %name, phase = "engineering", iteration, "Generating");

        let (feedback, previous_code) = if iteration > 1 {
            let feedback = fs::read_to_string(layout.report(iteration - 1))
                .ok()
                .filter(|text| !text.trim().is_empty())
                .unwrap_or_else(|| FALLBACK_FEEDBACK.to_string());
            (Some(feedback), collect_previous_code(&layout.staging()))
        } else {
            (None, Default::default())
        };

        let planned = extract_planned_files(&plan);
        let (strategy, groups) = plan_generation(&planned, &self.generation);
        let request = GenerationRequest {
            project: name.clone(),
            plan,
            iteration,
            feedback,
            previous_code,
            target_files: Vec::new(),
        };
        self.record(
            store,
            AgentKind::Generator,
            Role::Input,
            iteration,
            format!("Generating {} planned file(s) with {:?}", planned.len(), strategy),
        );

        let max_attempts = self.loop_config.max_degenerate_retries.max(1);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match run_generation(self.agents.generator.as_ref(), &request, strategy, groups.clone()).await {
                Ok(outcome) => break outcome,
                Err(OrchestratorError::Agent(e)) if e.is_degenerate() => {
                    tracing::warn!(project = %name, attempt, max_attempts, "Degenerate generator output");
                    self.record(
                        store,
                        AgentKind::Generator,
                        Role::Error,
                        iteration,
                        format!("Degenerate output (attempt {}/{})", attempt, max_attempts),
                    );
                    if attempt >= max_attempts {
                        return Err(OrchestratorError::DegenerateLimit { attempts: attempt });
                    }
                }
                Err(e) => return Err(e),
            }
        };

        for usage in &outcome.usage {
            self.log_usage(store, AgentKind::Generator, *usage)?;
        }
        let manifest = write_generated_files(&layout.staging(), &outcome.files)?;
        self.record(
            store,
            AgentKind::Generator,
            Role::Output,
            iteration,
            format!(
                "Generated {} file(s){}",
                manifest.file_count,
                if outcome.failed_groups > 0 {
                    format!(", {} group(s) failed", outcome.failed_groups)
                } else {
                    String::new()
                }
            ),
        );
        tracing::info!(project = %name, iteration, files = manifest.file_count, "Staged generated files");
        Ok(manifest)
    }

    /// Sandbox the staged code, score it, write the report, then decide.
    async fn verify(&self, store: &StateStore) -> Result<Outcome, OrchestratorError> {
        let name = store.name();
        let layout = store.layout();
        let state = store.update_status(ProjectStatus::Verifying)?;
        let iteration = state.iteration;
        tracing::info!(project = %name, phase = "verifying", iteration, "Verifying");

        let plan = fs::read_to_string(layout.plan())
            .map_err(|_| OrchestratorError::MissingPlan(layout.plan()))?;
        let staging = layout.staging();
        let runtime = self.detector.detect(&staging, &plan);
        let strategy = extract_strategy(&plan);

        let observer: PhaseObserver = {
            let store = store.clone();
            Arc::new(move |phase: SandboxPhase, report: PhaseReport| {
                log_phase(&store, iteration, phase, &report);
            })
        };
        let verification = self
            .executor
            .run_verification(&staging, &strategy, runtime.as_ref(), &state.verification, Some(observer))
            .await;
        let preliminary = verification.preliminary_score();
        tracing::info!(
            project = %name,
            build_success = verification.build_success,
            tests_passed = verification.tests_passed,
            tests_total = verification.tests_total,
            lint_issues = verification.lint_issues,
            review_only = verification.code_review_only,
            preliminary = ?preliminary,
            "Sandbox verification finished"
        );

        let request = ValidationRequest {
            project: name.clone(),
            plan,
            iteration,
            files: collect_previous_code(&staging),
            verification: verification.clone(),
        };
        let (report, validator_score) = match self.agents.validator.validate(&request).await {
            Ok(reply) => {
                self.log_usage(store, AgentKind::Validator, reply.usage)?;
                let score = extract_report_score(&reply.text);
                (reply.text, score)
            }
            Err(e @ AgentError::Degenerate { .. }) => {
                tracing::warn!(project = %name, error = %e, "Validator output degenerate; using preliminary score");
                (fallback_report(iteration, &verification, preliminary), None)
            }
            Err(e) => return Err(e.into()),
        };
        let score = validator_score.or(preliminary).unwrap_or(DEFAULT_SCORE);

        let report_path = layout.report(iteration);
        if let Some(parent) = report_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }
        crate::state::store::write_atomic(&report_path, report.as_bytes())?;
        self.record(store, AgentKind::Validator, Role::Output, iteration, &report);

        let state = store.set_score(score)?;
        tracing::info!(project = %name, iteration, score, "Iteration scored");

        let outcome = evaluate(&state, store.total_cost(), &self.loop_config);
        if outcome == Outcome::Continue {
            tracing::info!(project = %name, iteration, score, "Below threshold; refining");
            self.record(
                store,
                AgentKind::System,
                Role::Status,
                iteration,
                format!("Score {:.1} below {:.1}; continuing", score, state.quality_threshold),
            );
        } else {
            self.conclude(store, &state, &outcome)?;
        }
        Ok(outcome)
    }

    /// Apply a terminal outcome. A project that is already completed is not
    /// archived twice.
    fn conclude(&self, store: &StateStore, state: &ProjectState, outcome: &Outcome) -> Result<(), OrchestratorError> {
        let name = store.name();
        let iteration = state.iteration;
        let score = state.last_score.unwrap_or_default();
        match outcome {
            Outcome::Continue => {}
            Outcome::Completed if state.status == ProjectStatus::Completed => {}
            Outcome::Completed => {
                let archive = archive_staging(store.layout())?;
                store.update_status(ProjectStatus::Completed)?;
                tracing::info!(project = %name, iteration, score, "Project completed");
                self.record(
                    store,
                    AgentKind::System,
                    Role::Status,
                    iteration,
                    format!("Completed with score {:.1}; archived to {}", score, archive.display()),
                );
            }
            Outcome::Failed(reason) => {
                store.mark_failed(reason)?;
                self.record(store, AgentKind::System, Role::Error, iteration, reason.as_str());
            }
        }
        Ok(())
    }

    fn log_usage(&self, store: &StateStore, agent: AgentKind, usage: TokenUsage) -> Result<(), OrchestratorError> {
        store.log_usage(agent, usage.input_tokens, usage.output_tokens, usage.cost, None)?;
        Ok(())
    }

    fn record(&self, store: &StateStore, agent: AgentKind, role: Role, iteration: u32, content: impl Into<String>) {
        store.log_conversation(&ConversationEntry::new(agent, role, iteration, content));
    }
}

fn log_phase(store: &StateStore, iteration: u32, phase: SandboxPhase, report: &PhaseReport) {
    let entry = ConversationEntry::new(
        AgentKind::Sandbox,
        Role::Sandbox,
        iteration,
        format!("{} phase: {:?} (exit {})", phase, report.status, report.exit_code),
    )
    .with_meta("phase", phase.as_str())
    .with_meta("exit_code", report.exit_code)
    .with_meta("duration_secs", report.duration_secs)
    .with_meta("commands", report.commands.clone());
    store.log_conversation(&entry);
}

fn fallback_report(iteration: u32, verification: &VerificationResult, preliminary: Option<f64>) -> String {
    let mut report = format!("# Validation Report: Iteration {}\n\n", iteration);
    report.push_str("The validator returned unusable output; this report covers automated checks only.\n\n");
    if verification.code_review_only {
        report.push_str("Automated verification did not run.\n");
    } else {
        report.push_str(&format!(
            "- Build: {}\n- Tests: {}/{} passed\n- Lint issues: {}\n",
            if verification.build_success { "succeeded" } else { "failed" },
            verification.tests_passed,
            verification.tests_total,
            verification.lint_issues
        ));
    }
    if !verification.errors.is_empty() {
        report.push_str("\n## Errors\n\n");
        for error in &verification.errors {
            report.push_str(&format!("- {}\n", error));
        }
    }
    if let Some(score) = preliminary {
        report.push_str(&format!("\n**Overall Score**: {:.1}/10\n", score));
    }
    report
}

/// Bump a trigger file's mtime so the watcher sees it again.
fn touch(path: &Path) -> Result<(), OrchestratorError> {
    let file = fs::File::options()
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))?;
    file.set_modified(SystemTime::now())
        .map_err(|e| anyhow::anyhow!("Failed to touch {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::agents::{AgentReply, GeneratedFiles, Generator, Planner, Validator};
    use crate::sandbox::SandboxConfig;

    const PLAN: &str = "# Todo\n\n## Files\n\n- src/app.py\n- tests/test_app.py\n";

    struct ScriptedPlanner {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(&self, _request: &PlanRequest) -> Result<AgentReply, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentReply {
                text: PLAN.to_string(),
                usage: TokenUsage::default(),
            })
        }
    }

    struct ScriptedGenerator {
        calls: AtomicU32,
        cost: f64,
        degenerate_first: u32,
        feedback: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedFiles, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.feedback.lock().unwrap().push(request.feedback.clone());
            if call <= self.degenerate_first {
                return Err(AgentError::Degenerate {
                    agent: AgentKind::Generator,
                });
            }
            let mut files = BTreeMap::new();
            files.insert("src/app.py".to_string(), format!("VERSION = {}\n", request.iteration));
            files.insert("tests/test_app.py".to_string(), "def test(): pass\n".to_string());
            Ok(GeneratedFiles {
                files,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    cost: self.cost,
                },
            })
        }
    }

    struct ScriptedValidator {
        scores: Mutex<VecDeque<f64>>,
    }

    #[async_trait]
    impl Validator for ScriptedValidator {
        async fn validate(&self, request: &ValidationRequest) -> Result<AgentReply, AgentError> {
            let score = self.scores.lock().unwrap().pop_front().unwrap_or(1.0);
            Ok(AgentReply {
                text: format!(
                    "# Report {}\n\nFix the edge cases.\n\n**Overall Score**: {}/10\n",
                    request.iteration, score
                ),
                usage: TokenUsage::default(),
            })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        project: std::path::PathBuf,
        planner: Arc<ScriptedPlanner>,
        generator: Arc<ScriptedGenerator>,
        orchestrator: Orchestrator,
    }

    fn harness(scores: &[f64], cost: f64, degenerate_first: u32, loop_config: LoopConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("todo");
        fs::create_dir_all(project.join("01_input")).unwrap();
        fs::write(project.join("01_input/requirements.txt"), "A todo API").unwrap();

        let planner = Arc::new(ScriptedPlanner {
            calls: AtomicU32::new(0),
        });
        let generator = Arc::new(ScriptedGenerator {
            calls: AtomicU32::new(0),
            cost,
            degenerate_first,
            feedback: Mutex::new(Vec::new()),
        });
        let validator = Arc::new(ScriptedValidator {
            scores: Mutex::new(scores.iter().copied().collect()),
        });
        let executor = SandboxExecutor::new(
            None,
            SandboxConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let orchestrator = Orchestrator::new(
            dir.path().to_path_buf(),
            Agents::new(planner.clone(), generator.clone(), validator),
            Arc::new(executor),
            loop_config,
            GenerationConfig::default(),
        );
        Harness {
            _dir: dir,
            project,
            planner,
            generator,
            orchestrator,
        }
    }

    fn loop_config() -> LoopConfig {
        LoopConfig {
            max_iterations: 5,
            quality_threshold: 8.0,
            ..Default::default()
        }
    }

    fn archives(project: &Path) -> usize {
        fs::read_dir(project.join("05_final"))
            .map(|dir| dir.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_completes_when_threshold_met() {
        let h = harness(&[4.0, 9.0], 0.0, 0, loop_config());
        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, ProjectStatus::Completed);
        assert_eq!(state.iteration, 2);
        assert_eq!(state.scores, vec![4.0, 9.0]);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(archives(&h.project), 1);
        assert!(h.project.join("04_feedback/REPORT_iter1.md").exists());
        assert!(h.project.join("04_feedback/REPORT_iter2.md").exists());

        // The second iteration was refined with the first report.
        let feedback = h.generator.feedback.lock().unwrap().clone();
        assert_eq!(feedback[0], None);
        assert!(feedback[1].as_deref().unwrap().contains("# Report 1"));
    }

    #[tokio::test]
    async fn test_plateau_fails_before_max_iterations() {
        let h = harness(&[5.0, 5.2, 4.9], 0.0, 0, loop_config());
        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, ProjectStatus::Failed);
        assert_eq!(state.iteration, 3);
        assert!(state.error.as_deref().unwrap().starts_with("Score plateau"));
        assert_eq!(archives(&h.project), 0);
    }

    #[tokio::test]
    async fn test_cost_ceiling_stops_generation() {
        let config = LoopConfig {
            max_cost_per_project: 1.0,
            ..loop_config()
        };
        let h = harness(&[3.0, 6.0, 7.0], 0.6, 0, config);
        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, ProjectStatus::Failed);
        assert!(state.error.as_deref().unwrap().starts_with("Cost limit exceeded"));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_degenerate_output_is_retried() {
        let h = harness(&[9.0], 0.0, 2, loop_config());
        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, ProjectStatus::Completed);
        assert_eq!(state.iteration, 1);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_degenerate_limit_fails_project() {
        let h = harness(&[9.0], 0.0, 10, loop_config());
        let err = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::DegenerateLimit { attempts: 3 }));
        let state = StateStore::open_local(&h.project).unwrap().load();
        assert_eq!(state.status, ProjectStatus::Failed);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_requirements_fails_project() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        fs::remove_file(h.project.join("01_input/requirements.txt")).unwrap();

        let err = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingRequirements(_)));
        let state = StateStore::open_local(&h.project).unwrap().load();
        assert_eq!(state.status, ProjectStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("Requirements file not found"));
    }

    #[tokio::test]
    async fn test_resume_skips_planning_when_plan_matches() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        fs::create_dir_all(h.project.join("02_plan")).unwrap();
        fs::write(h.project.join("02_plan/PLAN.md"), PLAN).unwrap();
        let store = StateStore::open_local(&h.project).unwrap();
        store
            .update(|s| {
                s.iteration = 2;
                s.max_iterations = 5;
                s.quality_threshold = 8.0;
                s.plan_digest = Some(plan_digest(PLAN.as_bytes()));
                s.fail("interrupted");
            })
            .unwrap();

        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.planner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.iteration, 3);
        assert_eq!(state.status, ProjectStatus::Completed);
    }

    #[tokio::test]
    async fn test_hand_written_plan_without_state_is_fresh_start() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        fs::create_dir_all(h.project.join("02_plan")).unwrap();
        fs::write(h.project.join("02_plan/PLAN.md"), "# handwritten").unwrap();

        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.planner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.iteration, 1);
        assert_eq!(fs::read_to_string(h.project.join("02_plan/PLAN.md")).unwrap(), PLAN);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_stops_between_phases() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = h.orchestrator.run_cycle(&h.project, &cancel).await.unwrap();
        assert_eq!(state.status, ProjectStatus::Engineering);
        assert_eq!(state.iteration, 0);
        assert!(state.plan_digest.is_some());
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_triggers_advance_one_phase_each() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        let layout = crate::state::ProjectLayout::new(&h.project);

        let store = StateStore::open_local(&h.project).unwrap();
        h.orchestrator.handle_trigger(&layout.requirements()).await.unwrap();
        assert!(layout.plan().exists());
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.load().status, ProjectStatus::Engineering);
        assert_eq!(store.load().iteration, 0);

        h.orchestrator.handle_trigger(&layout.plan()).await.unwrap();
        assert!(layout.manifest().exists());
        assert_eq!(store.load().status, ProjectStatus::Engineering);
        assert_eq!(store.load().iteration, 1);

        h.orchestrator.handle_trigger(&layout.manifest()).await.unwrap();
        let state = store.load();
        assert_eq!(state.status, ProjectStatus::Completed);
        assert_eq!(archives(&h.project), 1);

        // Terminal projects ignore further plan triggers.
        h.orchestrator.handle_trigger(&layout.plan()).await.unwrap();
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conversation_records_phases() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        h.orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();

        let entries = StateStore::open_local(&h.project).unwrap().load_conversation();
        let agents: Vec<AgentKind> = entries.iter().map(|e| e.agent).collect();
        assert!(agents.contains(&AgentKind::Planner));
        assert!(agents.contains(&AgentKind::Generator));
        assert!(agents.contains(&AgentKind::Validator));
        assert_eq!(entries.last().unwrap().agent, AgentKind::System);
    }

    #[tokio::test]
    async fn test_plan_trigger_ignored_while_planning() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        let layout = crate::state::ProjectLayout::new(&h.project);
        fs::create_dir_all(h.project.join("02_plan")).unwrap();
        fs::write(layout.plan(), PLAN).unwrap();
        let store = StateStore::open_local(&h.project).unwrap();
        store.update_status(ProjectStatus::Planning).unwrap();

        h.orchestrator.handle_trigger(&layout.plan()).await.unwrap();
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.load().status, ProjectStatus::Planning);
    }

    #[tokio::test]
    async fn test_trigger_outside_workspace_is_rejected() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        let elsewhere = tempfile::tempdir().unwrap();
        let stray = elsewhere.path().join("stray");
        fs::create_dir_all(stray.join("01_input")).unwrap();
        fs::write(stray.join("01_input/requirements.txt"), "A todo API").unwrap();

        let err = h
            .orchestrator
            .handle_trigger(&stray.join("01_input/requirements.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoProjectRoot(_)));
        assert_eq!(h.planner.calls.load(Ordering::SeqCst), 0);
        assert!(!stray.join(".tumbler").exists());
    }

    /// State of a project whose plan on disk matches its digest.
    fn planned_state(h: &Harness, f: impl FnOnce(&mut ProjectState)) -> StateStore {
        fs::create_dir_all(h.project.join("02_plan")).unwrap();
        fs::write(h.project.join("02_plan/PLAN.md"), PLAN).unwrap();
        let store = StateStore::open_local(&h.project).unwrap();
        store
            .update(|s| {
                s.plan_digest = Some(plan_digest(PLAN.as_bytes()));
                f(s);
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_resume_at_iteration_cap_does_not_generate() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        let store = planned_state(&h, |s| {
            s.iteration = 5;
            s.max_iterations = 5;
            s.record_score(6.0);
            s.transition(ProjectStatus::Completed);
        });

        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.planner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.iteration, 5);
        assert_eq!(state.status, ProjectStatus::Completed);
        // Already completed, so no second archive.
        assert_eq!(archives(&h.project), 0);
        assert_eq!(store.load().iteration, 5);
    }

    #[tokio::test]
    async fn test_resume_over_budget_stays_failed() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        let store = planned_state(&h, |s| {
            s.iteration = 2;
            s.max_iterations = 5;
            s.max_cost = 1.0;
            s.fail("Cost limit exceeded: $1.5000 >= $1.00");
        });
        store.log_usage(AgentKind::Generator, 10, 10, 1.5, None).unwrap();

        let layout = crate::state::ProjectLayout::new(&h.project);
        h.orchestrator.handle_trigger(&layout.requirements()).await.unwrap();

        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        let state = store.load();
        assert_eq!(state.status, ProjectStatus::Failed);
        assert_eq!(state.iteration, 2);
        assert!(state.error.as_deref().unwrap().starts_with("Cost limit exceeded"));
    }

    #[tokio::test]
    async fn test_interrupted_run_at_cap_is_archived_on_resume() {
        let h = harness(&[9.0], 0.0, 0, loop_config());
        planned_state(&h, |s| {
            s.iteration = 5;
            s.max_iterations = 5;
            s.record_score(6.0);
            s.transition(ProjectStatus::Verifying);
        });

        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, ProjectStatus::Completed);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(archives(&h.project), 1);
    }

    #[tokio::test]
    async fn test_project_limits_override_config() {
        let h = harness(&[4.0, 4.5], 0.0, 0, loop_config());
        let store = StateStore::open_local(&h.project).unwrap();
        store
            .set_limit_overrides(tumbler_common::LimitOverrides {
                max_iterations: Some(1),
                ..Default::default()
            })
            .unwrap();

        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.max_iterations, 1);
        assert_eq!(state.quality_threshold, 8.0);
        assert_eq!(state.iteration, 1);
        assert_eq!(state.status, ProjectStatus::Completed);
        assert_eq!(state.limits.max_iterations, Some(1));
    }

    #[tokio::test]
    async fn test_project_cost_ceiling_applies() {
        let h = harness(&[3.0, 6.0, 7.0], 0.6, 0, loop_config());
        StateStore::open_local(&h.project)
            .unwrap()
            .set_limit_overrides(tumbler_common::LimitOverrides {
                max_cost: Some(1.0),
                ..Default::default()
            })
            .unwrap();

        let state = h
            .orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.max_cost, 1.0);
        assert!(state.error.as_deref().unwrap().starts_with("Cost limit exceeded"));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
    }

    struct RecordingDetector {
        plans: Mutex<Vec<String>>,
    }

    impl RuntimeDetector for RecordingDetector {
        fn detect(&self, _workspace: &Path, plan: &str) -> Option<crate::sandbox::RuntimeInfo> {
            self.plans.lock().unwrap().push(plan.to_string());
            None
        }
    }

    #[tokio::test]
    async fn test_detector_sees_plan_each_iteration() {
        let h = harness(&[4.0, 9.0], 0.0, 0, loop_config());
        let detector = Arc::new(RecordingDetector {
            plans: Mutex::new(Vec::new()),
        });
        let orchestrator = h.orchestrator.with_detector(detector.clone());

        let state = orchestrator
            .run_cycle(&h.project, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.status, ProjectStatus::Completed);
        let plans = detector.plans.lock().unwrap();
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|plan| plan == PLAN));
    }

    #[test]
    fn test_fallback_report_carries_preliminary_score() {
        let verification = VerificationResult {
            build_success: true,
            tests_passed: 3,
            tests_total: 4,
            ..Default::default()
        };
        let report = fallback_report(2, &verification, Some(9.0));
        assert!(report.contains("Tests: 3/4 passed"));
        assert_eq!(extract_report_score(&report), Some(9.0));
    }
}
