//! Step-by-step plan execution with operator-driven recovery.
//!
//! [`StepEngine`] owns the active plan, the code buffer, and the target
//! artifact. Each [`StepEngine::advance`] call drives the step at the current
//! index through generation and execution:
//!
//! ```text
//! PENDING -> GENERATING -> EXECUTING -> SUCCEEDED
//!                                    \-> FAILED (awaiting decision)
//! ```
//!
//! A failed step blocks the plan until [`StepEngine::recover`] applies the
//! operator's decision. The plan is COMPLETED when the index reaches the end
//! with no failure; it is discarded on completion, abort, or a new instruction.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::action::{UserAction, classify, dependency_image_path};
use crate::core::plan_parser::parse_plan;
use crate::core::provenance::{Provenance, annotate};
use crate::core::types::{ExecutionOutcome, FailureKind, RunStatus, Step, StepFailure};
use crate::executor::{ExecRequest, Execute};
use crate::io::artifacts::ArtifactStore;
use crate::io::collaborator::{Analysis, CodeGen, CodeGenRequest, PlanContext};
use crate::io::operator::Operator;
use crate::io::system::SystemInfo;
use crate::signal::{SignalDetector, SignalOutcome};

/// Reason recorded when the operator interrupts a running step.
pub const INTERRUPTED_REASON: &str = "user interruption";

/// The planner response yielded no steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub raw: String,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not parse a plan from the planner response")
    }
}

impl std::error::Error for ParseFailure {}

/// Active plan and progress through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanState {
    /// The instruction the plan was made for.
    pub goal: String,
    pub plan_text: String,
    pub steps: Vec<Step>,
    pub current_index: usize,
    pub confirmed: bool,
    pub failure: Option<StepFailure>,
}

impl PlanState {
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_index)
    }
}

/// Result of one [`StepEngine::advance`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// No confirmed plan to advance.
    Idle,
    /// Every step succeeded; the plan has been discarded.
    Completed,
    StepSucceeded { index: usize, signal: SignalOutcome },
    /// Code generation returned nothing; the step was acknowledged as done.
    VacuousSuccess { index: usize },
    /// A missing dependency was installed; the same step runs again.
    RetryAfterInstall { index: usize, module: String },
    /// The step failed and waits for a recovery decision.
    Failed { index: usize, reason: String },
    /// A manual action was not confirmed; the plan is paused at this step.
    AwaitingOperator { index: usize },
}

/// Operator decision for a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Retry,
    /// Replace the step's task text.
    Modify(String),
    Skip,
    Abort,
    /// Drop the plan and treat the text as a new instruction.
    NewInstruction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Retrying,
    Modified,
    Skipped,
    /// The skipped step was the last one.
    EndedViaSkip,
    Aborted,
    NewInstruction(String),
}

/// Services a step may call.
pub struct Collaborators<'a> {
    pub codegen: &'a dyn CodeGen,
    pub analysis: &'a dyn Analysis,
    pub executor: &'a dyn Execute,
    pub operator: &'a mut dyn Operator,
}

/// How generated code is written and annotated.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub comment_prefix: String,
    /// Language requested from code generation.
    pub language: String,
}

pub struct StepEngine {
    plan: Option<PlanState>,
    buffer: String,
    target: Option<PathBuf>,
    prior_context: String,
    artifacts: ArtifactStore,
    signals: SignalDetector,
    options: EngineOptions,
    system_info: SystemInfo,
}

impl StepEngine {
    pub fn new(
        artifacts: ArtifactStore,
        signals: SignalDetector,
        options: EngineOptions,
        system_info: SystemInfo,
    ) -> Self {
        Self {
            plan: None,
            buffer: String::new(),
            target: None,
            prior_context: String::new(),
            artifacts,
            signals,
            options,
            system_info,
        }
    }

    pub fn plan(&self) -> Option<&PlanState> {
        self.plan.as_ref()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    /// Summary of the most recent successful work.
    pub fn prior_context(&self) -> &str {
        &self.prior_context
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn signals(&self) -> &SignalDetector {
        &self.signals
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }

    /// A step failed and no decision has been applied yet.
    pub fn awaiting_decision(&self) -> bool {
        self.plan.as_ref().is_some_and(|p| p.failure.is_some())
    }

    /// Parse `plan_text` into a new, unconfirmed plan for `goal`.
    ///
    /// Fails with [`ParseFailure`] when no step can be derived; the previous
    /// plan, if any, is left untouched in that case.
    pub fn load_plan(&mut self, goal: &str, plan_text: &str) -> Result<&PlanState> {
        let steps = parse_plan(plan_text);
        if steps.is_empty() {
            return Err(ParseFailure {
                raw: plan_text.to_string(),
            }
            .into());
        }
        info!(steps = steps.len(), "plan parsed");
        Ok(self.plan.insert(PlanState {
            goal: goal.to_string(),
            plan_text: plan_text.to_string(),
            steps,
            current_index: 0,
            confirmed: false,
            failure: None,
        }))
    }

    /// Start executing the loaded plan from its first step with a fresh buffer.
    pub fn confirm_plan(&mut self) -> Result<()> {
        let Some(plan) = self.plan.as_mut() else {
            bail!("no plan to confirm");
        };
        plan.confirmed = true;
        plan.current_index = 0;
        plan.failure = None;
        self.prior_context = format!("Plan confirmed for: {}", plan.goal);
        self.buffer.clear();
        self.target = None;
        Ok(())
    }

    /// Drop an unconfirmed or finished plan without touching the buffer.
    pub fn discard_plan(&mut self) {
        self.plan = None;
    }

    /// Forget the plan and buffer ahead of a new top-level instruction.
    pub fn reset_for_instruction(&mut self) {
        self.plan = None;
        self.buffer.clear();
        self.target = None;
    }

    /// Replace the buffer outside a plan (e.g. after an ad-hoc repair).
    pub fn set_buffer(&mut self, code: String, target: Option<PathBuf>) {
        self.buffer = code;
        if target.is_some() {
            self.target = target;
        }
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.target = None;
    }

    pub fn record_success(&mut self, note: impl Into<String>) {
        self.prior_context = note.into();
    }

    /// Mark the active step failed, e.g. after an internal error.
    ///
    /// Returns `false` when no step is active.
    pub fn fail_current(&mut self, kind: FailureKind, reason: impl Into<String>) -> bool {
        let snapshot = self.buffer.clone();
        match self.plan.as_mut() {
            Some(plan) if plan.confirmed && plan.current_index < plan.steps.len() => {
                plan.failure = Some(StepFailure {
                    kind,
                    reason: reason.into(),
                    code_snapshot: snapshot,
                });
                true
            }
            _ => false,
        }
    }

    /// Drive the step at the current index.
    #[instrument(skip_all)]
    pub fn advance(&mut self, collab: &mut Collaborators<'_>) -> Result<AdvanceOutcome> {
        let Some(plan) = self.plan.as_ref() else {
            return Ok(AdvanceOutcome::Idle);
        };
        if !plan.confirmed {
            return Ok(AdvanceOutcome::Idle);
        }
        if let Some(failure) = &plan.failure {
            return Ok(AdvanceOutcome::Failed {
                index: plan.current_index,
                reason: failure.reason.clone(),
            });
        }
        let Some(step) = plan.current_step().cloned() else {
            info!(goal = %plan.goal, "plan completed");
            self.plan = None;
            return Ok(AdvanceOutcome::Completed);
        };

        let index = plan.current_index;
        debug!(index, task = %step.task, code_gen = step.requires_code_gen, "advancing step");
        if step.requires_code_gen {
            self.run_code_step(index, &step, collab)
        } else {
            self.run_action_step(index, &step, collab)
        }
    }

    fn run_code_step(
        &mut self,
        index: usize,
        step: &Step,
        collab: &mut Collaborators<'_>,
    ) -> Result<AdvanceOutcome> {
        let (goal, plan_text, total) = match self.plan.as_ref() {
            Some(plan) => (plan.goal.clone(), plan.plan_text.clone(), plan.steps.len()),
            None => bail!("no active plan"),
        };
        let snapshot = self.buffer.clone();

        let mut instruction = format!("Implement: {}.", step.task);
        if let Some(details) = step.details.as_deref().filter(|d| !d.trim().is_empty()) {
            instruction.push_str(&format!(" Details: {details}."));
        }
        let plan_context = PlanContext {
            overall_goal: goal.clone(),
            full_plan_text: plan_text,
            step_description: step.task.clone(),
            step_details: step.details.clone(),
            required_user_input: step.requires_user_input_during_step.clone(),
            screenshot_signal: step.screenshot_signal,
            is_additive: step.additive,
        };
        let request = CodeGenRequest {
            current_code: if step.additive {
                self.buffer.clone()
            } else {
                String::new()
            },
            instruction: instruction.clone(),
            error_feedback: None,
            prior_context: self.prior_context.clone(),
            system_info: self.system_info.clone(),
            plan_context: Some(plan_context.clone()),
            language: self.options.language.clone(),
        };

        let generated = match collab.codegen.generate(&request) {
            Ok(code) => code,
            Err(e) => {
                return Ok(self.fail_step(
                    index,
                    FailureKind::CodeGen,
                    format!("code generation failed: {e:#}"),
                    snapshot,
                ));
            }
        };
        if generated.trim().is_empty() {
            warn!(index, task = %step.task, "no code generated, acknowledging step");
            self.prior_context = format!("Step acknowledged without code: {}", step.task);
            self.advance_index();
            return Ok(AdvanceOutcome::VacuousSuccess { index });
        }

        let provenance = Provenance {
            step: index + 1,
            total,
            task: &step.task,
            goal: &goal,
        };
        let annotated = annotate(&generated, &self.options.comment_prefix, &provenance);
        let target = if step.additive {
            if self.buffer.trim().is_empty() {
                self.buffer = annotated;
            } else {
                self.buffer = format!("{}\n\n{annotated}", self.buffer.trim_end());
            }
            match &self.target {
                Some(target) => target.clone(),
                None => self.artifacts.unique_path(),
            }
        } else {
            self.buffer = annotated;
            self.artifacts.unique_path()
        };
        self.target = Some(target.clone());
        self.artifacts.write(&target, &self.buffer)?;

        let mut outcome = self.execute_buffer(&instruction, &target, &plan_context, collab)?;
        if outcome.was_auto_fixed {
            info!(index, "testing repaired code");
            self.adopt(&outcome, &target)?;
            outcome = self.execute_buffer(&instruction, &target, &plan_context, collab)?;
            if outcome.was_auto_fixed {
                self.adopt(&outcome, &target)?;
            }
        }

        match outcome.status {
            RunStatus::DependencyInstalled(module) => {
                info!(index, module = %module, "dependency installed, step will run again");
                self.buffer = snapshot;
                Ok(AdvanceOutcome::RetryAfterInstall { index, module })
            }
            RunStatus::Succeeded | RunStatus::Exited(_) => {
                self.prior_context = format!("OK step: {} (goal: {goal})", step.task);
                let fallback = step
                    .screenshot_signal
                    .then(|| step.dependencies.as_deref().and_then(dependency_image_path))
                    .flatten();
                let signal = self.signals.dispatch(
                    &outcome.stdout_lines,
                    fallback.as_deref(),
                    target.parent(),
                    collab.analysis,
                );
                self.note_signal(&signal);
                self.advance_index();
                Ok(AdvanceOutcome::StepSucceeded { index, signal })
            }
            RunStatus::NoCode => {
                let snapshot = self.buffer.clone();
                Ok(self.fail_step(
                    index,
                    FailureKind::Runtime,
                    "nothing to execute".to_string(),
                    snapshot,
                ))
            }
            RunStatus::CompileError(msg) => {
                let snapshot = self.buffer.clone();
                Ok(self.fail_step(index, FailureKind::Compile, msg, snapshot))
            }
            RunStatus::RuntimeError(msg) => {
                let snapshot = self.buffer.clone();
                Ok(self.fail_step(index, FailureKind::Runtime, msg, snapshot))
            }
            RunStatus::Interrupted => {
                let snapshot = self.buffer.clone();
                Ok(self.fail_step(
                    index,
                    FailureKind::Interrupted,
                    INTERRUPTED_REASON.to_string(),
                    snapshot,
                ))
            }
        }
    }

    fn run_action_step(
        &mut self,
        index: usize,
        step: &Step,
        collab: &mut Collaborators<'_>,
    ) -> Result<AdvanceOutcome> {
        let action = step.requires_user_action.as_deref();
        match classify(action, step.dependencies.as_deref()) {
            UserAction::None => {
                self.prior_context = format!("OK non-code step: {}", step.task);
                self.advance_index();
                Ok(AdvanceOutcome::StepSucceeded {
                    index,
                    signal: SignalOutcome::NoDispatch,
                })
            }
            UserAction::Analyze { path: Some(path) } => {
                let signal = self.signals.dispatch(
                    &[],
                    Some(path.as_str()),
                    Some(self.artifacts.dir()),
                    collab.analysis,
                );
                let failure = match &signal {
                    SignalOutcome::Dispatched { .. } => None,
                    SignalOutcome::MissingFile(p) => {
                        Some(format!("image analysis failed: {} does not exist", p.display()))
                    }
                    SignalOutcome::Failed { path, reason } => Some(format!(
                        "image analysis failed for {}: {reason}",
                        path.display()
                    )),
                    SignalOutcome::NoDispatch => {
                        Some(format!("image analysis failed: no usable path in {path:?}"))
                    }
                };
                if let Some(reason) = failure {
                    let snapshot = self.buffer.clone();
                    return Ok(self.fail_step(index, FailureKind::Analysis, reason, snapshot));
                }
                self.prior_context = format!("OK non-code step: {}", step.task);
                self.note_signal(&signal);
                self.advance_index();
                Ok(AdvanceOutcome::StepSucceeded { index, signal })
            }
            UserAction::Analyze { path: None } | UserAction::Manual(_) => {
                let action = action.unwrap_or_default();
                let done = collab
                    .operator
                    .confirm(&format!("Action required: {action}\nIs it complete?"))?;
                if !done {
                    info!(index, "plan paused until the operator completes the action");
                    return Ok(AdvanceOutcome::AwaitingOperator { index });
                }
                self.prior_context = format!("OK non-code step: {}", step.task);
                self.advance_index();
                Ok(AdvanceOutcome::StepSucceeded {
                    index,
                    signal: SignalOutcome::NoDispatch,
                })
            }
        }
    }

    fn execute_buffer(
        &self,
        instruction: &str,
        target: &Path,
        plan_context: &PlanContext,
        collab: &mut Collaborators<'_>,
    ) -> Result<ExecutionOutcome> {
        let request = ExecRequest {
            code: &self.buffer,
            fix_instruction: instruction,
            prior_context: &self.prior_context,
            target: Some(target),
            plan_context: Some(plan_context),
        };
        collab
            .executor
            .execute(&request, collab.codegen, &mut *collab.operator)
    }

    fn adopt(&mut self, outcome: &ExecutionOutcome, target: &Path) -> Result<()> {
        self.buffer = outcome.code_after.clone();
        self.artifacts.write(target, &self.buffer)
    }

    fn note_signal(&mut self, signal: &SignalOutcome) {
        if let Some(note) = signal.context_note() {
            self.prior_context.push('\n');
            self.prior_context.push_str(&note);
        }
    }

    fn advance_index(&mut self) {
        if let Some(plan) = self.plan.as_mut() {
            plan.current_index += 1;
        }
    }

    fn fail_step(
        &mut self,
        index: usize,
        kind: FailureKind,
        reason: String,
        code_snapshot: String,
    ) -> AdvanceOutcome {
        warn!(index, kind = ?kind, reason = %reason, "step failed");
        if let Some(plan) = self.plan.as_mut() {
            plan.failure = Some(StepFailure {
                kind,
                reason: reason.clone(),
                code_snapshot,
            });
        }
        AdvanceOutcome::Failed { index, reason }
    }

    /// Apply the operator's decision for the failed step.
    #[instrument(skip_all, fields(decision = ?decision))]
    pub fn recover(&mut self, decision: RecoveryDecision) -> Result<RecoveryOutcome> {
        let Some(plan) = self.plan.as_mut() else {
            bail!("no active plan");
        };
        let Some(failure) = plan.failure.take() else {
            bail!("no failed step awaiting a decision");
        };

        let outcome = match decision {
            RecoveryDecision::Retry => {
                self.buffer = failure.code_snapshot;
                RecoveryOutcome::Retrying
            }
            RecoveryDecision::Modify(task) => {
                let task = task.trim();
                if task.is_empty() {
                    plan.failure = Some(failure);
                    bail!("modified task must be non-empty");
                }
                let Some(step) = plan.steps.get_mut(plan.current_index) else {
                    bail!("failed step index {} is out of range", plan.current_index);
                };
                if step.original_task_if_modified.is_none() {
                    step.original_task_if_modified = Some(step.task.clone());
                }
                step.task = task.to_string();
                if !step.additive {
                    self.buffer.clear();
                }
                RecoveryOutcome::Modified
            }
            RecoveryDecision::Skip => {
                plan.current_index += 1;
                // The skipped step's code must not leak into the next one.
                self.buffer.clear();
                self.target = None;
                if plan.current_index >= plan.steps.len() {
                    info!("plan ended via skip");
                    self.plan = None;
                    RecoveryOutcome::EndedViaSkip
                } else {
                    RecoveryOutcome::Skipped
                }
            }
            RecoveryDecision::Abort => {
                self.reset_for_instruction();
                RecoveryOutcome::Aborted
            }
            RecoveryDecision::NewInstruction(text) => {
                self.reset_for_instruction();
                RecoveryOutcome::NewInstruction(text)
            }
        };
        debug!(outcome = ?outcome, "recovery applied");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::marker::DEFAULT_MARKER;
    use crate::test_support::{
        ScriptedAnalysis, ScriptedCodeGen, ScriptedExecutor, ScriptedOperator,
    };
    use std::fs;

    struct Fixture {
        _temp: tempfile::TempDir,
        dir: PathBuf,
        engine: StepEngine,
    }

    fn fixture(plan_text: &str) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();
        let mut engine = StepEngine::new(
            ArtifactStore::new(&dir, "stepwise", "py", "#"),
            SignalDetector::new(DEFAULT_MARKER),
            EngineOptions {
                comment_prefix: "#".to_string(),
                language: "Python".to_string(),
            },
            SystemInfo::detect(),
        );
        engine.load_plan("build it", plan_text).expect("plan");
        engine.confirm_plan().expect("confirm");
        Fixture {
            _temp: temp,
            dir,
            engine,
        }
    }

    fn advance(
        engine: &mut StepEngine,
        codegen: &ScriptedCodeGen,
        executor: &ScriptedExecutor,
        analysis: &ScriptedAnalysis,
        operator: &mut ScriptedOperator,
    ) -> AdvanceOutcome {
        let mut collab = Collaborators {
            codegen,
            analysis,
            executor,
            operator,
        };
        engine.advance(&mut collab).expect("advance")
    }

    const TWO_STEPS: &str = "1. Task: Create window\n2. Task: Add snake\n   Additive_Code: Yes\n";

    #[test]
    fn additive_step_appends_to_buffer_and_reuses_target() {
        let mut fx = fixture(TWO_STEPS);
        let codegen = ScriptedCodeGen::new().respond("window()").respond("snake()");
        let executor = ScriptedExecutor::new().succeed().succeed();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        let first = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert!(matches!(first, AdvanceOutcome::StepSucceeded { index: 0, .. }));
        let first_target = fx.engine.target().expect("target").to_path_buf();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let buffer = fx.engine.buffer();
        assert!(buffer.starts_with("# stepwise: step 1/2: Create window\n"));
        assert!(buffer.contains("window()\n\n# stepwise: step 2/2: Add snake\n"));
        assert!(buffer.ends_with("snake()"));
        assert_eq!(fx.engine.target(), Some(first_target.as_path()));
        assert_eq!(fs::read_to_string(&first_target).expect("read"), buffer);

        // Additive generation sees the existing buffer.
        let requests = codegen.requests();
        assert!(requests[0].current_code.is_empty());
        assert!(requests[1].current_code.contains("window()"));
        assert_eq!(requests[1].instruction, "Implement: Add snake.");

        let done = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(done, AdvanceOutcome::Completed);
        assert!(fx.engine.plan().is_none());
    }

    #[test]
    fn non_additive_step_replaces_buffer_with_fresh_artifact() {
        let mut fx = fixture("1. Task: First\n2. Task: Second\n   Details: again\n");
        let codegen = ScriptedCodeGen::new().respond("one()").respond("two()");
        let executor = ScriptedExecutor::new().succeed().succeed();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let first_target = fx.engine.target().expect("target").to_path_buf();
        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);

        assert_eq!(
            fx.engine.buffer(),
            "# stepwise: step 2/2: Second\n# stepwise: overall goal: build it\ntwo()"
        );
        assert_ne!(fx.engine.target(), Some(first_target.as_path()));
        assert!(fx.engine.target().expect("target").starts_with(&fx.dir));
        assert_eq!(codegen.requests()[1].instruction, "Implement: Second. Details: again.");
    }

    #[test]
    fn dependency_install_leaves_index_and_failure_untouched() {
        let mut fx = fixture("1. Task: Fetch page\n");
        let codegen = ScriptedCodeGen::new().respond("import requests");
        let executor =
            ScriptedExecutor::new().status(RunStatus::DependencyInstalled("requests".to_string()));
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(
            outcome,
            AdvanceOutcome::RetryAfterInstall {
                index: 0,
                module: "requests".to_string()
            }
        );
        let plan = fx.engine.plan().expect("plan");
        assert_eq!(plan.current_index, 0);
        assert!(plan.failure.is_none());
        assert!(fx.engine.buffer().is_empty());
    }

    #[test]
    fn repaired_code_is_adopted_and_run_once_more() {
        let mut fx = fixture("1. Task: Parse numbers\n");
        let codegen = ScriptedCodeGen::new().respond("int('x')");
        let executor = ScriptedExecutor::new()
            .fail_with_fix("ValueError", "int('1')")
            .succeed();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert!(matches!(outcome, AdvanceOutcome::StepSucceeded { index: 0, .. }));
        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].code.contains("int('x')"));
        assert_eq!(calls[1].code, "int('1')");
        assert_eq!(fx.engine.buffer(), "int('1')");
        let target = fx.engine.target().expect("target");
        assert_eq!(fs::read_to_string(target).expect("read"), "int('1')");
    }

    #[test]
    fn execution_failure_records_snapshot_and_blocks_advance() {
        let mut fx = fixture("1. Task: Crash\n2. Task: Never\n");
        let codegen = ScriptedCodeGen::new().respond("boom()");
        let executor = ScriptedExecutor::new().status(RunStatus::RuntimeError("NameError".into()));
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(
            outcome,
            AdvanceOutcome::Failed {
                index: 0,
                reason: "NameError".to_string()
            }
        );
        let failure = fx.engine.plan().and_then(|p| p.failure.clone()).expect("failure");
        assert_eq!(failure.kind, FailureKind::Runtime);
        assert!(failure.code_snapshot.contains("boom()"));

        // Advancing again does not regenerate while a decision is pending.
        let again = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert!(matches!(again, AdvanceOutcome::Failed { index: 0, .. }));
        assert_eq!(codegen.requests().len(), 1);
    }

    #[test]
    fn codegen_failure_snapshots_prior_buffer() {
        let mut fx = fixture(TWO_STEPS);
        let codegen = ScriptedCodeGen::new().respond("window()").fail("rate limited");
        let executor = ScriptedExecutor::new().succeed();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let before = fx.engine.buffer().to_string();
        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert!(
            matches!(outcome, AdvanceOutcome::Failed { index: 1, ref reason } if reason.starts_with("code generation failed: rate limited"))
        );
        let failure = fx.engine.plan().and_then(|p| p.failure.clone()).expect("failure");
        assert_eq!(failure.kind, FailureKind::CodeGen);
        assert_eq!(failure.code_snapshot, before);

        assert_eq!(
            fx.engine.recover(RecoveryDecision::Retry).expect("retry"),
            RecoveryOutcome::Retrying
        );
        assert_eq!(fx.engine.buffer(), before);
        assert!(!fx.engine.awaiting_decision());
    }

    #[test]
    fn interrupt_becomes_step_failure() {
        let mut fx = fixture("1. Task: Loop forever\n");
        let codegen = ScriptedCodeGen::new().respond("while True: pass");
        let executor = ScriptedExecutor::new().status(RunStatus::Interrupted);
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(
            outcome,
            AdvanceOutcome::Failed {
                index: 0,
                reason: INTERRUPTED_REASON.to_string()
            }
        );
        let failure = fx.engine.plan().and_then(|p| p.failure.clone()).expect("failure");
        assert_eq!(failure.kind, FailureKind::Interrupted);
    }

    #[test]
    fn empty_generation_is_vacuous_success() {
        let mut fx = fixture("1. Task: Nothing to do\n");
        let codegen = ScriptedCodeGen::new().respond("  \n");
        let executor = ScriptedExecutor::new();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(outcome, AdvanceOutcome::VacuousSuccess { index: 0 });
        assert!(executor.calls().is_empty());
        assert!(fx.engine.buffer().is_empty());
        assert_eq!(
            fx.engine.prior_context(),
            "Step acknowledged without code: Nothing to do"
        );
    }

    #[test]
    fn skip_moves_exactly_one_step_and_ends_plan_at_the_end() {
        let mut fx = fixture("1. Task: A\n2. Task: B\n");
        let codegen = ScriptedCodeGen::new().respond("a()").respond("b()");
        let executor = ScriptedExecutor::new()
            .status(RunStatus::RuntimeError("a".into()))
            .status(RunStatus::RuntimeError("b".into()));
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(
            fx.engine.recover(RecoveryDecision::Skip).expect("skip"),
            RecoveryOutcome::Skipped
        );
        let plan = fx.engine.plan().expect("plan");
        assert_eq!(plan.current_index, 1);
        assert!(plan.failure.is_none());

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(
            fx.engine.recover(RecoveryDecision::Skip).expect("skip"),
            RecoveryOutcome::EndedViaSkip
        );
        assert!(fx.engine.plan().is_none());
    }

    #[test]
    fn skipped_code_does_not_reach_the_next_additive_step() {
        let mut fx = fixture("1. Task: Broken\n2. Task: Extend\n   Additive_Code: Yes\n");
        let codegen = ScriptedCodeGen::new().respond("broken()").respond("extend()");
        let executor = ScriptedExecutor::new()
            .status(RunStatus::RuntimeError("NameError".into()))
            .succeed();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let failed_target = fx.engine.target().expect("target").to_path_buf();
        assert_eq!(
            fx.engine.recover(RecoveryDecision::Skip).expect("skip"),
            RecoveryOutcome::Skipped
        );
        assert!(fx.engine.buffer().is_empty());
        assert!(fx.engine.target().is_none());

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert!(matches!(outcome, AdvanceOutcome::StepSucceeded { index: 1, .. }));
        assert!(codegen.requests()[1].current_code.is_empty());
        let calls = executor.calls();
        assert!(!calls[1].code.contains("broken()"));
        assert!(calls[1].code.ends_with("extend()"));
        assert_ne!(fx.engine.target(), Some(failed_target.as_path()));
    }

    #[test]
    fn abort_clears_plan_and_buffer() {
        let mut fx = fixture("1. Task: A\n");
        let codegen = ScriptedCodeGen::new().respond("a()");
        let executor = ScriptedExecutor::new().status(RunStatus::CompileError("syntax".into()));
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(
            fx.engine.plan().and_then(|p| p.failure.as_ref()).map(|f| f.kind),
            Some(FailureKind::Compile)
        );
        assert_eq!(
            fx.engine.recover(RecoveryDecision::Abort).expect("abort"),
            RecoveryOutcome::Aborted
        );
        assert!(fx.engine.plan().is_none());
        assert!(fx.engine.buffer().is_empty());
        assert!(fx.engine.recover(RecoveryDecision::Retry).is_err());
    }

    #[test]
    fn modify_records_original_task_and_clears_non_additive_buffer() {
        let mut fx = fixture("1. Task: Draw circle\n");
        let codegen = ScriptedCodeGen::new().respond("circle()").respond("square()");
        let executor = ScriptedExecutor::new()
            .status(RunStatus::RuntimeError("bad".into()))
            .succeed();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let outcome = fx
            .engine
            .recover(RecoveryDecision::Modify("Draw square".to_string()))
            .expect("modify");
        assert_eq!(outcome, RecoveryOutcome::Modified);
        assert!(fx.engine.buffer().is_empty());
        let step = fx.engine.plan().and_then(|p| p.current_step().cloned()).expect("step");
        assert_eq!(step.task, "Draw square");
        assert_eq!(step.original_task_if_modified.as_deref(), Some("Draw circle"));

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(codegen.requests()[1].instruction, "Implement: Draw square.");
    }

    #[test]
    fn modify_keeps_buffer_for_additive_step() {
        let mut fx = fixture("1. Task: Base\n2. Task: Add menu\n   Additive_Code: Yes\n");
        let codegen = ScriptedCodeGen::new()
            .respond("base()")
            .respond("menu()")
            .respond("toolbar()");
        let executor = ScriptedExecutor::new()
            .succeed()
            .status(RunStatus::RuntimeError("bad menu".into()))
            .succeed();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let after_base = fx.engine.buffer().to_string();
        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let with_failed_menu = fx.engine.buffer().to_string();
        assert!(with_failed_menu.contains("menu()"));

        let outcome = fx
            .engine
            .recover(RecoveryDecision::Modify("Add toolbar".to_string()))
            .expect("modify");
        assert_eq!(outcome, RecoveryOutcome::Modified);
        assert_eq!(fx.engine.buffer(), with_failed_menu);

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let request = &codegen.requests()[2];
        assert_eq!(request.instruction, "Implement: Add toolbar.");
        assert!(request.current_code.starts_with(after_base.as_str()));
    }

    #[test]
    fn new_instruction_discards_plan() {
        let mut fx = fixture("1. Task: A\n");
        let codegen = ScriptedCodeGen::new().fail("down");
        let executor = ScriptedExecutor::new();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        let outcome = fx
            .engine
            .recover(RecoveryDecision::NewInstruction("something else".to_string()))
            .expect("recover");
        assert_eq!(outcome, RecoveryOutcome::NewInstruction("something else".to_string()));
        assert!(fx.engine.plan().is_none());
    }

    #[test]
    fn declined_manual_action_pauses_without_failure() {
        let mut fx = fixture(
            "1. Task: Plug in camera\n   Requires_Code_Gen: No\n   Requires_User_Action: Plug in the USB camera\n",
        );
        let codegen = ScriptedCodeGen::new();
        let executor = ScriptedExecutor::new();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new().then_confirm(false).then_confirm(true);

        let paused = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(paused, AdvanceOutcome::AwaitingOperator { index: 0 });
        let plan = fx.engine.plan().expect("plan");
        assert_eq!(plan.current_index, 0);
        assert!(plan.failure.is_none());
        assert!(operator.prompts()[0].contains("Plug in the USB camera"));

        let resumed = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert!(matches!(resumed, AdvanceOutcome::StepSucceeded { index: 0, .. }));
        assert!(codegen.requests().is_empty());
    }

    #[test]
    fn analysis_step_describes_named_image() {
        let mut fx = fixture(
            "1. Task: Look at the screenshot\n   Dependencies: Path to shot.png from step 1\n   Requires_Code_Gen: No\n   Requires_User_Action: The agent will describe the image at <path>\n",
        );
        fs::write(fx.dir.join("shot.png"), b"png").expect("write");
        let codegen = ScriptedCodeGen::new();
        let executor = ScriptedExecutor::new();
        let analysis = ScriptedAnalysis::new().answer("a login form");
        let mut operator = ScriptedOperator::new();

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert!(matches!(
            outcome,
            AdvanceOutcome::StepSucceeded { signal: SignalOutcome::Dispatched { .. }, .. }
        ));
        assert_eq!(analysis.requests()[0].image_path, fx.dir.join("shot.png"));
        assert!(fx.engine.prior_context().contains("AI image description: a login form"));
        assert!(operator.prompts().is_empty());
    }

    #[test]
    fn analysis_step_with_missing_image_fails() {
        let mut fx = fixture(
            "1. Task: Look\n   Requires_Code_Gen: No\n   Requires_User_Action: Describe the image at /nonexistent/shot.png\n",
        );
        let codegen = ScriptedCodeGen::new();
        let executor = ScriptedExecutor::new();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert!(matches!(outcome, AdvanceOutcome::Failed { index: 0, ref reason } if reason.contains("does not exist")));
        let failure = fx.engine.plan().and_then(|p| p.failure.clone()).expect("failure");
        assert_eq!(failure.kind, FailureKind::Analysis);
        assert!(analysis.requests().is_empty());
    }

    #[test]
    fn marker_in_stdout_dispatches_analysis_after_success() {
        let mut fx = fixture("1. Task: Take screenshot\n   Screenshot_Analysis_Signal: Yes\n");
        let shot = fx.dir.join("shot.png");
        fs::write(&shot, b"png").expect("write");
        let marker_line = format!("{DEFAULT_MARKER} {}", shot.display());
        let codegen = ScriptedCodeGen::new().respond("grab()");
        let executor = ScriptedExecutor::new().succeed_with_output(&["saved", &marker_line]);
        let analysis = ScriptedAnalysis::new().answer("desktop");
        let mut operator = ScriptedOperator::new();

        let outcome = advance(&mut fx.engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(
            outcome,
            AdvanceOutcome::StepSucceeded {
                index: 0,
                signal: SignalOutcome::Dispatched {
                    path: shot,
                    description: "desktop".to_string()
                }
            }
        );
        assert_eq!(analysis.requests().len(), 1);
    }

    #[test]
    fn unparseable_plan_is_a_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut engine = StepEngine::new(
            ArtifactStore::new(temp.path(), "stepwise", "py", "#"),
            SignalDetector::new(DEFAULT_MARKER),
            EngineOptions {
                comment_prefix: "#".to_string(),
                language: "Python".to_string(),
            },
            SystemInfo::detect(),
        );
        let err = engine.load_plan("goal", "   \n").unwrap_err();
        assert!(err.downcast_ref::<ParseFailure>().is_some());
        assert!(engine.plan().is_none());
    }

    #[test]
    fn unconfirmed_plan_does_not_advance() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut engine = StepEngine::new(
            ArtifactStore::new(temp.path(), "stepwise", "py", "#"),
            SignalDetector::new(DEFAULT_MARKER),
            EngineOptions {
                comment_prefix: "#".to_string(),
                language: "Python".to_string(),
            },
            SystemInfo::detect(),
        );
        engine.load_plan("goal", "1. Task: A").expect("plan");
        let codegen = ScriptedCodeGen::new();
        let executor = ScriptedExecutor::new();
        let analysis = ScriptedAnalysis::new();
        let mut operator = ScriptedOperator::new();
        let outcome = advance(&mut engine, &codegen, &executor, &analysis, &mut operator);
        assert_eq!(outcome, AdvanceOutcome::Idle);
        assert!(codegen.requests().is_empty());
    }
}
