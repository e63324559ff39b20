//! Interactive session: instructions, planning, and console commands.
//!
//! A line typed at the prompt is either a command (`help`, `run`, `start`, ...)
//! or a new instruction. Instructions are planned, shown to the operator for
//! confirmation, and then executed step by step through the [`StepEngine`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::core::dependency::MissingDependency;
use crate::core::provenance::annotate_task;
use crate::core::types::{FailureKind, RunStatus};
use crate::engine::{
    AdvanceOutcome, Collaborators, EngineOptions, ParseFailure, PlanState, RecoveryDecision,
    RecoveryOutcome, StepEngine,
};
use crate::executor::{ExecRequest, Execute, ScriptExecutor};
use crate::io::artifacts::ArtifactStore;
use crate::io::collaborator::{Analysis, CodeGen, CommandCollaborator, PlanRequest, Planner};
use crate::io::config::StepwiseConfig;
use crate::io::installer::DependencyResolver;
use crate::io::interrupt::Interrupt;
use crate::io::operator::{ConsoleOperator, Operator, PromptInput};
use crate::io::supervisor::{ProcessSupervisor, StopOutcome, SupervisorError};
use crate::io::system::SystemInfo;
use crate::signal::{SignalDetector, SignalOutcome, describe_file};

const HELP: &str = "\
Commands:
  help               show this help
  run                run the current code buffer
  start [path]       start a script in the background (default: current artifact)
  stop               stop the background script
  status             show background script and plan status
  show               print the current code buffer
  clear              clear the code buffer
  continue           resume a paused plan or decide on a failed step
  describe <image>   describe an image file
  sysinfo            show host information
  quit | exit | q    leave
Anything else is treated as a new instruction.";

const RECOVERY_PROMPT: &str =
    "[r]etry, [m]odify the step, [s]kip it, [a]bort the plan, or type a new instruction";

/// Whether the REPL keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// External services used by a session.
pub struct Services {
    pub codegen: Box<dyn CodeGen>,
    pub planner: Box<dyn Planner>,
    pub analysis: Box<dyn Analysis>,
    pub executor: Box<dyn Execute>,
}

/// What to do after a recovery prompt.
enum Resume {
    Continue,
    Stop,
    Instruction(String),
}

/// Operator answer at the recovery prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Choice {
    Retry,
    Modify,
    Skip,
    Abort,
    Instruction(String),
    Deferred,
}

fn parse_choice(answer: &str) -> Choice {
    let answer = answer.trim();
    match answer.to_ascii_lowercase().as_str() {
        "" => Choice::Deferred,
        "r" | "retry" => Choice::Retry,
        "m" | "modify" => Choice::Modify,
        "s" | "skip" => Choice::Skip,
        "a" | "abort" => Choice::Abort,
        _ => Choice::Instruction(answer.to_string()),
    }
}

pub struct Session {
    engine: StepEngine,
    services: Services,
    supervisor: ProcessSupervisor,
    recent_limit: usize,
}

impl Session {
    pub fn new(
        engine: StepEngine,
        services: Services,
        supervisor: ProcessSupervisor,
        recent_limit: usize,
    ) -> Self {
        Self {
            engine,
            services,
            supervisor,
            recent_limit,
        }
    }

    /// Wire up a session from configuration, with artifacts under `workdir`.
    pub fn from_config(cfg: &StepwiseConfig, workdir: &Path, interrupt: Interrupt) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.collaborators.timeout_secs);
        let limit = cfg.collaborators.output_limit_bytes;
        let language = cfg.script.language.as_str();
        let collaborator = |argv: &[String]| {
            CommandCollaborator::new(argv.to_vec(), timeout, limit, &cfg.marker, language)
        };

        let resolver = DependencyResolver::new(
            MissingDependency::new(&cfg.dependencies.pattern)?,
            cfg.dependencies.installer.clone(),
            Duration::from_secs(cfg.dependencies.timeout_secs),
        );
        let executor = ScriptExecutor::new(
            cfg.script.interpreter.clone(),
            cfg.script.env.clone(),
            language,
            resolver,
            interrupt,
        )?;
        let services = Services {
            codegen: Box::new(collaborator(&cfg.collaborators.codegen).context("codegen")?),
            planner: Box::new(collaborator(&cfg.collaborators.planner).context("planner")?),
            analysis: Box::new(collaborator(&cfg.collaborators.analysis).context("analysis")?),
            executor: Box::new(executor),
        };

        let engine = StepEngine::new(
            ArtifactStore::new(
                workdir.join(&cfg.artifact_dir),
                &cfg.artifact_prefix,
                &cfg.script.extension,
                &cfg.script.comment_prefix,
            ),
            SignalDetector::new(&cfg.marker),
            EngineOptions {
                comment_prefix: cfg.script.comment_prefix.clone(),
                language: language.to_string(),
            },
            SystemInfo::detect(),
        );
        let supervisor = ProcessSupervisor::new(
            cfg.script.interpreter.clone(),
            cfg.script.env.clone(),
            Duration::from_secs(cfg.supervisor.stop_grace_secs),
        );
        Ok(Self::new(engine, services, supervisor, cfg.recent_artifacts))
    }

    pub fn engine(&self) -> &StepEngine {
        &self.engine
    }

    /// Handle one line of input.
    ///
    /// Errors inside a running step are recorded as an internal failure of
    /// that step and handed to the operator; the session keeps going.
    pub fn handle_line(&mut self, line: &str, operator: &mut dyn Operator) -> Result<Flow> {
        match self.dispatch(line, operator) {
            Ok(flow) => Ok(flow),
            Err(e) => {
                error!(err = %format!("{e:#}"), "command failed");
                eprintln!("Error: {e:#}");
                if self
                    .engine
                    .fail_current(FailureKind::Internal, format!("internal error: {e:#}"))
                {
                    self.decide_and_resume(operator)?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn dispatch(&mut self, line: &str, operator: &mut dyn Operator) -> Result<Flow> {
        let line = line.trim();
        let (command, arg) = match line.split_once(char::is_whitespace) {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };

        match command.to_ascii_lowercase().as_str() {
            "" => {}
            "quit" | "exit" | "q" => return Ok(Flow::Quit),
            "help" => println!("{HELP}"),
            "run" => self.run_buffer(operator)?,
            "start" => self.start(arg)?,
            "stop" => self.stop()?,
            "status" => self.status()?,
            "show" => self.show(),
            "clear" => {
                self.engine.clear_buffer();
                println!("Code buffer cleared.");
            }
            "continue" => self.resume(operator)?,
            "describe" if !arg.is_empty() => self.describe(arg),
            "describe" => println!("Usage: describe <image path>"),
            "sysinfo" => println!("{}", self.engine.system_info()),
            _ => self.instruct(line, operator)?,
        }
        Ok(Flow::Continue)
    }

    /// Plan an instruction and, once confirmed, run it.
    #[instrument(skip_all)]
    pub fn instruct(&mut self, instruction: &str, operator: &mut dyn Operator) -> Result<()> {
        let mut instruction = instruction.to_string();
        loop {
            match self.plan_and_run(&instruction, operator)? {
                Some(next) => instruction = next,
                None => return Ok(()),
            }
        }
    }

    /// Returns a follow-up instruction given at a recovery prompt.
    fn plan_and_run(
        &mut self,
        instruction: &str,
        operator: &mut dyn Operator,
    ) -> Result<Option<String>> {
        self.engine.reset_for_instruction();

        let recent_artifacts = self
            .engine
            .artifacts()
            .recent_summaries(self.recent_limit)
            .unwrap_or_else(|e| {
                warn!(err = %e, "could not list recent artifacts");
                Vec::new()
            });
        let request = PlanRequest {
            instruction: instruction.to_string(),
            system_info: self.engine.system_info().clone(),
            recent_artifacts,
        };

        println!("Planning...");
        let plan_text = match self.services.planner.plan(&request) {
            Ok(text) => text,
            Err(e) => {
                println!("Planning failed: {e:#}");
                return Ok(None);
            }
        };
        match self.engine.load_plan(instruction, &plan_text) {
            Ok(plan) => print_plan(plan),
            Err(e) if e.downcast_ref::<ParseFailure>().is_some() => {
                println!("Could not parse a plan from the response:\n{plan_text}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        if !operator.confirm("Proceed with this plan?")? {
            self.engine.discard_plan();
            println!("Plan discarded.");
            return Ok(None);
        }
        self.engine.confirm_plan()?;
        info!(goal = instruction, "plan confirmed");
        self.run_plan(operator)
    }

    /// Advance until the plan completes, pauses, or the operator stops it.
    fn run_plan(&mut self, operator: &mut dyn Operator) -> Result<Option<String>> {
        loop {
            if let Some(plan) = self.engine.plan()
                && plan.failure.is_none()
                && let Some(step) = plan.current_step()
            {
                println!(
                    "\n--- Step {}/{}: {}{}",
                    plan.current_index + 1,
                    plan.steps.len(),
                    step.task,
                    if step.additive { " (additive)" } else { "" }
                );
            }

            let outcome = {
                let mut collab = Collaborators {
                    codegen: self.services.codegen.as_ref(),
                    analysis: self.services.analysis.as_ref(),
                    executor: self.services.executor.as_ref(),
                    operator: &mut *operator,
                };
                self.engine.advance(&mut collab)?
            };

            match outcome {
                AdvanceOutcome::Idle => return Ok(None),
                AdvanceOutcome::Completed => {
                    println!("\nPlan complete.");
                    return Ok(None);
                }
                AdvanceOutcome::StepSucceeded { index, signal } => {
                    println!("Step {} done.", index + 1);
                    print_signal(&signal);
                }
                AdvanceOutcome::VacuousSuccess { index } => {
                    println!("Step {} produced no code; treating it as done.", index + 1);
                }
                AdvanceOutcome::RetryAfterInstall { module, .. } => {
                    println!("Installed {module}; running the step again.");
                }
                AdvanceOutcome::Failed { index, reason } => {
                    println!("Step {} failed: {reason}", index + 1);
                    match self.decide(operator)? {
                        Resume::Continue => {}
                        Resume::Stop => return Ok(None),
                        Resume::Instruction(text) => return Ok(Some(text)),
                    }
                }
                AdvanceOutcome::AwaitingOperator { index } => {
                    println!(
                        "Paused at step {}. Type `continue` once the action is done.",
                        index + 1
                    );
                    return Ok(None);
                }
            }
        }
    }

    /// Ask for and apply a recovery decision for the failed step.
    fn decide(&mut self, operator: &mut dyn Operator) -> Result<Resume> {
        let choice = match operator.ask(RECOVERY_PROMPT)? {
            Some(answer) => parse_choice(&answer),
            None => Choice::Deferred,
        };
        let decision = match choice {
            Choice::Retry => RecoveryDecision::Retry,
            Choice::Skip => RecoveryDecision::Skip,
            Choice::Abort => RecoveryDecision::Abort,
            Choice::Instruction(text) => RecoveryDecision::NewInstruction(text),
            Choice::Modify => match operator.ask("New description for this step")? {
                Some(task) if !task.trim().is_empty() => RecoveryDecision::Modify(task),
                _ => return Ok(defer()),
            },
            Choice::Deferred => return Ok(defer()),
        };

        Ok(match self.engine.recover(decision)? {
            RecoveryOutcome::Retrying | RecoveryOutcome::Modified | RecoveryOutcome::Skipped => {
                Resume::Continue
            }
            RecoveryOutcome::EndedViaSkip => {
                println!("Skipped the last step; plan ended.");
                Resume::Stop
            }
            RecoveryOutcome::Aborted => {
                println!("Plan aborted.");
                Resume::Stop
            }
            RecoveryOutcome::NewInstruction(text) => Resume::Instruction(text),
        })
    }

    fn decide_and_resume(&mut self, operator: &mut dyn Operator) -> Result<()> {
        match self.decide(operator)? {
            Resume::Continue => self.continue_plan(operator),
            Resume::Stop => Ok(()),
            Resume::Instruction(text) => self.instruct(&text, operator),
        }
    }

    fn continue_plan(&mut self, operator: &mut dyn Operator) -> Result<()> {
        if let Some(next) = self.run_plan(operator)? {
            self.instruct(&next, operator)?;
        }
        Ok(())
    }

    fn resume(&mut self, operator: &mut dyn Operator) -> Result<()> {
        match self.engine.plan() {
            None => println!("No active plan."),
            Some(plan) if !plan.confirmed => println!("The plan has not been confirmed."),
            Some(plan) if plan.failure.is_some() => {
                if let Some(failure) = &plan.failure {
                    println!(
                        "Step {} failed: {}",
                        plan.current_index + 1,
                        failure.reason
                    );
                }
                self.decide_and_resume(operator)?;
            }
            Some(_) => self.continue_plan(operator)?,
        }
        Ok(())
    }

    /// Run the code buffer outside the plan.
    fn run_buffer(&mut self, operator: &mut dyn Operator) -> Result<()> {
        if self.engine.buffer().trim().is_empty() {
            println!("No code to run.");
            return Ok(());
        }
        let target = match self.engine.target() {
            Some(path) => path.to_path_buf(),
            None => self.engine.artifacts().unique_path(),
        };
        let code = annotate_task(
            self.engine.buffer(),
            &self.engine.options().comment_prefix,
            "manual run",
        );
        let prior_context = self.engine.prior_context().to_string();
        let request = ExecRequest {
            code: &code,
            fix_instruction: "Make the current script run without errors.",
            prior_context: &prior_context,
            target: Some(target.as_path()),
            plan_context: None,
        };
        let outcome =
            self.services
                .executor
                .execute(&request, self.services.codegen.as_ref(), operator)?;

        self.engine
            .set_buffer(outcome.code_after.clone(), Some(target.clone()));
        if outcome.was_auto_fixed {
            println!("The buffer now holds the repaired code; `run` again to test it.");
        }
        match outcome.status {
            RunStatus::Succeeded | RunStatus::Exited(_) => {
                self.engine
                    .record_success(format!("OK manual run: {}", target.display()));
                let signal = self.engine.signals().dispatch(
                    &outcome.stdout_lines,
                    None,
                    target.parent(),
                    self.services.analysis.as_ref(),
                );
                print_signal(&signal);
            }
            RunStatus::DependencyInstalled(module) => {
                println!("Installed {module}; `run` again.");
            }
            RunStatus::NoCode => println!("No code to run."),
            RunStatus::Interrupted => println!("Run interrupted."),
            RunStatus::CompileError(msg) | RunStatus::RuntimeError(msg) => {
                println!("Run failed: {msg}");
            }
        }
        Ok(())
    }

    fn start(&mut self, arg: &str) -> Result<()> {
        let path = if arg.is_empty() {
            self.engine.target().map(Path::to_path_buf)
        } else {
            Some(PathBuf::from(arg))
        };
        let Some(path) = path else {
            println!("No script to start; give a path or run a step first.");
            return Ok(());
        };
        match self.supervisor.start(&path) {
            Ok(pid) => println!("Started {} (pid {pid}).", path.display()),
            Err(e) => match e.downcast_ref::<SupervisorError>() {
                Some(refusal) => println!("{refusal}"),
                None => return Err(e),
            },
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let message = match self.supervisor.stop()? {
            StopOutcome::NothingTracked => "No background process to stop.".to_string(),
            StopOutcome::AlreadyExited(Some(code)) => {
                format!("Background process had already exited with code {code}.")
            }
            StopOutcome::AlreadyExited(None) => "Background process had already exited.".to_string(),
            StopOutcome::Terminated => "Background process stopped.".to_string(),
            StopOutcome::Killed => "Background process killed after the grace period.".to_string(),
        };
        println!("{message}");
        Ok(())
    }

    fn status(&mut self) -> Result<()> {
        println!("Background: {}", self.supervisor.status()?);
        match self.engine.plan() {
            None => println!("Plan: none"),
            Some(plan) => {
                let state = if plan.failure.is_some() {
                    "failed, awaiting decision"
                } else if plan.confirmed {
                    "running"
                } else {
                    "awaiting confirmation"
                };
                println!(
                    "Plan: {} (step {}/{}, {state})",
                    plan.goal,
                    (plan.current_index + 1).min(plan.steps.len()),
                    plan.steps.len()
                );
            }
        }
        Ok(())
    }

    fn show(&self) {
        if self.engine.buffer().trim().is_empty() {
            println!("Code buffer is empty.");
            return;
        }
        if let Some(target) = self.engine.target() {
            println!("# {}", target.display());
        }
        println!("{}", self.engine.buffer());
    }

    fn describe(&self, path: &str) {
        match describe_file(Path::new(path), self.services.analysis.as_ref()) {
            SignalOutcome::Dispatched { description, .. } => println!("{description}"),
            other => print_signal(&other),
        }
    }

    /// Stop any background process before leaving.
    pub fn shutdown(&mut self) -> Result<()> {
        self.supervisor.stop()?;
        Ok(())
    }
}

fn defer() -> Resume {
    println!("Decision deferred; type `continue` to decide.");
    Resume::Stop
}

fn print_plan(plan: &PlanState) {
    println!("\nPlan for: {}", plan.goal);
    for (i, step) in plan.steps.iter().enumerate() {
        let mut tags = Vec::new();
        if !step.requires_code_gen {
            tags.push("no code");
        }
        if step.additive {
            tags.push("additive");
        }
        if step.screenshot_signal {
            tags.push("image analysis");
        }
        if tags.is_empty() {
            println!("  {}. {}", i + 1, step.task);
        } else {
            println!("  {}. {} [{}]", i + 1, step.task, tags.join(", "));
        }
        if let Some(action) = &step.requires_user_action {
            println!("     action: {action}");
        }
    }
}

fn print_signal(signal: &SignalOutcome) {
    match signal {
        SignalOutcome::NoDispatch => {}
        SignalOutcome::Dispatched { path, description } => {
            println!("Image {}:\n{description}", path.display());
        }
        SignalOutcome::MissingFile(path) => {
            println!("Signalled image {} does not exist.", path.display());
        }
        SignalOutcome::Failed { path, reason } => {
            println!("Could not describe {}: {reason}", path.display());
        }
    }
}

/// Read lines from the console until the operator quits.
pub fn run_repl(session: &mut Session, console: &mut ConsoleOperator) -> Result<()> {
    println!("stepwise: type an instruction, or `help` for commands.");
    loop {
        let line = match console.read_line("stepwise> ")? {
            PromptInput::Line(line) => line,
            PromptInput::Cancelled => continue,
            PromptInput::Closed => break,
        };
        if session.handle_line(&line, console)? == Flow::Quit {
            break;
        }
    }
    session.shutdown()
}
