//! Executes one code buffer and classifies the result.
//!
//! The [`Execute`] trait decouples the step engine from how code is run. The
//! [`ScriptExecutor`] has two modes:
//!
//! - **file mode** (a target path is given): the code is written to the
//!   target and run by the configured interpreter, with stdout/stderr echoed
//!   live and captured line by line.
//! - **in-process mode** (no target): the code is a WebAssembly text module
//!   run in the [`Sandbox`].
//!
//! Every failure goes to the dependency resolver first (file mode), then to at
//! most one repair round. A repair is returned, never executed here.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ExecutionOutcome, RunStatus};
use crate::io::collaborator::{CodeGen, CodeGenRequest, PlanContext};
use crate::io::installer::{DependencyResolver, InstallOutcome};
use crate::io::interrupt::Interrupt;
use crate::io::operator::Operator;
use crate::io::process::run_command_streaming;
use crate::io::sandbox::Sandbox;
use crate::io::system::SystemInfo;

/// Language name used when asking for in-process code.
pub const WAT_LANGUAGE: &str = "WebAssembly text format (a single `(module ...)` exporting `_start`, importing only env.print(ptr i32, len i32), env.print_i64, env.print_f64, env.exit(i32), env.now_ms, env.random, env.sleep_ms(i64), and exporting `memory` if it prints strings)";

/// Parameters for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    pub code: &'a str,
    /// Instruction the code was written for, repeated to the repair round.
    pub fix_instruction: &'a str,
    pub prior_context: &'a str,
    /// Artifact path for file mode. `None` selects in-process mode.
    pub target: Option<&'a Path>,
    pub plan_context: Option<&'a PlanContext>,
}

/// Abstraction over code execution backends.
pub trait Execute {
    fn execute(
        &self,
        request: &ExecRequest<'_>,
        codegen: &dyn CodeGen,
        operator: &mut dyn Operator,
    ) -> Result<ExecutionOutcome>;
}

/// Dual-mode executor for generated scripts.
pub struct ScriptExecutor {
    interpreter: Vec<String>,
    env: Vec<(String, String)>,
    language: String,
    resolver: DependencyResolver,
    sandbox: Sandbox,
    interrupt: Interrupt,
    system_info: SystemInfo,
}

impl ScriptExecutor {
    pub fn new(
        interpreter: Vec<String>,
        env: impl IntoIterator<Item = (String, String)>,
        language: impl Into<String>,
        resolver: DependencyResolver,
        interrupt: Interrupt,
    ) -> Result<Self> {
        let sandbox = Sandbox::new(interrupt.clone())?;
        Ok(Self {
            interpreter,
            env: env.into_iter().collect(),
            language: language.into(),
            resolver,
            sandbox,
            interrupt,
            system_info: SystemInfo::detect(),
        })
    }

    fn run_file(
        &self,
        request: &ExecRequest<'_>,
        target: &Path,
        codegen: &dyn CodeGen,
        operator: &mut dyn Operator,
    ) -> Result<ExecutionOutcome> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir {}", parent.display()))?;
        }
        fs::write(target, request.code)
            .with_context(|| format!("write script {}", target.display()))?;

        let (program, args) = self
            .interpreter
            .split_first()
            .context("interpreter command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(target)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        // A stale interrupt from an earlier prompt must not cancel this run.
        self.interrupt.take();
        info!(target = %target.display(), "running script");
        let streamed = match run_command_streaming(cmd) {
            Ok(streamed) => streamed,
            Err(e) => {
                warn!(err = %e, "script could not be started");
                let error = format!("{e:#}");
                return Ok(self.repair(
                    request,
                    RunStatus::RuntimeError(error.clone()),
                    &error,
                    Vec::new(),
                    codegen,
                ));
            }
        };

        if self.interrupt.take() {
            warn!("script interrupted by operator");
            return Ok(ExecutionOutcome::unchanged(
                request.code,
                RunStatus::Interrupted,
                streamed.stdout_lines,
            ));
        }
        if streamed.status.success() {
            return Ok(ExecutionOutcome::unchanged(
                request.code,
                RunStatus::Succeeded,
                streamed.stdout_lines,
            ));
        }

        let stderr = streamed.stderr_lines.join("\n");
        let mut error = if stderr.trim().is_empty() {
            format!("script exited with status {:?}", streamed.status.code())
        } else {
            stderr.clone()
        };
        info!(exit_code = ?streamed.status.code(), "script failed");

        let install = self.resolver.resolve(&stderr, operator)?;
        if let InstallOutcome::Installed(module) = install {
            return Ok(ExecutionOutcome::unchanged(
                request.code,
                RunStatus::DependencyInstalled(module),
                streamed.stdout_lines,
            ));
        }
        if let Some(note) = install.repair_note() {
            error.push_str("\n\n");
            error.push_str(&note);
        }

        Ok(self.repair(
            request,
            RunStatus::RuntimeError(error.clone()),
            &error,
            streamed.stdout_lines,
            codegen,
        ))
    }

    fn run_in_process(
        &self,
        request: &ExecRequest<'_>,
        codegen: &dyn CodeGen,
    ) -> Result<ExecutionOutcome> {
        self.interrupt.take();
        let run = self.sandbox.run(request.code)?;
        match run.status.error_for_collaborator().map(str::to_string) {
            Some(error) => Ok(self.repair(request, run.status, &error, run.stdout_lines, codegen)),
            None => Ok(ExecutionOutcome::unchanged(
                request.code,
                run.status,
                run.stdout_lines,
            )),
        }
    }

    /// One repair round. The status of the failed run is kept either way.
    fn repair(
        &self,
        request: &ExecRequest<'_>,
        status: RunStatus,
        error: &str,
        stdout_lines: Vec<String>,
        codegen: &dyn CodeGen,
    ) -> ExecutionOutcome {
        let language = match request.target {
            Some(_) => self.language.clone(),
            None => WAT_LANGUAGE.to_string(),
        };
        let plan_context = request.plan_context.map(|ctx| PlanContext {
            is_additive: false,
            ..ctx.clone()
        });
        let fix = CodeGenRequest {
            current_code: request.code.to_string(),
            instruction: request.fix_instruction.to_string(),
            error_feedback: Some(error.to_string()),
            prior_context: request.prior_context.to_string(),
            system_info: self.system_info.clone(),
            plan_context,
            language,
        };

        println!("Attempting an automatic fix...");
        match codegen.generate(&fix) {
            Ok(code) if !code.trim().is_empty() && code.trim() != request.code.trim() => {
                info!(bytes = code.len(), "repair produced new code");
                ExecutionOutcome {
                    code_after: code,
                    was_auto_fixed: true,
                    status,
                    stdout_lines,
                }
            }
            Ok(_) => {
                debug!("repair returned no change");
                ExecutionOutcome::unchanged(request.code, status, stdout_lines)
            }
            Err(e) => {
                warn!(err = %e, "repair round failed");
                ExecutionOutcome::unchanged(request.code, status, stdout_lines)
            }
        }
    }
}

impl Execute for ScriptExecutor {
    #[instrument(skip_all, fields(in_process = request.target.is_none()))]
    fn execute(
        &self,
        request: &ExecRequest<'_>,
        codegen: &dyn CodeGen,
        operator: &mut dyn Operator,
    ) -> Result<ExecutionOutcome> {
        if request.code.trim().is_empty() {
            debug!("nothing to execute");
            return Ok(ExecutionOutcome::unchanged(
                request.code,
                RunStatus::NoCode,
                Vec::new(),
            ));
        }
        match request.target {
            Some(target) => self.run_file(request, target, codegen, operator),
            None => self.run_in_process(request, codegen),
        }
    }
}
