//! Scripted collaborators for tests.
//!
//! Each fake pops queued responses in order and records what it was asked,
//! so tests can drive the engine without spawning services.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::core::types::{ExecutionOutcome, RunStatus};
use crate::executor::{ExecRequest, Execute};
use crate::io::collaborator::{
    Analysis, AnalysisRequest, CodeGen, CodeGenRequest, PlanRequest, Planner,
};
use crate::io::operator::Operator;

type Reply = std::result::Result<String, String>;

fn pop_reply(queue: &RefCell<VecDeque<Reply>>, who: &str) -> Result<String> {
    match queue.borrow_mut().pop_front() {
        Some(Ok(text)) => Ok(text),
        Some(Err(msg)) => Err(anyhow!(msg)),
        None => Err(anyhow!("{who}: no scripted response left")),
    }
}

/// Code generator returning queued responses.
#[derive(Default)]
pub struct ScriptedCodeGen {
    replies: RefCell<VecDeque<Reply>>,
    requests: RefCell<Vec<CodeGenRequest>>,
}

impl ScriptedCodeGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, code: &str) -> Self {
        self.replies.borrow_mut().push_back(Ok(code.to_string()));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.replies.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<CodeGenRequest> {
        self.requests.borrow().clone()
    }
}

impl CodeGen for ScriptedCodeGen {
    fn generate(&self, request: &CodeGenRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        pop_reply(&self.replies, "codegen")
    }
}

/// Planner returning queued plan texts.
#[derive(Default)]
pub struct ScriptedPlanner {
    replies: RefCell<VecDeque<Reply>>,
    requests: RefCell<Vec<PlanRequest>>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, plan: &str) -> Self {
        self.replies.borrow_mut().push_back(Ok(plan.to_string()));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.replies.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.borrow().clone()
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&self, request: &PlanRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        pop_reply(&self.replies, "planner")
    }
}

/// Image analysis returning queued descriptions.
#[derive(Default)]
pub struct ScriptedAnalysis {
    replies: RefCell<VecDeque<Reply>>,
    requests: RefCell<Vec<AnalysisRequest>>,
}

impl ScriptedAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, description: &str) -> Self {
        self.replies
            .borrow_mut()
            .push_back(Ok(description.to_string()));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.replies.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<AnalysisRequest> {
        self.requests.borrow().clone()
    }
}

impl Analysis for ScriptedAnalysis {
    fn describe(&self, request: &AnalysisRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        pop_reply(&self.replies, "analysis")
    }
}

/// Operator with queued answers. Unscripted confirmations are "no" and
/// unscripted questions are cancelled.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    confirmations: VecDeque<bool>,
    answers: VecDeque<Option<String>>,
    prompts: Vec<String>,
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_confirm(mut self, answer: bool) -> Self {
        self.confirmations.push_back(answer);
        self
    }

    pub fn then_answer(mut self, text: &str) -> Self {
        self.answers.push_back(Some(text.to_string()));
        self
    }

    pub fn then_cancel(mut self) -> Self {
        self.answers.push_back(None);
        self
    }

    /// Every prompt shown so far, in order.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        self.prompts.push(prompt.to_string());
        Ok(self.confirmations.pop_front().unwrap_or(false))
    }

    fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        self.prompts.push(prompt.to_string());
        Ok(self.answers.pop_front().flatten())
    }
}

/// One queued execution result.
#[derive(Debug, Clone)]
struct ScriptedRun {
    status: RunStatus,
    stdout_lines: Vec<String>,
    fixed_code: Option<String>,
}

/// What a [`ScriptedExecutor`] was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExec {
    pub code: String,
    pub target: Option<PathBuf>,
}

/// Executor returning queued outcomes without running anything.
#[derive(Default)]
pub struct ScriptedExecutor {
    runs: RefCell<VecDeque<ScriptedRun>>,
    calls: RefCell<Vec<RecordedExec>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(self) -> Self {
        self.succeed_with_output(&[])
    }

    pub fn succeed_with_output(self, lines: &[&str]) -> Self {
        self.push(RunStatus::Succeeded, lines, None)
    }

    pub fn status(self, status: RunStatus) -> Self {
        self.push(status, &[], None)
    }

    /// A failed run whose repair round produced `fixed_code`.
    pub fn fail_with_fix(self, error: &str, fixed_code: &str) -> Self {
        self.push(
            RunStatus::RuntimeError(error.to_string()),
            &[],
            Some(fixed_code.to_string()),
        )
    }

    fn push(self, status: RunStatus, lines: &[&str], fixed_code: Option<String>) -> Self {
        self.runs.borrow_mut().push_back(ScriptedRun {
            status,
            stdout_lines: lines.iter().map(|s| s.to_string()).collect(),
            fixed_code,
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedExec> {
        self.calls.borrow().clone()
    }
}

impl Execute for ScriptedExecutor {
    fn execute(
        &self,
        request: &ExecRequest<'_>,
        _codegen: &dyn CodeGen,
        _operator: &mut dyn Operator,
    ) -> Result<ExecutionOutcome> {
        self.calls.borrow_mut().push(RecordedExec {
            code: request.code.to_string(),
            target: request.target.map(PathBuf::from),
        });
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("executor: no scripted run left"))?;
        Ok(match run.fixed_code {
            Some(code) => ExecutionOutcome {
                code_after: code,
                was_auto_fixed: true,
                status: run.status,
                stdout_lines: run.stdout_lines,
            },
            None => ExecutionOutcome::unchanged(request.code, run.status, run.stdout_lines),
        })
    }
}
