//! Shared deterministic types for the plan execution engine.
//!
//! These types define stable contracts between the parser, executor, and
//! step engine. They must not depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// One unit of work parsed from a planning response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Concise action to perform.
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Libraries, files, or earlier outputs the step relies on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Whether code must be generated for this step.
    pub requires_code_gen: bool,
    /// Append generated code to the buffer instead of replacing it.
    ///
    /// Always `false` when `requires_code_gen` is `false`.
    pub additive: bool,
    /// What the generated script must prompt the user for, if anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_user_input_during_step: Option<String>,
    /// Manual operator action, or an internal non-code action such as image analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_user_action: Option<String>,
    /// The generated script prints the analysis marker for a screenshot it takes.
    pub screenshot_signal: bool,
    /// Task text before the operator replaced it during "modify & retry".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_task_if_modified: Option<String>,
}

/// Failure recorded for the step at the current index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: FailureKind,
    /// Human-readable reason shown to the operator.
    pub reason: String,
    /// Code buffer as it existed at failure, restored on retry.
    pub code_snapshot: String,
}

/// Failure classes surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CodeGen,
    Compile,
    Runtime,
    Analysis,
    Interrupted,
    Internal,
}

/// Classified result of one execution call.
///
/// Every variant has a distinct recovery policy in the step engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Ran to completion with a zero exit code.
    Succeeded,
    /// The script stopped itself through the sandbox `exit` import.
    ///
    /// A controlled stop is success whatever the code: the engine advances
    /// and `stepwise run` exits 0. Nonzero process exits in file mode are
    /// reported as [`RunStatus::RuntimeError`] instead.
    Exited(i32),
    /// Nothing to execute (empty or whitespace-only buffer).
    NoCode,
    /// The code failed to parse or compile; it never ran.
    CompileError(String),
    /// Runtime fault, nonzero exit, or spawn failure.
    RuntimeError(String),
    /// The operator interrupted execution.
    Interrupted,
    /// A missing dependency was installed; retry without counting a failure.
    DependencyInstalled(String),
}

impl RunStatus {
    pub fn succeeded(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Exited(_))
    }

    /// Error text to feed back to the code generator, if any.
    pub fn error_for_collaborator(&self) -> Option<&str> {
        match self {
            RunStatus::CompileError(msg) | RunStatus::RuntimeError(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Result of one `Executor` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Code after the call: the input, or a repaired replacement.
    pub code_after: String,
    /// A repair round produced different code (not yet executed).
    pub was_auto_fixed: bool,
    pub status: RunStatus,
    /// Captured stdout, one entry per line, in order.
    pub stdout_lines: Vec<String>,
}

impl ExecutionOutcome {
    pub fn unchanged(code: &str, status: RunStatus, stdout_lines: Vec<String>) -> Self {
        Self {
            code_after: code.to_string(),
            was_auto_fixed: false,
            status,
            stdout_lines,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status.succeeded()
    }
}
