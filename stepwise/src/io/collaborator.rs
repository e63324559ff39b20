//! External collaborators: code generation, planning, and image analysis.
//!
//! The engine talks to these services only through the [`CodeGen`],
//! [`Planner`], and [`Analysis`] traits. [`CommandCollaborator`] backs all three
//! with a configured command line that reads a rendered prompt on stdin and
//! answers on stdout. Tests use scripted collaborators from `test_support`.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptEngine;
use crate::io::system::SystemInfo;

/// Prefix a collaborator uses to report a failure in-band.
pub const ERROR_PREFIX: &str = "#LLM_ERR";

/// Plan position and intent handed to code generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanContext {
    pub overall_goal: String,
    pub full_plan_text: String,
    pub step_description: String,
    pub step_details: Option<String>,
    /// What the generated script must prompt for.
    pub required_user_input: Option<String>,
    pub screenshot_signal: bool,
    pub is_additive: bool,
}

/// Input to one code generation or repair call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeGenRequest {
    /// Existing code. With an additive plan step the response is only the addition.
    pub current_code: String,
    pub instruction: String,
    /// Error text when the request is a repair.
    pub error_feedback: Option<String>,
    /// Summary of earlier successful work.
    pub prior_context: String,
    pub system_info: SystemInfo,
    pub plan_context: Option<PlanContext>,
    /// Language the generated code must be written in.
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub instruction: String,
    pub system_info: SystemInfo,
    /// One summary line per recent artifact, newest first.
    pub recent_artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub image_path: PathBuf,
    pub prompt: String,
}

/// Produces new code or repairs existing code.
pub trait CodeGen {
    /// Returns code only. An empty string means "nothing to do".
    fn generate(&self, request: &CodeGenRequest) -> Result<String>;
}

/// Produces raw numbered plan text for an instruction.
pub trait Planner {
    fn plan(&self, request: &PlanRequest) -> Result<String>;
}

/// Describes an image.
pub trait Analysis {
    fn describe(&self, request: &AnalysisRequest) -> Result<String>;
}

/// Collaborator backed by an external command.
pub struct CommandCollaborator {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    prompts: PromptEngine,
    /// Language named in planning prompts.
    language: String,
}

impl CommandCollaborator {
    pub fn new(
        argv: Vec<String>,
        timeout: Duration,
        output_limit_bytes: usize,
        marker: &str,
        language: impl Into<String>,
    ) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("collaborator command must be non-empty"));
        }
        Ok(Self {
            argv,
            timeout,
            output_limit_bytes,
            prompts: PromptEngine::new(marker),
            language: language.into(),
        })
    }

    /// Run the command with `prompt` on stdin and return its trimmed stdout.
    #[instrument(skip_all, fields(program = %self.argv[0], role = role))]
    fn invoke(&self, role: &str, prompt: &str, image: Option<&str>) -> Result<String> {
        let mut cmd = Command::new(&self.argv[0]);
        for arg in &self.argv[1..] {
            match image {
                Some(path) => cmd.arg(arg.replace("{image}", path)),
                None => cmd.arg(arg),
            };
        }

        info!(role, "invoking collaborator");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {role} collaborator"))?;

        if output.timed_out {
            warn!(role, timeout_secs = self.timeout.as_secs(), "collaborator timed out");
            return Err(anyhow!(
                "{role} collaborator timed out after {:?}",
                self.timeout
            ));
        }
        if !output.status.success() {
            warn!(role, exit_code = ?output.status.code(), "collaborator failed");
            return Err(anyhow!(
                "{role} collaborator failed with status {:?}: {}{}",
                output.status.code(),
                output.stderr_lossy().trim(),
                output.stderr_truncated_notice(role)
            ));
        }

        let response = output.stdout_lossy().trim().to_string();
        if let Some(rest) = response.strip_prefix(ERROR_PREFIX) {
            return Err(anyhow!("{role} collaborator reported: {}", rest.trim()));
        }
        debug!(role, bytes = response.len(), "collaborator answered");
        Ok(response)
    }
}

impl CodeGen for CommandCollaborator {
    fn generate(&self, request: &CodeGenRequest) -> Result<String> {
        let prompt = self.prompts.render_codegen(request)?;
        let response = self.invoke("codegen", &prompt, None)?;
        Ok(strip_code_fences(&response))
    }
}

impl Planner for CommandCollaborator {
    fn plan(&self, request: &PlanRequest) -> Result<String> {
        let prompt = self.prompts.render_plan(request, &self.language)?;
        self.invoke("planner", &prompt, None)
    }
}

impl Analysis for CommandCollaborator {
    fn describe(&self, request: &AnalysisRequest) -> Result<String> {
        let prompt = self.prompts.render_analysis(&request.prompt)?;
        let path = request.image_path.to_string_lossy();
        self.invoke("analysis", &prompt, Some(&*path))
    }
}

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```[\w+\-]*[^\n]*\n(.*?)\n?```\s*$").unwrap());

/// Strip a surrounding Markdown code fence, if present.
pub fn strip_code_fences(response: &str) -> String {
    let trimmed = response.trim();
    match FENCE_RE.captures(trimmed).and_then(|caps| caps.get(1)) {
        Some(body) => body.as_str().trim_end().to_string(),
        None => trimmed.to_string(),
    }
}
