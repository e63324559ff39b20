//! Prompt rendering for the command-backed collaborators.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::io::collaborator::{CodeGenRequest, PlanRequest};

const CODEGEN_TEMPLATE: &str = include_str!("prompts/codegen.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const ANALYSIS_TEMPLATE: &str = include_str!("prompts/analysis.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    marker: String,
}

impl PromptEngine {
    /// `marker` is the analysis marker prefix scripts are told to print.
    pub fn new(marker: impl Into<String>) -> Self {
        let mut env = Environment::new();
        env.add_template("codegen", CODEGEN_TEMPLATE)
            .expect("codegen template should be valid");
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("analysis", ANALYSIS_TEMPLATE)
            .expect("analysis template should be valid");
        Self {
            env,
            marker: marker.into(),
        }
    }

    pub fn render_codegen(&self, request: &CodeGenRequest) -> Result<String> {
        let plan = request.plan_context.as_ref();
        let template = self.env.get_template("codegen")?;
        let rendered = template
            .render(context! {
                language => request.language.as_str(),
                marker => self.marker.as_str(),
                system_info => request.system_info.to_string(),
                instruction => request.instruction.trim(),
                current_code => non_empty(&request.current_code),
                error_feedback => request.error_feedback.as_deref().and_then(non_empty),
                prior_context => non_empty(&request.prior_context),
                full_plan => plan.and_then(|p| non_empty(&p.full_plan_text)),
                plan => plan,
            })
            .context("render codegen prompt")?;
        Ok(rendered)
    }

    pub fn render_plan(&self, request: &PlanRequest, language: &str) -> Result<String> {
        let template = self.env.get_template("plan")?;
        let rendered = template
            .render(context! {
                language => language,
                marker => self.marker.as_str(),
                instruction => request.instruction.trim(),
                system_info => request.system_info.to_string(),
                recent_artifacts => &request.recent_artifacts,
            })
            .context("render plan prompt")?;
        Ok(rendered)
    }

    pub fn render_analysis(&self, prompt: &str) -> Result<String> {
        let template = self.env.get_template("analysis")?;
        let rendered = template
            .render(context! { prompt => prompt.trim() })
            .context("render analysis prompt")?;
        Ok(rendered)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
