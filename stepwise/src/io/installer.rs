//! Recovery path for failures caused by a missing package.

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::dependency::MissingDependency;
use crate::io::operator::Operator;
use crate::io::process::run_command_with_timeout;

const INSTALLER_OUTPUT_LIMIT: usize = 64 * 1024;

/// Result of inspecting a failure for a missing dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The error text names no missing dependency.
    NotApplicable,
    /// The package was installed; the caller retries without a repair.
    Installed(String),
    Declined(String),
    /// The installer failed or timed out; the text joins the repair context.
    Failed { module: String, output: String },
}

impl InstallOutcome {
    /// Text appended to the error context passed to repair.
    pub fn repair_note(&self) -> Option<String> {
        match self {
            InstallOutcome::Declined(module) => {
                Some(format!("Operator declined installing missing module '{module}'."))
            }
            InstallOutcome::Failed { module, output } => Some(format!(
                "Attempt to install missing module '{module}' failed:\n{output}"
            )),
            InstallOutcome::NotApplicable | InstallOutcome::Installed(_) => None,
        }
    }
}

/// Detects missing-dependency errors and installs the package with consent.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    detector: MissingDependency,
    installer: Vec<String>,
    timeout: Duration,
}

impl DependencyResolver {
    pub fn new(detector: MissingDependency, installer: Vec<String>, timeout: Duration) -> Self {
        Self {
            detector,
            installer,
            timeout,
        }
    }

    /// Inspect raw stderr and, if it names a missing module, offer to install it.
    #[instrument(skip_all)]
    pub fn resolve(&self, stderr: &str, operator: &mut dyn Operator) -> Result<InstallOutcome> {
        let Some(module) = self.detector.detect(stderr) else {
            return Ok(InstallOutcome::NotApplicable);
        };
        info!(module = %module, "missing dependency detected");

        let consent = operator.confirm(&format!(
            "Missing module '{module}'. Install it with `{} {module}`?",
            self.installer.join(" ")
        ))?;
        if !consent {
            info!(module = %module, "install declined");
            return Ok(InstallOutcome::Declined(module));
        }
        Ok(self.install(&module))
    }

    fn install(&self, module: &str) -> InstallOutcome {
        let Some((program, args)) = self.installer.split_first() else {
            return InstallOutcome::Failed {
                module: module.to_string(),
                output: "no installer configured".to_string(),
            };
        };
        let mut cmd = Command::new(program);
        cmd.args(args).arg(module);

        println!("Installing {module}...");
        let output = match run_command_with_timeout(cmd, None, self.timeout, INSTALLER_OUTPUT_LIMIT)
        {
            Ok(output) => output,
            Err(e) => {
                warn!(module, err = %e, "installer could not run");
                return InstallOutcome::Failed {
                    module: module.to_string(),
                    output: format!("{e:#}"),
                };
            }
        };

        if output.timed_out {
            warn!(module, timeout_secs = self.timeout.as_secs(), "installer timed out");
            return InstallOutcome::Failed {
                module: module.to_string(),
                output: format!("installer timed out after {:?}", self.timeout),
            };
        }
        if !output.status.success() {
            warn!(module, exit_code = ?output.status.code(), "installer failed");
            return InstallOutcome::Failed {
                module: module.to_string(),
                output: format!(
                    "{}{}",
                    output.stderr_lossy().trim(),
                    output.stderr_truncated_notice("installer")
                ),
            };
        }

        info!(module, "dependency installed");
        println!("Installed {module}.");
        InstallOutcome::Installed(module.to_string())
    }
}
