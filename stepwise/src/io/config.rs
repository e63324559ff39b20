//! Engine configuration stored under `.stepwise/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::dependency::{DEFAULT_PATTERN, MissingDependency};
use crate::core::marker::DEFAULT_MARKER;

/// Default location of the config file relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".stepwise/config.toml";

/// Engine configuration (TOML).
///
/// Missing fields default to values suitable for generating Python scripts
/// and driving an `llm`-style command line client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StepwiseConfig {
    /// Directory where generated artifacts are written and scanned.
    pub artifact_dir: PathBuf,
    /// File name prefix for generated artifacts.
    pub artifact_prefix: String,
    /// How many recent artifacts to summarise for the planner.
    pub recent_artifacts: usize,
    /// Prefix of the out-of-band analysis marker line.
    pub marker: String,
    pub script: ScriptConfig,
    pub dependencies: DependencyConfig,
    pub collaborators: CollaboratorConfig,
    pub supervisor: SupervisorConfig,
}

/// How file-mode artifacts are run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptConfig {
    /// Language requested from code generation.
    pub language: String,
    /// Interpreter argv; the artifact path is appended.
    pub interpreter: Vec<String>,
    /// Artifact file extension (without the dot).
    pub extension: String,
    /// Line comment prefix used for provenance comments.
    pub comment_prefix: String,
    /// Extra environment for spawned scripts.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DependencyConfig {
    /// Regex whose first capture group is the missing package name.
    pub pattern: String,
    /// Installer argv; the package name is appended.
    pub installer: Vec<String>,
    pub timeout_secs: u64,
}

/// Commands backing the external collaborators.
///
/// Each command receives the rendered prompt on stdin and answers on stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub codegen: Vec<String>,
    pub planner: Vec<String>,
    /// `{image}` in any argument is replaced by the image path.
    pub analysis: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate collaborator output beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Grace period between terminate and kill when stopping.
    pub stop_grace_secs: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            language: "Python".to_string(),
            interpreter: vec!["python3".to_string(), "-u".to_string()],
            extension: "py".to_string(),
            comment_prefix: "#".to_string(),
            env: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
        }
    }
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.to_string(),
            installer: ["python3", "-m", "pip", "install"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_secs: 120,
        }
    }
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            codegen: vec!["llm".to_string()],
            planner: vec!["llm".to_string()],
            analysis: vec!["llm".to_string(), "-a".to_string(), "{image}".to_string()],
            timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { stop_grace_secs: 5 }
    }
}

impl Default for StepwiseConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("."),
            artifact_prefix: "stepwise".to_string(),
            recent_artifacts: 5,
            marker: DEFAULT_MARKER.to_string(),
            script: ScriptConfig::default(),
            dependencies: DependencyConfig::default(),
            collaborators: CollaboratorConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl StepwiseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.artifact_prefix.trim().is_empty() {
            return Err(anyhow!("artifact_prefix must be non-empty"));
        }
        if self.marker.trim().is_empty() {
            return Err(anyhow!("marker must be non-empty"));
        }
        if self.script.language.trim().is_empty() {
            return Err(anyhow!("script.language must be non-empty"));
        }
        if self.script.extension.trim().is_empty() {
            return Err(anyhow!("script.extension must be non-empty"));
        }
        if self.script.comment_prefix.trim().is_empty() {
            return Err(anyhow!("script.comment_prefix must be non-empty"));
        }
        ensure_argv("script.interpreter", &self.script.interpreter)?;
        ensure_argv("dependencies.installer", &self.dependencies.installer)?;
        ensure_argv("collaborators.codegen", &self.collaborators.codegen)?;
        ensure_argv("collaborators.planner", &self.collaborators.planner)?;
        ensure_argv("collaborators.analysis", &self.collaborators.analysis)?;
        if self.dependencies.timeout_secs == 0 {
            return Err(anyhow!("dependencies.timeout_secs must be > 0"));
        }
        if self.collaborators.timeout_secs == 0 {
            return Err(anyhow!("collaborators.timeout_secs must be > 0"));
        }
        if self.collaborators.output_limit_bytes == 0 {
            return Err(anyhow!("collaborators.output_limit_bytes must be > 0"));
        }
        MissingDependency::new(&self.dependencies.pattern)?;
        Ok(())
    }
}

fn ensure_argv(name: &str, argv: &[String]) -> Result<()> {
    if argv.is_empty() || argv[0].trim().is_empty() {
        return Err(anyhow!("{name} must be a non-empty array"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StepwiseConfig::default()`.
pub fn load_config(path: &Path) -> Result<StepwiseConfig> {
    if !path.exists() {
        let cfg = StepwiseConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StepwiseConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StepwiseConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, StepwiseConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".stepwise/config.toml");
        let cfg = StepwiseConfig {
            recent_artifacts: 9,
            ..StepwiseConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[script]\ninterpreter = [\"sh\"]\nextension = \"sh\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.script.interpreter, vec!["sh".to_string()]);
        assert_eq!(cfg.script.comment_prefix, "#");
        assert_eq!(cfg.dependencies, DependencyConfig::default());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = StepwiseConfig::default();
        cfg.dependencies.pattern = "no group".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = StepwiseConfig::default();
        cfg.collaborators.codegen.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("collaborators.codegen"));

        let mut cfg = StepwiseConfig::default();
        cfg.dependencies.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
