//! Dispatch of marker-signalled artifacts to image analysis.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::core::marker::{find_marked_path, resolve_target};
use crate::io::collaborator::{Analysis, AnalysisRequest};

/// Prompt sent with every dispatched image.
pub const DESCRIBE_PROMPT: &str = "Describe this image in detail.";

/// Characters of a description carried into the next step's context.
const CONTEXT_EXCERPT_CHARS: usize = 100;

/// What happened after scanning a run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// No marker line and no fallback path.
    NoDispatch,
    /// A path was named but no such file exists.
    MissingFile(PathBuf),
    Dispatched { path: PathBuf, description: String },
    Failed { path: PathBuf, reason: String },
}

impl SignalOutcome {
    /// Line appended to the prior-success context after a dispatch.
    pub fn context_note(&self) -> Option<String> {
        match self {
            SignalOutcome::Dispatched { description, .. } => {
                let excerpt: String = description.chars().take(CONTEXT_EXCERPT_CHARS).collect();
                Some(format!("AI image description: {excerpt}..."))
            }
            _ => None,
        }
    }
}

/// Scans captured stdout for the analysis marker.
#[derive(Debug, Clone)]
pub struct SignalDetector {
    marker: String,
}

impl SignalDetector {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// Pick the artifact to analyse, if any.
    ///
    /// `base_dir` is the executed artifact's directory; `None` for in-process runs.
    pub fn target(
        &self,
        stdout_lines: &[String],
        fallback: Option<&str>,
        base_dir: Option<&Path>,
    ) -> Option<PathBuf> {
        let marked = find_marked_path(stdout_lines, &self.marker);
        if let Some(path) = marked {
            info!(path, "script signalled image analysis");
        }
        resolve_target(marked, fallback, base_dir)
    }

    /// Dispatch the signalled artifact to `analysis` at most once.
    #[instrument(skip_all)]
    pub fn dispatch(
        &self,
        stdout_lines: &[String],
        fallback: Option<&str>,
        base_dir: Option<&Path>,
        analysis: &dyn Analysis,
    ) -> SignalOutcome {
        match self.target(stdout_lines, fallback, base_dir) {
            Some(path) => describe_file(&path, analysis),
            None => SignalOutcome::NoDispatch,
        }
    }
}

/// Describe an existing image file through `analysis`.
pub fn describe_file(path: &Path, analysis: &dyn Analysis) -> SignalOutcome {
    if !path.is_file() {
        warn!(path = %path.display(), "signalled image does not exist");
        return SignalOutcome::MissingFile(path.to_path_buf());
    }
    let request = AnalysisRequest {
        image_path: path.to_path_buf(),
        prompt: DESCRIBE_PROMPT.to_string(),
    };
    match analysis.describe(&request) {
        Ok(description) => {
            info!(path = %path.display(), "image described");
            SignalOutcome::Dispatched {
                path: path.to_path_buf(),
                description,
            }
        }
        Err(e) => {
            warn!(path = %path.display(), err = %e, "image analysis failed");
            SignalOutcome::Failed {
                path: path.to_path_buf(),
                reason: format!("{e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedAnalysis;
    use std::fs;

    const MARKER: &str = "#STEPWISE_ANALYZE_IMAGE_PATH:";

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn marker_line_dispatches_exactly_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let shot = temp.path().join("shot.png");
        fs::write(&shot, b"png").expect("write");
        let analysis = ScriptedAnalysis::new().answer("a red square");
        let out = lines(&["working", &format!("{MARKER} {}", shot.display()), "done"]);

        let outcome = SignalDetector::new(MARKER).dispatch(&out, None, None, &analysis);

        assert_eq!(
            outcome,
            SignalOutcome::Dispatched {
                path: shot.clone(),
                description: "a red square".to_string()
            }
        );
        let requests = analysis.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].image_path, shot);
    }

    #[test]
    fn no_marker_and_no_fallback_means_no_dispatch() {
        let analysis = ScriptedAnalysis::new();
        let outcome =
            SignalDetector::new(MARKER).dispatch(&lines(&["plain output"]), None, None, &analysis);
        assert_eq!(outcome, SignalOutcome::NoDispatch);
        assert!(analysis.requests().is_empty());
    }

    #[test]
    fn relative_marker_resolves_against_artifact_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("rel.png"), b"png").expect("write");
        let analysis = ScriptedAnalysis::new().answer("ok");
        let outcome = SignalDetector::new(MARKER).dispatch(
            &lines(&[&format!("{MARKER} rel.png")]),
            None,
            Some(temp.path()),
            &analysis,
        );
        assert!(matches!(outcome, SignalOutcome::Dispatched { .. }));
    }

    #[test]
    fn missing_file_and_analysis_failure_are_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let analysis = ScriptedAnalysis::new().fail("model unavailable");
        let detector = SignalDetector::new(MARKER);

        let missing = temp.path().join("absent.png");
        let outcome = detector.dispatch(
            &lines(&[&format!("{MARKER} {}", missing.display())]),
            None,
            None,
            &analysis,
        );
        assert_eq!(outcome, SignalOutcome::MissingFile(missing));

        let present = temp.path().join("present.png");
        fs::write(&present, b"png").expect("write");
        let fallback = present.to_string_lossy().into_owned();
        let outcome = detector.dispatch(&[], Some(fallback.as_str()), None, &analysis);
        assert!(matches!(outcome, SignalOutcome::Failed { reason, .. } if reason.contains("model unavailable")));
    }

    #[test]
    fn context_note_is_truncated() {
        let outcome = SignalOutcome::Dispatched {
            path: PathBuf::from("x.png"),
            description: "y".repeat(300),
        };
        let note = outcome.context_note().expect("note");
        assert_eq!(note, format!("AI image description: {}...", "y".repeat(100)));
    }
}
