//! Persisted script artifacts and the recent-activity summary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::provenance::summarize_header;

/// Directory of generated artifacts named `<prefix><unix-millis>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    prefix: String,
    extension: String,
    comment_prefix: String,
}

impl ArtifactStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
        comment_prefix: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            extension: extension.into(),
            comment_prefix: comment_prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A path that does not exist yet, based on the current time.
    pub fn unique_path(&self) -> PathBuf {
        let mut millis = chrono::Utc::now().timestamp_millis();
        loop {
            let candidate = self
                .dir
                .join(format!("{}{millis}.{}", self.prefix, self.extension));
            if !candidate.exists() {
                return candidate;
            }
            millis += 1;
        }
    }

    /// Write `code` to `path`, creating the artifact directory if needed.
    pub fn write(&self, path: &Path, code: &str) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir {}", parent.display()))?;
        }
        fs::write(path, code).with_context(|| format!("write artifact {}", path.display()))?;
        debug!(path = %path.display(), bytes = code.len(), "artifact written");
        Ok(())
    }

    /// Summaries of the `limit` most recently modified artifacts, newest first.
    ///
    /// Each line reads `- <file>: <header>`; files without a provenance header
    /// are listed by name only. A missing directory yields no lines.
    pub fn recent_summaries(&self, limit: usize) -> Result<Vec<String>> {
        if limit == 0 || !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let suffix = format!(".{}", self.extension);
        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        let entries =
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", self.dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&self.prefix) || !name.ends_with(&suffix) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, entry.path()));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let mut lines = Vec::new();
        for (_, path) in found.into_iter().take(limit) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let header = match fs::read_to_string(&path) {
                Ok(contents) => summarize_header(&contents, &self.comment_prefix),
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "failed to read artifact");
                    None
                }
            };
            lines.push(match header {
                Some(header) => format!("- {name}: {header}"),
                None => format!("- {name}"),
            });
        }
        Ok(lines)
    }
}
