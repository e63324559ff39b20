//! Recognition of "missing dependency" failures in raw error output.

use anyhow::{Context, Result, anyhow};
use regex::Regex;

/// Default pattern for a missing Python module; group 1 is the module name.
pub const DEFAULT_PATTERN: &str = r"ModuleNotFoundError: No module named '([\w\.]+)'";

/// Compiled missing-dependency pattern.
#[derive(Debug, Clone)]
pub struct MissingDependency {
    re: Regex,
}

impl MissingDependency {
    /// Compile `pattern`; it must contain at least one capture group.
    pub fn new(pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .with_context(|| format!("compile missing-dependency pattern {pattern:?}"))?;
        if re.captures_len() < 2 {
            return Err(anyhow!(
                "missing-dependency pattern {pattern:?} must capture the package name"
            ));
        }
        Ok(Self { re })
    }

    /// Name of the missing package reported in `error_text`, if any.
    pub fn detect(&self, error_text: &str) -> Option<String> {
        self.re
            .captures(error_text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|name| !name.is_empty())
    }
}

impl Default for MissingDependency {
    fn default() -> Self {
        Self {
            re: Regex::new(DEFAULT_PATTERN).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_python_module_name() {
        let stderr = "Traceback (most recent call last):\n  File \"x.py\", line 1, in <module>\n    import pygame.mixer\nModuleNotFoundError: No module named 'pygame.mixer'\n";
        assert_eq!(
            MissingDependency::default().detect(stderr).as_deref(),
            Some("pygame.mixer")
        );
    }

    #[test]
    fn unrelated_errors_do_not_match() {
        let stderr = "NameError: name 'foo' is not defined";
        assert_eq!(MissingDependency::default().detect(stderr), None);
    }

    #[test]
    fn custom_pattern_requires_capture_group() {
        assert!(MissingDependency::new(r"Cannot find module").is_err());
        assert!(MissingDependency::new(r"(unclosed").is_err());
        let node = MissingDependency::new(r"Cannot find module '([^']+)'").expect("pattern");
        assert_eq!(
            node.detect("Error: Cannot find module 'left-pad'").as_deref(),
            Some("left-pad")
        );
    }
}
