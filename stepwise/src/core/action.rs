//! Interpretation of `Requires_User_Action` text for non-code steps.

use std::sync::LazyLock;

use regex::Regex;

static ANALYSIS_ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(describe|analy[sz]e|inspect)\b.*\b(image|screenshot|picture|photo)\b")
        .unwrap()
});

static ACTION_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:image|screenshot) at\s+['\x22]?([^\s'\x22,]+)").unwrap());

static DEPENDENCY_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:path to|image at|file)\s*['\x22]?([/\w.\-:\\]+\.(?:png|jpe?g|bmp|gif))['\x22]?",
    )
    .unwrap()
});

/// What a non-code step asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    /// Pure informational step; succeeds without interaction.
    None,
    /// Internal image analysis of `path`, when one could be determined.
    Analyze { path: Option<String> },
    /// Manual action the operator must confirm.
    Manual(String),
}

/// Classify a step's action text, pulling an image path from the
/// dependencies (preferred) or the action text itself.
pub fn classify(action: Option<&str>, dependencies: Option<&str>) -> UserAction {
    let Some(action) = action.map(str::trim).filter(|a| !a.is_empty()) else {
        return UserAction::None;
    };
    if !ANALYSIS_ACTION_RE.is_match(action) {
        return UserAction::Manual(action.to_string());
    }

    let from_deps = dependencies.and_then(dependency_image_path);
    let from_action = ACTION_PATH_RE
        .captures(action)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .filter(|p| !p.is_empty());

    UserAction::Analyze {
        path: from_deps.or(from_action),
    }
}

/// Image path named in a step's dependencies text, e.g. "path to /tmp/a.png".
pub fn dependency_image_path(dependencies: &str) -> Option<String> {
    DEPENDENCY_PATH_RE
        .captures(dependencies)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
