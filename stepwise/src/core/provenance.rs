//! Provenance comments recording which step and goal produced a block of code.

/// Tag that follows the comment prefix on every provenance line.
pub const TAG: &str = "stepwise:";

/// Where a block of generated code came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance<'a> {
    /// 1-indexed step number.
    pub step: usize,
    pub total: usize,
    pub task: &'a str,
    pub goal: &'a str,
}

/// Prefix `code` with a provenance block unless its first non-empty line
/// already carries one.
pub fn annotate(code: &str, comment_prefix: &str, provenance: &Provenance<'_>) -> String {
    if first_code_line(code).is_some_and(|line| is_provenance_line(line, comment_prefix)) {
        return code.to_string();
    }
    let mut out = format!(
        "{comment_prefix} {TAG} step {}/{}: {}\n",
        provenance.step, provenance.total, provenance.task
    );
    if !provenance.goal.trim().is_empty() {
        out.push_str(&format!(
            "{comment_prefix} {TAG} overall goal: {}\n",
            provenance.goal
        ));
    }
    out.push_str(code);
    out
}

/// Prefix `code` with a single task line, used for ad-hoc runs outside a plan.
pub fn annotate_task(code: &str, comment_prefix: &str, task: &str) -> String {
    if first_code_line(code).is_some_and(|line| is_provenance_line(line, comment_prefix)) {
        return code.to_string();
    }
    format!("{comment_prefix} {TAG} task: {task}\n{code}")
}

/// Summarise the provenance header of an artifact from its first two lines.
///
/// Returns `None` when the first line is not a provenance comment.
pub fn summarize_header(contents: &str, comment_prefix: &str) -> Option<String> {
    let mut lines = contents.lines();
    let summary = strip_tag(lines.next()?.trim(), comment_prefix)?.to_string();
    let goal = lines
        .next()
        .and_then(|line| strip_tag(line.trim(), comment_prefix))
        .and_then(|rest| rest.strip_prefix("overall goal:"))
        .map(str::trim);
    Some(match goal {
        Some(goal) => format!("{summary} (part of goal: {goal})"),
        None => summary,
    })
}

fn first_code_line(code: &str) -> Option<&str> {
    code.lines().find(|line| !line.trim().is_empty())
}

fn is_provenance_line(line: &str, comment_prefix: &str) -> bool {
    strip_tag(line.trim_start(), comment_prefix).is_some()
}

fn strip_tag<'a>(line: &'a str, comment_prefix: &str) -> Option<&'a str> {
    line.strip_prefix(comment_prefix)
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix(TAG))
        .map(str::trim)
}
