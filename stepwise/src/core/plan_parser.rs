//! Line-oriented parser for planning-service output.
//!
//! A plan is a sequence of numbered entries (`1.`, `2.`, ...). Each entry
//! carries labeled fields from a fixed, ordered vocabulary. A field's value
//! runs from its label to the next label that comes later in the vocabulary
//! order, or to the end of the entry.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Step;

/// Field labels in their fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Label {
    Task,
    Details,
    Dependencies,
    Outcome,
    RequiresCodeGen,
    AdditiveCode,
    RequiresUserInputDuringStep,
    RequiresUserAction,
    ScreenshotAnalysisSignal,
}

impl Label {
    const ALL: [Label; 9] = [
        Label::Task,
        Label::Details,
        Label::Dependencies,
        Label::Outcome,
        Label::RequiresCodeGen,
        Label::AdditiveCode,
        Label::RequiresUserInputDuringStep,
        Label::RequiresUserAction,
        Label::ScreenshotAnalysisSignal,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Label::Task => "Task",
            Label::Details => "Details",
            Label::Dependencies => "Dependencies",
            Label::Outcome => "Outcome",
            Label::RequiresCodeGen => "Requires_Code_Gen",
            Label::AdditiveCode => "Additive_Code",
            Label::RequiresUserInputDuringStep => "Requires_User_Input_During_Step",
            Label::RequiresUserAction => "Requires_User_Action",
            Label::ScreenshotAnalysisSignal => "Screenshot_Analysis_Signal",
        }
    }

    fn from_name(name: &str) -> Option<Label> {
        Label::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(name))
    }
}

static ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\.(?:\s+(.*))?$").unwrap());

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    let names = Label::ALL
        .iter()
        .map(|label| label.as_str())
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r"(?i)^\s*(?:[-*]\s+)?(?:\*\*)?({names})(?:\*\*)?\s*:(?:\*\*)?\s*(.*)$"
    ))
    .unwrap()
});

/// Parse planning text into ordered steps.
///
/// Returns an empty list only for empty input or when no task can be
/// derived; callers must treat that as a parse failure.
pub fn parse_plan(text: &str) -> Vec<Step> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let segments = split_entries(text);
    if segments.is_empty() {
        return parse_segment(text.trim()).into_iter().collect();
    }

    segments
        .iter()
        .filter(|segment| !segment.trim().is_empty())
        .filter_map(|segment| parse_segment(segment))
        .collect()
}

/// Split text into numbered entries. Text before the first entry is ignored.
fn split_entries(text: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(caps) = ENTRY_RE.captures(line) {
            let first = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            segments.push(first.to_string());
            continue;
        }
        if let Some(current) = segments.last_mut() {
            current.push('\n');
            current.push_str(line);
        }
    }
    segments
}

#[derive(Default)]
struct Fields {
    values: Vec<(Label, Vec<String>)>,
    untitled: Vec<String>,
}

impl Fields {
    fn get(&self, label: Label) -> Option<String> {
        self.values
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, lines)| lines.join("\n").trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn flag(&self, label: Label) -> Option<bool> {
        self.get(label)
            .map(|value| value.trim().eq_ignore_ascii_case("yes"))
    }
}

fn collect_fields(segment: &str) -> Fields {
    let mut fields = Fields::default();
    let mut current: Option<Label> = None;

    for line in segment.lines() {
        let labeled = LABEL_RE.captures(line).and_then(|caps| {
            let label = Label::from_name(caps.get(1)?.as_str())?;
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            Some((label, rest))
        });

        match (labeled, current) {
            // A label only ends the current field if it comes later in the order.
            (Some((label, rest)), Some(open)) if label > open => {
                fields.values.push((label, vec![rest.to_string()]));
                current = Some(label);
            }
            (Some((label, rest)), None) => {
                fields.values.push((label, vec![rest.to_string()]));
                current = Some(label);
            }
            (_, Some(_)) => {
                if let Some((_, lines)) = fields.values.last_mut() {
                    lines.push(line.trim().to_string());
                }
            }
            (None, None) => {
                if !line.trim().is_empty() {
                    fields.untitled.push(line.trim().to_string());
                }
            }
        }
    }
    fields
}

fn parse_segment(segment: &str) -> Option<Step> {
    let fields = collect_fields(segment);

    let task = fields
        .get(Label::Task)
        .or_else(|| fields.untitled.first().cloned())
        .or_else(|| {
            segment
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        })?;

    let requires_code_gen = fields.flag(Label::RequiresCodeGen).unwrap_or(true);
    let (additive, screenshot_signal) = if requires_code_gen {
        (
            fields.flag(Label::AdditiveCode).unwrap_or(false),
            fields.flag(Label::ScreenshotAnalysisSignal).unwrap_or(false),
        )
    } else {
        (false, false)
    };

    Some(Step {
        task,
        details: fields.get(Label::Details),
        dependencies: fields.get(Label::Dependencies),
        outcome: fields.get(Label::Outcome),
        requires_code_gen,
        additive,
        requires_user_input_during_step: fields.get(Label::RequiresUserInputDuringStep),
        requires_user_action: fields.get(Label::RequiresUserAction),
        screenshot_signal,
        original_task_if_modified: None,
    })
}
