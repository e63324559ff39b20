//! Human-in-the-loop prompts.
//!
//! The [`Operator`] trait decouples consent and recovery decisions from the
//! terminal. Tests use scripted operators with queued answers.

use anyhow::{Context, Result};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::debug;

/// Source of operator decisions.
pub trait Operator {
    /// Ask a yes/no question. Anything but an explicit yes is a no.
    fn confirm(&mut self, prompt: &str) -> Result<bool>;

    /// Ask for free text. `None` means the operator cancelled.
    fn ask(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// One line read at the interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Line(String),
    /// Ctrl-C at the prompt.
    Cancelled,
    /// Ctrl-D / closed stdin.
    Closed,
}

/// Interactive terminal operator backed by a line editor.
pub struct ConsoleOperator {
    editor: DefaultEditor,
}

impl ConsoleOperator {
    pub fn new() -> Result<Self> {
        let editor = DefaultEditor::new().context("initialize line editor")?;
        Ok(Self { editor })
    }

    /// Read one line, keeping non-empty lines in history.
    pub fn read_line(&mut self, prompt: &str) -> Result<PromptInput> {
        match self.editor.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    if let Err(e) = self.editor.add_history_entry(trimmed) {
                        debug!(err = %e, "failed to record history entry");
                    }
                }
                Ok(PromptInput::Line(trimmed.to_string()))
            }
            Err(ReadlineError::Interrupted) => Ok(PromptInput::Cancelled),
            Err(ReadlineError::Eof) => Ok(PromptInput::Closed),
            Err(e) => Err(e).context("read operator input"),
        }
    }
}

impl Operator for ConsoleOperator {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        let answer = match self.read_line(&format!("{prompt} (y/N): "))? {
            PromptInput::Line(line) => is_yes(&line),
            PromptInput::Cancelled | PromptInput::Closed => false,
        };
        debug!(answer, "operator confirmation");
        Ok(answer)
    }

    fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        match self.read_line(&format!("{prompt}: "))? {
            PromptInput::Line(line) => Ok(Some(line)),
            PromptInput::Cancelled | PromptInput::Closed => Ok(None),
        }
    }
}

/// `y` or `yes`, case-insensitive.
pub fn is_yes(answer: &str) -> bool {
    let answer = answer.trim();
    answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
}
