//! Operator confirmation before destroying a block device

use crate::error::{ErrorCategory, ErrorKind, Result, ShredError};
use std::io::{self, BufRead, BufReader, IsTerminal, Read, Write};
use std::path::Path;

/// The exact answer that authorizes destroying a device.
pub const CONFIRMATION_WORD: &str = "YES";

/// Trait for reading the operator's answer from various sources
pub trait ConfirmationReader {
    /// Shows `prompt` if the source is interactive, then reads one line of
    /// answer without its line terminator.
    fn read_confirmation(&mut self, prompt: &str) -> Result<String>;
}

/// Returns a fixed answer (for testing)
pub struct ConstantConfirmationReader {
    answer: String,
}

impl ConstantConfirmationReader {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
        }
    }
}

impl ConfirmationReader for ConstantConfirmationReader {
    fn read_confirmation(&mut self, _prompt: &str) -> Result<String> {
        Ok(self.answer.clone())
    }
}

/// Reads the first line from any io::Read source
pub struct ReaderConfirmationReader {
    reader: BufReader<Box<dyn Read>>,
}

impl ReaderConfirmationReader {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }
}

impl ConfirmationReader for ReaderConfirmationReader {
    fn read_confirmation(&mut self, _prompt: &str) -> Result<String> {
        read_line(&mut self.reader)
    }
}

/// Prompts on stderr and reads the answer from the terminal
#[derive(Default)]
pub struct TerminalConfirmationReader;

impl TerminalConfirmationReader {
    pub fn new() -> Self {
        Self
    }
}

impl ConfirmationReader for TerminalConfirmationReader {
    fn read_confirmation(&mut self, prompt: &str) -> Result<String> {
        if !io::stdin().is_terminal() {
            return Err(ShredError::with_kind(
                ErrorCategory::User,
                ErrorKind::ConfirmationMissing,
                "cannot ask for confirmation - stdin is not a terminal (use --confirm-stdin)",
            ));
        }

        let mut stderr = io::stderr();
        stderr
            .write_all(prompt.as_bytes())
            .and_then(|()| stderr.flush())
            .map_err(|e| {
                ShredError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to write confirmation prompt",
                    e,
                )
            })?;

        read_line(&mut io::stdin().lock())
    }
}

fn read_line(reader: &mut dyn BufRead) -> Result<String> {
    let mut line = String::new();
    reader.read_line(&mut line).map_err(|e| {
        ShredError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "error reading confirmation",
            e,
        )
    })?;
    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Asks the operator to authorize destroying `device`.
///
/// Succeeds only if the answer is exactly [`CONFIRMATION_WORD`].
pub fn confirm_destruction(reader: &mut dyn ConfirmationReader, device: &Path) -> Result<()> {
    let prompt = format!(
        "All data on {} will be destroyed. Type {} to continue: ",
        device.display(),
        CONFIRMATION_WORD
    );
    let answer = reader.read_confirmation(&prompt)?;
    if answer != CONFIRMATION_WORD {
        return Err(ShredError::with_kind(
            ErrorCategory::User,
            ErrorKind::ConfirmationMissing,
            format!("{} was not confirmed; nothing was changed", device.display()),
        ));
    }
    Ok(())
}
