use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CheckpointId;

/// A command applied to one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Arms a user breakpoint at a line of the entry source file.
    ///
    /// A negative line arms a breakpoint at `|line|` whose first hit is
    /// ignored.
    SetBreakpoint {
        /// Source line.
        line: i64,
    },

    /// Executes one instruction.
    SingleStep,

    /// Resumes until the next user-visible stop.
    Continue,

    /// Restores a checkpoint of this worker.
    Restore {
        /// Checkpoint to restore.
        checkpoint: CheckpointId,
    },

    /// Reads a variable of the traced process.
    Print {
        /// Variable identifier.
        variable: String,
    },

    /// Dumps internal debugger state.
    PrintInternal {
        /// What to dump.
        topic: InternalTopic,
    },

    /// Terminates the traced process and the worker.
    Quit,

    /// Lists the available commands.
    Help,
}

/// Internal state that [Command::PrintInternal] can dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InternalTopic {
    /// Current call stack.
    Last,
    /// Debug-information modules.
    Modules,
    /// Debug-information variables.
    Vars,
    /// Memory map of the traced process.
    Maps,
    /// Current source location.
    Loc,
    /// Recorded checkpoints.
    Checkpoints,
    /// Armed breakpoints.
    Breakpoints,
}

/// Outcome of a [Command].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Error message of a recoverable failure.
    pub error: Option<String>,

    /// Whether the traced process has exited.
    pub exited: bool,

    /// Text produced by the command (variable value, dumps, help).
    pub output: Option<String>,
}

impl Command {
    /// Whether the command makes the traced process execute forward.
    pub fn is_forward_progress(&self) -> bool {
        matches!(self, Self::SingleStep | Self::Continue)
    }

    /// Whether the command changes the execution position of the traced
    /// process.
    pub fn is_progress(&self) -> bool {
        self.is_forward_progress() || matches!(self, Self::Restore { .. })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetBreakpoint { line } => write!(f, "breakpoint {line}"),
            Self::SingleStep => f.write_str("single-step"),
            Self::Continue => f.write_str("continue"),
            Self::Restore { checkpoint } => write!(f, "restore {checkpoint}"),
            Self::Print { variable } => write!(f, "print {variable}"),
            Self::PrintInternal { topic } => write!(f, "print-internal {topic}"),
            Self::Quit => f.write_str("quit"),
            Self::Help => f.write_str("help"),
        }
    }
}

impl CommandResult {
    /// Successful result carrying some output.
    pub fn with_output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    /// Result of a recoverable failure.
    pub fn with_error(error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

impl FromStr for InternalTopic {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "last" => Ok(Self::Last),
            "modules" => Ok(Self::Modules),
            "vars" => Ok(Self::Vars),
            "maps" => Ok(Self::Maps),
            "loc" => Ok(Self::Loc),
            "cp" => Ok(Self::Checkpoints),
            "bps" => Ok(Self::Breakpoints),
            _ => Err(crate::Error::UnknownTopic(s.to_owned())),
        }
    }
}

impl fmt::Display for InternalTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Last => "last",
            Self::Modules => "modules",
            Self::Vars => "vars",
            Self::Maps => "maps",
            Self::Loc => "loc",
            Self::Checkpoints => "cp",
            Self::Breakpoints => "bps",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, InternalTopic};

    #[test]
    fn progress_kinds() {
        assert!(Command::SingleStep.is_forward_progress());
        assert!(Command::Continue.is_forward_progress());

        let restore = Command::Restore {
            checkpoint: "abc".into(),
        };
        assert!(!restore.is_forward_progress());
        assert!(restore.is_progress());

        assert!(!Command::Print {
            variable: "x".to_owned()
        }
        .is_progress());
    }

    #[test]
    fn topics_parse() {
        assert_eq!("cp".parse::<InternalTopic>().ok(), Some(InternalTopic::Checkpoints));
        assert_eq!("loc".parse::<InternalTopic>().ok(), Some(InternalTopic::Loc));
        assert!("stack".parse::<InternalTopic>().is_err());
    }
}
