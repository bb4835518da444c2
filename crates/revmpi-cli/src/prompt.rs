use regex::Regex;
use revmpi_proto::{CheckpointId, Command, InternalTopic, WorkerId};

/// Help of the coordinator prompt.
pub const COORDINATOR_HELP: &str = "\
Commands (<nid> is a worker ID, or `all`):
    <nid> b <line>    set a breakpoint
    <nid> s           execute one instruction
    <nid> c           continue until the next breakpoint
    <nid> p <var>     print a variable
    <id> pd <topic>   print internal state of one worker
    <id> r <cp>       restore a checkpoint of one worker only
    r <cp>            roll back every worker causally linked to a checkpoint
    cp                list the causal log
    help              show this help
    q                 quit";

/// Prompt input error.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PromptError {
    /// The input matches no command.
    #[error("unknown command: {0} (type `help`)")]
    Unknown(String),

    /// The command cannot be sent to every worker at once.
    #[error("`{0}` needs a single worker ID")]
    SingleWorkerOnly(String),

    /// Bad `pd` topic.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

/// Workers addressed by a coordinator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every live worker.
    All,
    /// One worker.
    Worker(WorkerId),
}

/// Parsed coordinator prompt input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorInput {
    /// Command dispatched to workers.
    Dispatch {
        /// Addressed workers.
        target: Target,
        /// Command to apply.
        command: Command,
    },
    /// Causal rollback to a checkpoint.
    Rollback(CheckpointId),
    /// Listing of the causal log.
    CausalLog,
    /// Help.
    Help,
    /// Quit every worker.
    Quit,
}

/// Parser of prompt lines.
pub struct PromptParser {
    command: Regex,
    addressed: Regex,
    rollback: Regex,
}

impl PromptParser {
    /// Compiles the command grammars.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            command: Regex::new(r"^(?:(?<bare>s|c|q|help)|(?<op>b|r|p|pd)\s+(?<arg>\S+))$")?,
            addressed: Regex::new(r"^(?<target>all|\d+)\s+(?<command>.+)$")?,
            rollback: Regex::new(r"^r\s+(?<cp>\S+)$")?,
        })
    }

    /// Parses a worker command.
    pub fn parse_command(&self, line: &str) -> Result<Command, PromptError> {
        let line = line.trim();

        let unknown = || PromptError::Unknown(line.to_owned());

        let caps = self.command.captures(line).ok_or_else(unknown)?;

        if let Some(bare) = caps.name("bare") {
            return Ok(match bare.as_str() {
                "s" => Command::SingleStep,
                "c" => Command::Continue,
                "q" => Command::Quit,
                _ => Command::Help,
            });
        }

        let (Some(op), Some(arg)) = (caps.name("op"), caps.name("arg")) else {
            return Err(unknown());
        };
        let arg = arg.as_str();

        match op.as_str() {
            "b" => arg
                .parse()
                .map(|line| Command::SetBreakpoint { line })
                .map_err(|_| unknown()),
            "r" => Ok(Command::Restore {
                checkpoint: arg.into(),
            }),
            "p" => Ok(Command::Print {
                variable: arg.to_owned(),
            }),
            _ => arg
                .parse::<InternalTopic>()
                .map(|topic| Command::PrintInternal { topic })
                .map_err(|_| PromptError::UnknownTopic(arg.to_owned())),
        }
    }

    /// Parses a coordinator prompt line.
    pub fn parse_coordinator(&self, line: &str) -> Result<CoordinatorInput, PromptError> {
        let line = line.trim();

        match line {
            "cp" => return Ok(CoordinatorInput::CausalLog),
            "help" => return Ok(CoordinatorInput::Help),
            "q" => return Ok(CoordinatorInput::Quit),
            _ => (),
        }

        if let Some(caps) = self.rollback.captures(line) {
            return Ok(CoordinatorInput::Rollback(caps["cp"].into()));
        }

        let caps = self
            .addressed
            .captures(line)
            .ok_or_else(|| PromptError::Unknown(line.to_owned()))?;

        let command = self.parse_command(&caps["command"])?;

        let target = match &caps["target"] {
            "all" => Target::All,
            id => id
                .parse()
                .map(|id| Target::Worker(WorkerId(id)))
                .map_err(|_| PromptError::Unknown(line.to_owned()))?,
        };

        let single_only = matches!(
            command,
            Command::Restore { .. } | Command::PrintInternal { .. } | Command::Help | Command::Quit
        );

        if target == Target::All && single_only {
            return Err(PromptError::SingleWorkerOnly(caps["command"].to_owned()));
        }

        Ok(CoordinatorInput::Dispatch { target, command })
    }
}
