//! Crate implementing the CLI commands.

mod cli;
mod config;
mod console;
mod prompt;
mod run;
mod transport;

pub use self::cli::{CliAction, CliOpts};
pub use self::config::{RevmpiConfig, parse_config};
pub use self::prompt::{COORDINATOR_HELP, CoordinatorInput, PromptError, PromptParser, Target};
pub use self::run::{evaluate_coordinator, evaluate_worker};
pub use self::transport::{accept_workers, serve_coordinator};
