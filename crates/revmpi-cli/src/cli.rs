use std::path::PathBuf;

/// The revmpi reversible debugger.
#[derive(clap::Parser)]
pub struct CliOpts {
    /// The command to run.
    #[clap(subcommand)]
    pub action: CliAction,
}

/// The command to run.
#[derive(clap::Subcommand)]
pub enum CliAction {
    /// Command to spawn one process under trace.
    Worker {
        /// Debugger configuration (KDL format).
        ///
        /// If it ends with `.kdl`, it is treated as a path to a configuration
        /// file. Otherwise it is directly parsed as inline KDL-formatted
        /// configuration.
        #[clap(short, long, value_name = "CONTENT/PATH", default_value = "")]
        config: String,

        /// Read commands from the terminal instead of a coordinator.
        ///
        /// Exactly one of `--standalone` and `--coordinator` must be given.
        #[clap(long)]
        standalone: bool,

        /// Address of the coordinator to register with.
        #[clap(
            long,
            value_name = "HOST:PORT",
            conflicts_with = "standalone",
            required_unless_present = "standalone"
        )]
        coordinator: Option<String>,

        /// Name of program to run.
        program: PathBuf,

        /// Program's arguments.
        args: Vec<String>,
    },

    /// Command to coordinate the workers of a parallel job.
    Coordinator {
        /// Debugger configuration (KDL format).
        ///
        /// If it ends with `.kdl`, it is treated as a path to a configuration
        /// file. Otherwise it is directly parsed as inline KDL-formatted
        /// configuration.
        #[clap(short, long, value_name = "CONTENT/PATH", default_value = "")]
        config: String,

        /// Number of workers of the job.
        #[clap(short = 'n', long = "np", value_name = "N")]
        workers: usize,

        /// Name of program run by every worker.
        program: PathBuf,

        /// Program's arguments.
        args: Vec<String>,
    },
}

impl CliOpts {
    /// Parses the CLI from the command-line.
    ///
    /// # Warning
    ///
    /// Exits on error.
    pub fn parse_from_cmdline() -> Self {
        <Self as clap::Parser>::parse()
    }
}
