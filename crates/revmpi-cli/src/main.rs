#![allow(missing_docs)]
#![allow(clippy::print_stderr)]

use revmpi_cli::{CliAction, CliOpts};

use tracing_subscriber::EnvFilter;

fn main() {
    let cli = CliOpts::parse_from_cmdline();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("REVMPI_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let res = match cli.action {
        CliAction::Worker {
            config,
            // clap makes it the negation of `coordinator`
            standalone: _,
            coordinator,
            program,
            args,
        } => revmpi_cli::evaluate_worker(config, coordinator, program, args),
        CliAction::Coordinator {
            config,
            workers,
            program,
            args,
        } => revmpi_cli::evaluate_coordinator(config, workers, program, args),
    };

    match res {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    }
}
