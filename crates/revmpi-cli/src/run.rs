use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::IntoDiagnostic;
use revmpi_coordinator::Coordinator;
use revmpi_debugger::WorkerSession;
use revmpi_proto::{Command, CommandResult, OperationRecord, WorkerId};
use tokio::net::TcpListener;
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::config::parse_config;
use crate::console::Console;
use crate::prompt::{COORDINATOR_HELP, CoordinatorInput, PromptParser, Target};
use crate::transport::{accept_workers, serve_coordinator};

const WORKER_PROMPT: &str = "(revmpi) ";
const COORDINATOR_PROMPT: &str = "(revmpi-coordinator) ";

const REGISTRATION_POLL: Duration = Duration::from_millis(100);

/// Runs the subcommand for tracing one worker process.
pub fn evaluate_worker(
    config: String,
    coordinator: Option<String>,
    program: PathBuf,
    args: Vec<String>,
) -> miette::Result<i32> {
    let config = parse_config(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(async move {
        let (events_tx, events) = mpsc::unbounded_channel();

        let session = WorkerSession::launch(
            program,
            args,
            config.debugger_config(),
            Box::new(events_tx),
        )
        .await
        .inspect_err(|e| tracing::error!(error = %e, "failed to launch worker"))
        .into_diagnostic()?;

        let res = match coordinator {
            Some(addr) => serve_coordinator(&addr, session, events).await,
            None => worker_prompt(session, events).await,
        };

        res.inspect_err(|e| tracing::error!(error = %e, "worker stopped"))?;

        Ok(0)
    })
}

async fn worker_prompt(
    mut session: WorkerSession,
    mut events: mpsc::UnboundedReceiver<OperationRecord>,
) -> miette::Result<()> {
    let parser = PromptParser::new().into_diagnostic()?;
    let mut console = Console::new();

    while let Some(line) = console.read_line(WORKER_PROMPT).await? {
        let command = match parser.parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                console.print(e).await?;
                continue;
            }
        };

        let quit = command == Command::Quit;

        let res = session.apply(command).await.into_diagnostic()?;

        while let Ok(record) = events.try_recv() {
            console.print_event(&record).await?;
        }

        console.print_result(None, &res).await?;

        if quit {
            break;
        }
    }

    Ok(())
}

/// Runs the subcommand for coordinating the workers of a parallel job.
pub fn evaluate_coordinator(
    config_arg: String,
    num_workers: usize,
    program: PathBuf,
    args: Vec<String>,
) -> miette::Result<i32> {
    let config = parse_config(&config_arg)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(async move {
        let (coordinator, _task) = Coordinator::spawn();

        let listener = TcpListener::bind(("0.0.0.0", config.coordinator_port))
            .await
            .into_diagnostic()?;
        let port = listener.local_addr().into_diagnostic()?.port();

        tracing::info!(port, "listening for workers");

        tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                if let Err(e) = accept_workers(listener, coordinator).await {
                    tracing::error!(error = %e, "stopped accepting workers");
                }
            }
        });

        let mut launcher = match &config.launcher {
            Some(launcher) => Some(launch_workers(
                launcher,
                num_workers,
                &config_arg,
                port,
                &program,
                &args,
            )?),
            None => None,
        };

        let mut console = Console::new();

        wait_for_workers(&coordinator, num_workers, launcher.as_mut(), &mut console).await?;

        coordinator_prompt(&coordinator, &mut console).await?;

        if let Some(mut launcher) = launcher {
            let status = launcher.wait().await.into_diagnostic()?;
            tracing::debug!(%status, "launcher exited");
        }

        Ok(0)
    })
}

fn launch_workers(
    launcher: &str,
    num_workers: usize,
    config: &str,
    port: u16,
    program: &Path,
    args: &[String],
) -> miette::Result<Child> {
    let revmpi = std::env::current_exe().into_diagnostic()?;

    tracing::info!(launcher, num_workers, "launching workers");

    tokio::process::Command::new(launcher)
        .arg("-np")
        .arg(num_workers.to_string())
        .arg(revmpi)
        .arg("worker")
        .arg("--config")
        .arg(config)
        .arg("--coordinator")
        .arg(format!("127.0.0.1:{port}"))
        .arg(program)
        .args(args)
        .spawn()
        .into_diagnostic()
}

async fn wait_for_workers(
    coordinator: &Coordinator,
    num_workers: usize,
    mut launcher: Option<&mut Child>,
    console: &mut Console,
) -> miette::Result<()> {
    console
        .print(format_args!("waiting for {num_workers} workers"))
        .await?;

    loop {
        let registered = coordinator.workers().await.into_diagnostic()?.len();

        if registered >= num_workers {
            break;
        }

        let launcher_status = match launcher.as_deref_mut() {
            Some(launcher) => launcher.try_wait().into_diagnostic()?,
            None => None,
        };

        if let Some(status) = launcher_status {
            miette::bail!(
                "launcher exited ({status}) with {registered} of {num_workers} workers registered"
            );
        }

        tokio::time::sleep(REGISTRATION_POLL).await;
    }

    console
        .print(format_args!("{num_workers} workers registered (type `help`)"))
        .await
}

async fn coordinator_prompt(coordinator: &Coordinator, console: &mut Console) -> miette::Result<()> {
    let parser = PromptParser::new().into_diagnostic()?;

    loop {
        let Some(line) = console.read_line(COORDINATOR_PROMPT).await? else {
            quit_workers(coordinator, console).await?;
            break;
        };

        let input = match parser.parse_coordinator(&line) {
            Ok(input) => input,
            Err(e) => {
                console.print(e).await?;
                continue;
            }
        };

        match input {
            CoordinatorInput::Dispatch {
                target: Target::All,
                command,
            } => match coordinator.broadcast(command).await {
                Ok(results) => print_results(console, results).await?,
                Err(e) => console.print(format_args!("error: {e}")).await?,
            },
            CoordinatorInput::Dispatch {
                target: Target::Worker(worker),
                command,
            } => {
                let res = coordinator.send_command(worker, command).await;
                print_results(console, vec![(worker, res)]).await?;
            }
            CoordinatorInput::Rollback(checkpoint) => {
                rollback(coordinator, console, checkpoint).await?;
            }
            CoordinatorInput::CausalLog => match coordinator.causal_log().await {
                Ok(listing) => console.print(listing.trim_end()).await?,
                Err(e) => console.print(format_args!("error: {e}")).await?,
            },
            CoordinatorInput::Help => console.print(COORDINATOR_HELP).await?,
            CoordinatorInput::Quit => {
                quit_workers(coordinator, console).await?;
                break;
            }
        }
    }

    Ok(())
}

#[tracing::instrument(skip_all, fields(%checkpoint))]
async fn rollback(
    coordinator: &Coordinator,
    console: &mut Console,
    checkpoint: revmpi_proto::CheckpointId,
) -> miette::Result<()> {
    let points = match coordinator.submit_rollback(checkpoint).await {
        Ok(points) => points,
        Err(e) => return console.print(format_args!("error: {e}")).await,
    };

    console.print("rollback points:").await?;

    for point in &points {
        console
            .print(format_args!(
                "  worker {}: {}",
                point.worker, point.checkpoint_id
            ))
            .await?;
    }

    let answer = console.read_line("apply rollback? [y/n] ").await?;
    let execute = answer.is_some_and(|answer| answer.eq_ignore_ascii_case("y"));

    match coordinator.commit(execute).await {
        Ok(_) if !execute => console.print("rollback discarded").await,
        Ok(results) => print_results(console, results).await,
        Err(e) => console.print(format_args!("error: {e}")).await,
    }
}

async fn quit_workers(coordinator: &Coordinator, console: &mut Console) -> miette::Result<()> {
    match coordinator.broadcast(Command::Quit).await {
        Ok(results) => print_results(console, results).await,
        Err(e) => console.print(format_args!("error: {e}")).await,
    }
}

async fn print_results(
    console: &mut Console,
    results: Vec<(WorkerId, revmpi_coordinator::Result<CommandResult>)>,
) -> miette::Result<()> {
    for (worker, res) in results {
        match res {
            Ok(res) => console.print_result(Some(worker), &res).await?,
            Err(e) => console.print(format_args!("[{worker}] error: {e}")).await?,
        }
    }

    Ok(())
}
