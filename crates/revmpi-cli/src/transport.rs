use futures_util::{SinkExt, StreamExt};
use miette::IntoDiagnostic;
use revmpi_coordinator::{CommandReceiver, Coordinator};
use revmpi_debugger::WorkerSession;
use revmpi_proto::{
    CoordinatorCodec, CoordinatorMessage, OperationRecord, WorkerCodec, WorkerId, WorkerMessage,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::Instrument;

/// Serves the commands of the coordinator at `addr` until it disconnects
/// or the traced process is quit.
pub async fn serve_coordinator(
    addr: &str,
    mut session: WorkerSession,
    mut events: mpsc::UnboundedReceiver<OperationRecord>,
) -> miette::Result<()> {
    let stream = TcpStream::connect(addr).await.into_diagnostic()?;
    let mut framed = Framed::new(stream, WorkerCodec::default());

    framed
        .send(WorkerMessage::Register { pid: session.pid() })
        .await
        .into_diagnostic()?;

    let worker_id = match framed.next().await {
        Some(Ok(CoordinatorMessage::Registered { worker_id })) => worker_id,
        Some(Ok(msg)) => miette::bail!("unexpected message before registration: {msg:?}"),
        Some(Err(e)) => return Err(e).into_diagnostic(),
        None => miette::bail!("coordinator closed the connection"),
    };

    session.set_worker_id(worker_id).await.into_diagnostic()?;

    let span = tracing::info_span!("worker", id = %worker_id);

    async move {
        tracing::info!(pid = session.pid(), "registered");

        while let Some(msg) = framed.next().await {
            let command = match msg.into_diagnostic()? {
                CoordinatorMessage::Command(command) => command,
                msg => {
                    tracing::warn!(?msg, "unexpected message");
                    continue;
                }
            };

            let quit = command == revmpi_proto::Command::Quit;

            let res = session.apply(command).await.into_diagnostic()?;

            while let Ok(record) = events.try_recv() {
                framed
                    .send(WorkerMessage::Event(record))
                    .await
                    .into_diagnostic()?;
            }

            framed
                .send(WorkerMessage::CommandDone(res))
                .await
                .into_diagnostic()?;

            if quit {
                break;
            }
        }

        tracing::info!("disconnected");

        Ok(())
    }
    .instrument(span)
    .await
}

/// Accepts worker connections forever.
pub async fn accept_workers(listener: TcpListener, coordinator: Coordinator) -> miette::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.into_diagnostic()?;

        tracing::debug!(%peer, "worker connected");

        let coordinator = coordinator.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_worker(stream, coordinator).await {
                tracing::warn!(%peer, error = %e, "worker connection failed");
            }
        });
    }
}

async fn handle_worker(stream: TcpStream, coordinator: Coordinator) -> revmpi_coordinator::Result<()> {
    let mut framed = Framed::new(stream, CoordinatorCodec::default());

    let pid = match framed.next().await.transpose()? {
        Some(WorkerMessage::Register { pid }) => pid,
        _ => return Ok(()),
    };

    let commands = coordinator.register(pid).await?;
    let worker = commands.worker_id();

    framed
        .send(CoordinatorMessage::Registered { worker_id: worker })
        .await?;

    let res = relay_commands(&mut framed, &coordinator, commands).await;

    coordinator.departed(worker);

    res
}

async fn relay_commands(
    framed: &mut Framed<TcpStream, CoordinatorCodec>,
    coordinator: &Coordinator,
    mut commands: CommandReceiver,
) -> revmpi_coordinator::Result<()> {
    let worker = commands.worker_id();

    loop {
        let pending = tokio::select! {
            pending = commands.recv() => match pending {
                Some(pending) => pending,
                None => return Ok(()),
            },
            msg = framed.next() => match msg.transpose()? {
                Some(msg) => {
                    forward_unsolicited(coordinator, worker, msg);
                    continue;
                }
                None => return Err(revmpi_coordinator::Error::WorkerGone(worker)),
            },
        };

        framed
            .send(CoordinatorMessage::Command(pending.command.clone()))
            .await?;

        loop {
            match framed.next().await.transpose()? {
                Some(WorkerMessage::CommandDone(res)) => {
                    pending.respond(res);
                    break;
                }
                Some(msg) => forward_unsolicited(coordinator, worker, msg),
                None => return Err(revmpi_coordinator::Error::WorkerGone(worker)),
            }
        }
    }
}

fn forward_unsolicited(coordinator: &Coordinator, worker: WorkerId, msg: WorkerMessage) {
    match msg {
        WorkerMessage::Event(record) => coordinator.report(record),
        msg => tracing::warn!(%worker, ?msg, "unexpected message"),
    }
}
