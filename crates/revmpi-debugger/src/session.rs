use std::mem;
use std::path::PathBuf;

use revmpi_proto::{Command, CommandResult, WorkerId};
use tokio::sync::{mpsc, oneshot};

use crate::dispatcher::{DebuggerConfig, Dispatcher};
use crate::interceptor::EventSink;

/// Asynchronous handle to a traced worker process.
///
/// Tracing requests must all come from the thread that spawned the
/// process, so a [Dispatcher] is owned by a dedicated `tracer` thread which
/// receives the commands of this handle, one at a time.
pub struct WorkerSession {
    tx: mpsc::UnboundedSender<TracerRequest>,
    pid: u32,
    tracer: TracerState,
}

enum TracerState {
    Running(oneshot::Receiver<crate::Result<()>>),
    Failed,
}

enum TracerRequest {
    SetWorkerId(WorkerId),
    Apply {
        command: Command,
        reply: oneshot::Sender<crate::Result<CommandResult>>,
    },
}

impl WorkerSession {
    /// Launches `target` under trace, from a new `tracer` thread.
    pub async fn launch(
        target: PathBuf,
        args: Vec<String>,
        config: DebuggerConfig,
        sink: Box<dyn EventSink>,
    ) -> crate::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("tracer".to_owned())
            .spawn(move || {
                let dispatcher = match Dispatcher::launch(&target, &args, &config, sink) {
                    Ok(dispatcher) => {
                        let _ = ready_tx.send(Ok(dispatcher.process().id()));
                        dispatcher
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = done_tx.send(run_tracer(dispatcher, rx));
            })
            .map_err(crate::Error::TracerSpawn)?;

        let pid = ready_rx.await.map_err(|_| crate::Error::TracerGone)??;

        Ok(Self {
            tx,
            pid,
            tracer: TracerState::Running(done_rx),
        })
    }

    /// PID of the traced process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sets the worker ID stamped on reported operations.
    pub async fn set_worker_id(&mut self, worker_id: WorkerId) -> crate::Result<()> {
        self.send_request(TracerRequest::SetWorkerId(worker_id))
            .await
    }

    /// Applies a command to the traced process.
    ///
    /// An `Err` is fatal: the tracer thread is gone.
    pub async fn apply(&mut self, command: Command) -> crate::Result<CommandResult> {
        let (reply, reply_rx) = oneshot::channel();

        self.send_request(TracerRequest::Apply { command, reply })
            .await?;

        match reply_rx.await {
            Ok(Ok(res)) => Ok(res),
            Ok(Err(_)) | Err(_) => Err(self.tracer_failure().await),
        }
    }

    async fn send_request(&mut self, request: TracerRequest) -> crate::Result<()> {
        if self.tx.send(request).is_ok() {
            return Ok(());
        }

        Err(self.tracer_failure().await)
    }

    async fn tracer_failure(&mut self) -> crate::Error {
        match mem::replace(&mut self.tracer, TracerState::Failed) {
            TracerState::Running(done) => match done.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) | Err(_) => crate::Error::TracerGone,
            },
            TracerState::Failed => crate::Error::TracerGone,
        }
    }
}

fn run_tracer(
    mut dispatcher: Dispatcher,
    mut rx: mpsc::UnboundedReceiver<TracerRequest>,
) -> crate::Result<()> {
    while let Some(request) = rx.blocking_recv() {
        match request {
            TracerRequest::SetWorkerId(worker_id) => dispatcher.set_worker_id(worker_id),
            TracerRequest::Apply { command, reply } => match dispatcher.apply(&command) {
                Ok(res) => {
                    let _ = reply.send(Ok(res));
                }
                Err(e) => {
                    tracing::error!(error = %e, "tracer stopped");
                    let _ = reply.send(Err(crate::Error::TracerGone));
                    return Err(e);
                }
            },
        }
    }

    tracing::debug!(pid = dispatcher.process().id(), "tracer thread done");

    Ok(())
}
