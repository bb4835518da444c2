use indexmap::IndexMap;
use revmpi_proto::{CheckpointId, Command, CommandResult, OperationRecord, WorkerId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::log::{CausalLog, RollbackPoint};

/// Handle to the coordinator.
///
/// The causal log is owned by a single processing task. Every handle
/// method is a request to that task, so that event reports, progress
/// notifications and rollbacks never interleave.
///
/// Worker connections are transport-agnostic: a worker registers and gets
/// a [CommandReceiver], from which it takes the commands to apply.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::UnboundedSender<Request>,
}

/// Commands addressed to one worker.
pub struct CommandReceiver {
    worker: WorkerId,
    rx: mpsc::UnboundedReceiver<PendingCommand>,
}

/// A command waiting for its result.
pub struct PendingCommand {
    /// Command to apply.
    pub command: Command,
    reply: oneshot::Sender<CommandResult>,
}

#[derive(Clone)]
struct WorkerLink {
    worker: WorkerId,
    tx: mpsc::UnboundedSender<PendingCommand>,
}

struct WorkerEntry {
    pid: u32,
    link: WorkerLink,
    exited: bool,
}

enum Request {
    Register {
        pid: u32,
        commands: mpsc::UnboundedSender<PendingCommand>,
        reply: oneshot::Sender<WorkerId>,
    },
    Event(OperationRecord),
    Exited(WorkerId),
    Departed(WorkerId),
    Workers {
        reply: oneshot::Sender<Vec<WorkerId>>,
    },
    Link {
        worker: WorkerId,
        command: Command,
        reply: oneshot::Sender<crate::Result<WorkerLink>>,
    },
    SubmitRollback {
        checkpoint: CheckpointId,
        reply: oneshot::Sender<crate::Result<Vec<RollbackPoint>>>,
    },
    Commit {
        execute: bool,
        reply: oneshot::Sender<crate::Result<Vec<(RollbackPoint, crate::Result<WorkerLink>)>>>,
    },
    Listing {
        reply: oneshot::Sender<String>,
    },
}

struct CoordinatorCore {
    rx: mpsc::UnboundedReceiver<Request>,
    log: CausalLog,
    workers: IndexMap<WorkerId, WorkerEntry>,
    next_worker_id: u32,
    pending: Option<Vec<RollbackPoint>>,
}

impl Coordinator {
    /// Spawns the processing task on the current Tokio runtime.
    ///
    /// The task stops once every handle is dropped.
    pub fn spawn() -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let core = CoordinatorCore {
            rx,
            log: CausalLog::new(),
            workers: IndexMap::new(),
            next_worker_id: 0,
            pending: None,
        };

        (Self { tx }, tokio::spawn(core.run()))
    }

    /// Registers a worker by the PID of its traced process.
    pub async fn register(&self, pid: u32) -> crate::Result<CommandReceiver> {
        let (commands, rx) = mpsc::unbounded_channel();

        let worker = self
            .request(|reply| Request::Register {
                pid,
                commands,
                reply,
            })
            .await?;

        Ok(CommandReceiver { worker, rx })
    }

    /// Records an operation reported by a worker.
    pub fn report(&self, record: OperationRecord) {
        self.notify(Request::Event(record));
    }

    /// Removes a worker whose connection closed.
    pub fn departed(&self, worker: WorkerId) {
        self.notify(Request::Departed(worker));
    }

    /// Registered workers whose process is still alive.
    pub async fn workers(&self) -> crate::Result<Vec<WorkerId>> {
        self.request(|reply| Request::Workers { reply }).await
    }

    /// Applies a command on one worker.
    ///
    /// A forward-progress command first clears the worker's current
    /// location in the causal log.
    pub async fn send_command(&self, worker: WorkerId, command: Command) -> crate::Result<CommandResult> {
        let link = self
            .request(|reply| Request::Link {
                worker,
                command: command.clone(),
                reply,
            })
            .await??;

        let res = link.send(command).await?;

        if res.exited {
            self.notify(Request::Exited(worker));
        }

        Ok(res)
    }

    /// Applies a command on every live worker, concurrently.
    ///
    /// Results are sorted by worker ID.
    pub async fn broadcast(&self, command: Command) -> crate::Result<Vec<(WorkerId, crate::Result<CommandResult>)>> {
        let workers = self.workers().await?;

        let mut tasks = JoinSet::new();

        for worker in workers {
            let this = self.clone();
            let command = command.clone();

            tasks.spawn(async move { (worker, this.send_command(worker, command).await) });
        }

        Ok(collect_sorted(tasks).await)
    }

    /// Computes the rollback closure of a checkpoint, and keeps it pending
    /// until [commit](Self::commit).
    #[tracing::instrument(skip(self))]
    pub async fn submit_rollback(&self, checkpoint: CheckpointId) -> crate::Result<Vec<RollbackPoint>> {
        self.request(|reply| Request::SubmitRollback { checkpoint, reply })
            .await?
    }

    /// Applies (or discards) the pending rollback.
    ///
    /// When applied, every worker of the closure restores its checkpoint,
    /// concurrently. Results are sorted by worker ID.
    #[tracing::instrument(skip(self))]
    pub async fn commit(&self, execute: bool) -> crate::Result<Vec<(WorkerId, crate::Result<CommandResult>)>> {
        let targets = self
            .request(|reply| Request::Commit { execute, reply })
            .await??;

        let mut tasks = JoinSet::new();

        for (point, link) in targets {
            let this = self.clone();

            tasks.spawn(async move {
                let command = Command::Restore {
                    checkpoint: point.checkpoint_id,
                };

                let res = match link {
                    Ok(link) => link.send(command).await,
                    Err(e) => Err(e),
                };

                if let Ok(CommandResult { exited: true, .. }) = res {
                    this.notify(Request::Exited(point.worker));
                }

                (point.worker, res)
            });
        }

        Ok(collect_sorted(tasks).await)
    }

    /// Textual listing of the causal log.
    pub async fn causal_log(&self) -> crate::Result<String> {
        self.request(|reply| Request::Listing { reply }).await
    }

    fn notify(&self, request: Request) {
        if self.tx.send(request).is_err() {
            tracing::warn!("coordinator stopped");
        }
    }

    async fn request<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> crate::Result<T> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(request(reply))
            .map_err(|_| crate::Error::CoordinatorGone)?;

        rx.await.map_err(|_| crate::Error::CoordinatorGone)
    }
}

async fn collect_sorted<T: 'static>(mut tasks: JoinSet<(WorkerId, crate::Result<T>)>) -> Vec<(WorkerId, crate::Result<T>)> {
    let mut results = Vec::new();

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(res) => results.push(res),
            Err(e) => tracing::error!(error = %e, "command task failed"),
        }
    }

    results.sort_by_key(|(worker, _)| *worker);
    results
}

impl CommandReceiver {
    /// ID assigned to the worker.
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Next command to apply, or `None` once the coordinator is gone.
    pub async fn recv(&mut self) -> Option<PendingCommand> {
        self.rx.recv().await
    }
}

impl PendingCommand {
    /// Sends the result of the command back.
    pub fn respond(self, result: CommandResult) {
        let _ = self.reply.send(result);
    }
}

impl WorkerLink {
    async fn send(&self, command: Command) -> crate::Result<CommandResult> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(PendingCommand { command, reply })
            .map_err(|_| crate::Error::WorkerGone(self.worker))?;

        rx.await.map_err(|_| crate::Error::WorkerGone(self.worker))
    }
}

impl CoordinatorCore {
    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            self.handle(request);
        }

        tracing::debug!("coordinator stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Register {
                pid,
                commands,
                reply,
            } => {
                let worker = WorkerId(self.next_worker_id);
                self.next_worker_id += 1;

                self.workers.insert(
                    worker,
                    WorkerEntry {
                        pid,
                        link: WorkerLink {
                            worker,
                            tx: commands,
                        },
                        exited: false,
                    },
                );

                tracing::info!(%worker, pid, "worker registered");

                let _ = reply.send(worker);
            }
            Request::Event(record) => {
                tracing::debug!(worker = %record.worker_id, op = %record.op_name, checkpoint = %record.checkpoint_id, "event");
                self.log.record(&record);
            }
            Request::Exited(worker) => {
                if let Some(entry) = self.workers.get_mut(&worker) {
                    entry.exited = true;
                    tracing::info!(%worker, pid = entry.pid, "worker process exited");
                }
            }
            Request::Departed(worker) => {
                if let Some(entry) = self.workers.shift_remove(&worker) {
                    tracing::info!(%worker, pid = entry.pid, "worker departed");
                }
            }
            Request::Workers { reply } => {
                let workers = self
                    .workers
                    .iter()
                    .filter(|(_, entry)| !entry.exited)
                    .map(|(worker, _)| *worker)
                    .collect();

                let _ = reply.send(workers);
            }
            Request::Link {
                worker,
                command,
                reply,
            } => {
                let link = self.link(worker);

                if link.is_ok() && command.is_forward_progress() {
                    self.log.notify_progress(worker);
                }

                let _ = reply.send(link);
            }
            Request::SubmitRollback { checkpoint, reply } => {
                let closure = self.log.rollback_closure(&checkpoint);

                match &closure {
                    Ok(points) => {
                        tracing::info!(%checkpoint, workers = points.len(), "rollback pending");
                        self.pending = Some(points.clone());
                    }
                    Err(e) => tracing::debug!(error = %e, "rollback rejected"),
                }

                let _ = reply.send(closure);
            }
            Request::Commit { execute, reply } => {
                let Some(points) = self.pending.take() else {
                    let _ = reply.send(Err(crate::Error::NoPendingRollback));
                    return;
                };

                if !execute {
                    tracing::info!("rollback discarded");
                    let _ = reply.send(Ok(Vec::new()));
                    return;
                }

                self.log.apply_rollback(&points);

                let targets = points
                    .into_iter()
                    .map(|point| {
                        let link = self.link(point.worker);
                        (point, link)
                    })
                    .collect();

                let _ = reply.send(Ok(targets));
            }
            Request::Listing { reply } => {
                let _ = reply.send(self.log.to_string());
            }
        }
    }

    fn link(&self, worker: WorkerId) -> crate::Result<WorkerLink> {
        match self.workers.get(&worker) {
            Some(entry) if entry.exited => Err(crate::Error::WorkerExited(worker)),
            Some(entry) => Ok(entry.link.clone()),
            None => Err(crate::Error::UnknownWorker(worker)),
        }
    }
}
