// Once clippy takes `clippy.toml` into account (for `tests` targets),
// we can remove these.
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]

use std::collections::BTreeMap;

use revmpi_coordinator::{CommandReceiver, Coordinator, Error};
use revmpi_proto::ops::{self, param};
use revmpi_proto::{CheckpointId, Command, CommandResult, OperationRecord, WorkerId};
use tokio::sync::mpsc;

fn record(cp: &str, op: &str, params: &[(&str, i64)]) -> OperationRecord {
    OperationRecord {
        checkpoint_id: CheckpointId::from(cp),
        op_name: op.to_owned(),
        parameters: params
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        worker_id: WorkerId(u32::MAX),
    }
}

/// Answers commands like a worker would, reporting the next scripted
/// operation on every `Continue`.
fn fake_worker(
    coordinator: Coordinator,
    mut commands: CommandReceiver,
    script: Vec<OperationRecord>,
    seen: mpsc::UnboundedSender<(WorkerId, Command)>,
) {
    tokio::spawn(async move {
        let worker = commands.worker_id();
        let mut script = script.into_iter();

        while let Some(pending) = commands.recv().await {
            seen.send((worker, pending.command.clone())).unwrap();

            let mut result = CommandResult::default();

            match pending.command {
                Command::Continue => {
                    if let Some(mut record) = script.next() {
                        record.worker_id = worker;
                        coordinator.report(record);
                    }
                }
                Command::Quit => result.exited = true,
                _ => (),
            }

            pending.respond(result);
        }
    });
}

async fn setup() -> (Coordinator, mpsc::UnboundedReceiver<(WorkerId, Command)>) {
    let (coordinator, _task) = Coordinator::spawn();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    let sender = coordinator.register(1000).await.unwrap();
    assert_eq!(sender.worker_id(), WorkerId(0));
    fake_worker(
        coordinator.clone(),
        sender,
        vec![record(
            "send000001",
            ops::MPI_SEND,
            &[(param::RANK, 0), (param::DEST, 1), (param::TAG, 5)],
        )],
        seen_tx.clone(),
    );

    let receiver = coordinator.register(1001).await.unwrap();
    assert_eq!(receiver.worker_id(), WorkerId(1));
    fake_worker(
        coordinator.clone(),
        receiver,
        vec![record(
            "recv000001",
            ops::MPI_RECV,
            &[(param::RANK, 1), (param::SOURCE, 0), (param::TAG, 5)],
        )],
        seen_tx,
    );

    (coordinator, seen_rx)
}

#[test_log::test(tokio::test)]
async fn rolling_back_a_receive_restores_its_sender() {
    let (coordinator, mut seen) = setup().await;

    let results = coordinator.broadcast(Command::Continue).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, res)| res.is_ok()));

    while seen.try_recv().is_ok() {}

    let points = coordinator
        .submit_rollback("recv000001".into())
        .await
        .unwrap();

    let cps = points
        .iter()
        .map(|p| (p.worker, p.checkpoint_id.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        cps,
        vec![(WorkerId(0), "send000001"), (WorkerId(1), "recv000001")]
    );

    let results = coordinator.commit(true).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, res)| res.is_ok()));

    let mut restores = Vec::new();
    while let Ok(cmd) = seen.try_recv() {
        restores.push(cmd);
    }
    restores.sort_by_key(|(worker, _)| *worker);

    assert_eq!(
        restores,
        vec![
            (
                WorkerId(0),
                Command::Restore {
                    checkpoint: "send000001".into()
                }
            ),
            (
                WorkerId(1),
                Command::Restore {
                    checkpoint: "recv000001".into()
                }
            ),
        ]
    );

    let listing = coordinator.causal_log().await.unwrap();
    assert_eq!(listing.matches("[current]").count(), 2);

    assert!(matches!(
        coordinator.commit(true).await,
        Err(Error::NoPendingRollback)
    ));
}

#[test_log::test(tokio::test)]
async fn progress_clears_current_location() {
    let (coordinator, _seen) = setup().await;

    coordinator.broadcast(Command::Continue).await.unwrap();
    coordinator
        .submit_rollback("send000001".into())
        .await
        .unwrap();
    coordinator.commit(true).await.unwrap();

    coordinator
        .send_command(WorkerId(0), Command::SingleStep)
        .await
        .unwrap();
    coordinator
        .send_command(WorkerId(1), Command::SingleStep)
        .await
        .unwrap();

    let listing = coordinator.causal_log().await.unwrap();
    assert!(!listing.contains("[current]"));
    assert!(listing.contains("send000001 MPI_Send tag=5 <-> worker 1 recv000001"));
}

#[test_log::test(tokio::test)]
async fn discarded_rollback_restores_nothing() {
    let (coordinator, mut seen) = setup().await;

    coordinator.broadcast(Command::Continue).await.unwrap();
    while seen.try_recv().is_ok() {}

    coordinator
        .submit_rollback("recv000001".into())
        .await
        .unwrap();

    let results = coordinator.commit(false).await.unwrap();
    assert!(results.is_empty());
    assert!(seen.try_recv().is_err());

    let listing = coordinator.causal_log().await.unwrap();
    assert!(!listing.contains("[current]"));
}

#[test_log::test(tokio::test)]
async fn rollback_requests_are_validated() {
    let (coordinator, _seen) = setup().await;

    assert!(matches!(
        coordinator.submit_rollback("unknown000".into()).await,
        Err(Error::CheckpointNotFound(_))
    ));

    coordinator.report(OperationRecord {
        worker_id: WorkerId(0),
        ..record("final00001", ops::MPI_FINALIZE, &[(param::RANK, 0)])
    });

    assert!(matches!(
        coordinator.submit_rollback("final00001".into()).await,
        Err(Error::NotRestorable { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn exited_and_departed_workers_stop_receiving_commands() {
    let (coordinator, _seen) = setup().await;

    let res = coordinator
        .send_command(WorkerId(0), Command::Quit)
        .await
        .unwrap();
    assert!(res.exited);

    assert_eq!(coordinator.workers().await.unwrap(), vec![WorkerId(1)]);
    assert!(matches!(
        coordinator.send_command(WorkerId(0), Command::Continue).await,
        Err(Error::WorkerExited(WorkerId(0)))
    ));

    coordinator.departed(WorkerId(1));

    assert!(coordinator.workers().await.unwrap().is_empty());
    assert!(matches!(
        coordinator.send_command(WorkerId(1), Command::Continue).await,
        Err(Error::UnknownWorker(WorkerId(1)))
    ));
}

#[test_log::test(tokio::test)]
async fn closed_connection_is_reported() {
    let (coordinator, _task) = Coordinator::spawn();

    let commands = coordinator.register(42).await.unwrap();
    let worker = commands.worker_id();
    drop(commands);

    assert!(matches!(
        coordinator.send_command(worker, Command::SingleStep).await,
        Err(Error::WorkerGone(_))
    ));
}
