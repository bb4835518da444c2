use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use revmpi_proto::ops::{self, param};
use revmpi_proto::{CheckpointId, OperationRecord, WorkerId};

/// Stable index of a [CausalRecord] in a [CausalLog].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(usize);

/// One operation reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalRecord {
    /// Index in the log arena.
    pub id: RecordId,

    /// Reporting worker.
    pub worker: WorkerId,

    /// Rank of the reporting worker, if known.
    pub rank: Option<i64>,

    /// Checkpoint taken at the operation.
    pub checkpoint_id: CheckpointId,

    /// Operation name.
    pub op_name: String,

    /// Message tag, if captured.
    pub tag: Option<i64>,

    /// Destination rank of a send, or source rank of a receive.
    pub peer_rank: Option<i64>,

    /// Whether the operation sends a message.
    pub is_send: bool,

    /// Record of the peer worker exchanging the same message.
    pub matched: Option<RecordId>,

    /// Whether the worker was rolled back to this record and has not
    /// progressed since.
    pub current_location: bool,

    seq: usize,
}

/// A worker to roll back, and the record to roll it back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPoint {
    /// Worker to roll back.
    pub worker: WorkerId,

    /// Record to roll back to.
    pub record: RecordId,

    /// Checkpoint to restore on the worker.
    pub checkpoint_id: CheckpointId,
}

#[derive(Debug, Default)]
struct WorkerLog {
    rank: Option<i64>,
    events: Vec<RecordId>,
}

/// Per-worker ordered logs of operations, with send/receive matching.
///
/// Records live in an arena and refer to their match by [RecordId], and
/// matching is always symmetric.
///
/// A send is matched against the earliest unmatched receive of the
/// destination rank with a compatible tag (and the other way around). This
/// assumes messages of the same tag are received in the order they were
/// sent.
#[derive(Debug, Default)]
pub struct CausalLog {
    records: Vec<CausalRecord>,
    workers: IndexMap<WorkerId, WorkerLog>,
}

impl CausalRecord {
    /// Whether this is a send or a receive.
    pub fn is_message(&self) -> bool {
        self.is_send || self.op_name == ops::MPI_RECV
    }

    /// Position of the record in the log of its worker.
    pub fn position(&self) -> usize {
        self.seq
    }
}

impl CausalLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record with this ID.
    pub fn get(&self, id: RecordId) -> Option<&CausalRecord> {
        self.records.get(id.0)
    }

    /// Rank of a worker, learned from its first send or receive.
    pub fn rank_of(&self, worker: WorkerId) -> Option<i64> {
        self.workers.get(&worker).and_then(|log| log.rank)
    }

    /// Live records of a worker, oldest first.
    pub fn events(&self, worker: WorkerId) -> impl Iterator<Item = &CausalRecord> {
        self.workers
            .get(&worker)
            .into_iter()
            .flat_map(move |log| log.events.iter().map(move |id| &self.records[id.0]))
    }

    /// Live record of a checkpoint.
    pub fn find(&self, checkpoint: &CheckpointId) -> Option<&CausalRecord> {
        self.workers
            .values()
            .flat_map(|log| log.events.iter())
            .map(|id| &self.records[id.0])
            .find(|r| &r.checkpoint_id == checkpoint)
    }

    /// Appends an operation to the log of its worker, and links it to the
    /// matching operation of its peer, if any.
    pub fn record(&mut self, event: &OperationRecord) -> RecordId {
        let is_send = ops::is_send_event(&event.op_name);
        let is_message = is_send || event.op_name == ops::MPI_RECV;

        let log = self.workers.entry(event.worker_id).or_default();

        if is_message && log.rank.is_none() {
            log.rank = event.integer_param(param::RANK);

            if let Some(rank) = log.rank {
                tracing::debug!(worker = %event.worker_id, rank, "worker rank known");
            }
        }

        let peer_param = if is_send { param::DEST } else { param::SOURCE };

        let id = RecordId(self.records.len());

        self.records.push(CausalRecord {
            id,
            worker: event.worker_id,
            rank: log.rank,
            checkpoint_id: event.checkpoint_id.clone(),
            op_name: event.op_name.clone(),
            tag: event.integer_param(param::TAG).filter(|_| is_message),
            peer_rank: event.integer_param(peer_param).filter(|_| is_message),
            is_send,
            matched: None,
            current_location: false,
            seq: log.events.len(),
        });

        log.events.push(id);

        if let Some(peer) = self.try_match(id) {
            tracing::debug!(
                checkpoint = %self.records[id.0].checkpoint_id,
                peer = %self.records[peer.0].checkpoint_id,
                "operations matched"
            );
        }

        id
    }

    /// Clears the current location of a worker, which is about to execute
    /// past it, and matches its record again.
    pub fn notify_progress(&mut self, worker: WorkerId) {
        let Some(log) = self.workers.get(&worker) else {
            return;
        };

        let Some(id) = log
            .events
            .iter()
            .copied()
            .find(|id| self.records[id.0].current_location)
        else {
            return;
        };

        self.records[id.0].current_location = false;

        if let Some(peer) = self.try_match(id) {
            tracing::debug!(
                checkpoint = %self.records[id.0].checkpoint_id,
                peer = %self.records[peer.0].checkpoint_id,
                "operations matched after rollback"
            );
        }
    }

    /// Computes the checkpoints every worker must be rolled back to, so that
    /// rolling back to `checkpoint` leaves no message received but not sent.
    ///
    /// Starting from the owner of `checkpoint`, every matched operation
    /// at or after a worker's rollback point pulls the peer worker back to
    /// the matching operation, until a fixed point.
    pub fn rollback_closure(&self, checkpoint: &CheckpointId) -> crate::Result<Vec<RollbackPoint>> {
        let target = self
            .find(checkpoint)
            .ok_or_else(|| crate::Error::CheckpointNotFound(checkpoint.clone()))?;

        if !ops::is_restorable(&target.op_name) {
            return Err(crate::Error::NotRestorable {
                checkpoint: checkpoint.clone(),
                op_name: target.op_name.clone(),
            });
        }

        let mut points = BTreeMap::from([(target.worker, target.id)]);

        loop {
            let mut updates = Vec::new();

            for (worker, point) in &points {
                let Some(log) = self.workers.get(worker) else {
                    continue;
                };

                let start = self.records[point.0].seq;

                for id in &log.events[start..] {
                    let Some(peer) = self.records[id.0].matched else {
                        continue;
                    };

                    updates.push(&self.records[peer.0]);
                }
            }

            let mut changed = false;

            for peer in updates {
                let behind = match points.get(&peer.worker) {
                    Some(current) => self.records[current.0].seq > peer.seq,
                    None => true,
                };

                if behind {
                    points.insert(peer.worker, peer.id);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        Ok(points
            .into_iter()
            .map(|(worker, record)| RollbackPoint {
                worker,
                record,
                checkpoint_id: self.records[record.0].checkpoint_id.clone(),
            })
            .collect())
    }

    /// Rolls the logs back.
    ///
    /// Each worker's log is truncated past its rollback point, which becomes
    /// its current location. Matches of the dropped records and of the
    /// rollback points are undone on both sides.
    pub fn apply_rollback(&mut self, points: &[RollbackPoint]) {
        for point in points {
            let Some(log) = self.workers.get_mut(&point.worker) else {
                continue;
            };

            let seq = self.records[point.record.0].seq;

            let dropped = log.events.drain(seq + 1..).collect::<Vec<_>>();
            let kept = log.events.clone();

            tracing::debug!(worker = %point.worker, dropped = dropped.len(), "log truncated");

            for id in dropped.into_iter().chain([point.record]) {
                self.unlink(id);
            }

            for id in kept {
                self.records[id.0].current_location = id == point.record;
            }
        }
    }

    fn unlink(&mut self, id: RecordId) {
        if let Some(peer) = self.records[id.0].matched.take() {
            self.records[peer.0].matched = None;
        }
    }

    fn try_match(&mut self, id: RecordId) -> Option<RecordId> {
        let record = &self.records[id.0];

        if !record.is_message() || record.matched.is_some() || record.current_location {
            return None;
        }

        let peer_rank = record.peer_rank?;

        let peer = self
            .workers
            .iter()
            .filter(|(worker, log)| **worker != record.worker && log.rank == Some(peer_rank))
            .flat_map(|(_, log)| log.events.iter())
            .map(|id| &self.records[id.0])
            .find(|candidate| pairs_with(record, candidate))?
            .id;

        self.records[id.0].matched = Some(peer);
        self.records[peer.0].matched = Some(id);

        Some(peer)
    }
}

fn pairs_with(record: &CausalRecord, candidate: &CausalRecord) -> bool {
    candidate.is_message()
        && candidate.is_send != record.is_send
        && candidate.matched.is_none()
        && !candidate.current_location
        && tags_match(record.tag, candidate.tag)
        && ranks_match(candidate.peer_rank, record.rank)
}

fn tags_match(a: Option<i64>, b: Option<i64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b || a == ops::ANY_TAG || b == ops::ANY_TAG,
        _ => true,
    }
}

fn ranks_match(a: Option<i64>, b: Option<i64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

impl fmt::Display for CausalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (worker, log) in &self.workers {
            match log.rank {
                Some(rank) => writeln!(f, "worker {worker} (rank {rank}):")?,
                None => writeln!(f, "worker {worker}:")?,
            }

            for id in &log.events {
                let record = &self.records[id.0];

                write!(f, "  {} {}", record.checkpoint_id, record.op_name)?;

                if let Some(tag) = record.tag {
                    write!(f, " tag={tag}")?;
                }

                if let Some(peer) = record.matched.map(|id| &self.records[id.0]) {
                    write!(f, " <-> worker {} {}", peer.worker, peer.checkpoint_id)?;
                }

                if record.current_location {
                    f.write_str(" [current]")?;
                }

                writeln!(f)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use revmpi_proto::ops::{self, param};
    use revmpi_proto::{CheckpointId, OperationRecord, WorkerId};

    use super::{CausalLog, RollbackPoint};

    fn event(worker: u32, cp: &str, op: &str, params: &[(&str, i64)]) -> OperationRecord {
        OperationRecord {
            checkpoint_id: CheckpointId::from(cp),
            op_name: op.to_owned(),
            parameters: params
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            worker_id: WorkerId(worker),
        }
    }

    fn send(worker: u32, cp: &str, rank: i64, dest: i64, tag: i64) -> OperationRecord {
        event(
            worker,
            cp,
            ops::MPI_SEND,
            &[(param::RANK, rank), (param::DEST, dest), (param::TAG, tag)],
        )
    }

    fn recv(worker: u32, cp: &str, rank: i64, source: i64, tag: i64) -> OperationRecord {
        event(
            worker,
            cp,
            ops::MPI_RECV,
            &[(param::RANK, rank), (param::SOURCE, source), (param::TAG, tag)],
        )
    }

    fn closure_of(log: &CausalLog, cp: &str) -> Vec<(u32, String)> {
        log.rollback_closure(&cp.into())
            .unwrap()
            .into_iter()
            .map(|p| (p.worker.0, p.checkpoint_id.as_str().to_owned()))
            .collect()
    }

    fn assert_symmetric(log: &CausalLog) {
        for record in &log.records {
            if let Some(peer) = record.matched {
                assert_eq!(log.get(peer).unwrap().matched, Some(record.id));
            }
        }
    }

    #[test]
    fn receive_rollback_pulls_matching_send() {
        let mut log = CausalLog::new();

        let s = log.record(&send(1, "s1", 0, 1, 5));
        let r = log.record(&recv(2, "r1", 1, 0, 5));

        assert_eq!(log.get(s).unwrap().matched, Some(r));
        assert_eq!(log.get(r).unwrap().matched, Some(s));

        assert_eq!(
            closure_of(&log, "r1"),
            vec![(1, "s1".to_owned()), (2, "r1".to_owned())]
        );
    }

    #[test]
    fn receive_reported_before_send_still_matches() {
        let mut log = CausalLog::new();

        // the receiver's rank is learned from an unrelated send
        log.record(&send(2, "x", 1, 3, 9));
        let r = log.record(&recv(2, "r1", 1, 0, 5));
        let s = log.record(&send(1, "s1", 0, 1, 5));

        assert_eq!(log.get(r).unwrap().matched, Some(s));
        assert_symmetric(&log);
    }

    #[test]
    fn tags_must_agree_unless_wildcard() {
        let mut log = CausalLog::new();

        let s = log.record(&send(1, "s1", 0, 1, 5));
        let r = log.record(&recv(2, "r1", 1, 0, 6));
        assert_eq!(log.get(s).unwrap().matched, None);
        assert_eq!(log.get(r).unwrap().matched, None);

        let any = log.record(&recv(2, "r2", 1, 0, ops::ANY_TAG));
        assert_eq!(log.get(any).unwrap().matched, Some(s));

        // missing tag is permissive
        let s2 = log.record(&event(1, "s2", ops::MPI_SEND, &[(param::RANK, 0), (param::DEST, 1)]));
        assert_eq!(log.get(s2).unwrap().matched, Some(r));

        assert_symmetric(&log);
    }

    #[test]
    fn earliest_unmatched_receive_is_chosen() {
        let mut log = CausalLog::new();

        log.record(&send(2, "x", 1, 3, 9));
        let r1 = log.record(&recv(2, "r1", 1, 0, 5));
        let r2 = log.record(&recv(2, "r2", 1, 0, 5));

        let s1 = log.record(&send(1, "s1", 0, 1, 5));
        let s2 = log.record(&send(1, "s2", 0, 1, 5));

        assert_eq!(log.get(s1).unwrap().matched, Some(r1));
        assert_eq!(log.get(s2).unwrap().matched, Some(r2));
        assert_symmetric(&log);
    }

    #[test]
    fn closure_follows_transitive_dependencies() {
        let mut log = CausalLog::new();

        // w0 -> w1, then w1 -> w2, then w2 -> w0
        log.record(&send(0, "a0", 0, 1, 1));
        log.record(&recv(1, "b0", 1, 0, 1));
        log.record(&send(1, "b1", 1, 2, 2));
        log.record(&recv(2, "c0", 2, 1, 2));
        log.record(&send(2, "c1", 2, 0, 3));
        log.record(&recv(0, "a1", 0, 2, 3));

        assert_eq!(
            closure_of(&log, "a0"),
            vec![
                (0, "a0".to_owned()),
                (1, "b0".to_owned()),
                (2, "c0".to_owned())
            ]
        );

        // later points never pull earlier ones
        assert_eq!(
            closure_of(&log, "a1"),
            vec![(0, "a1".to_owned()), (2, "c1".to_owned())]
        );
    }

    #[test]
    fn closure_points_never_precede_requested_checkpoint() {
        let mut log = CausalLog::new();

        log.record(&send(0, "a0", 0, 1, 1));
        log.record(&recv(1, "b0", 1, 0, 1));
        log.record(&send(1, "b1", 1, 0, 2));
        log.record(&recv(0, "a1", 0, 1, 2));
        log.record(&send(0, "a2", 0, 1, 3));
        log.record(&recv(1, "b2", 1, 0, 3));

        let points = log.rollback_closure(&"a1".into()).unwrap();

        let own = points.iter().find(|p| p.worker == WorkerId(0)).unwrap();
        assert_eq!(own.checkpoint_id.as_str(), "a1");
        assert!(points.len() <= 2);

        for point in &points {
            assert!(log.get(point.record).unwrap().position() <= 2);
        }
    }

    #[test]
    fn unknown_and_non_restorable_checkpoints_are_rejected() {
        let mut log = CausalLog::new();

        log.record(&event(0, "f0", ops::MPI_FINALIZE, &[(param::RANK, 0)]));

        assert!(matches!(
            log.rollback_closure(&"nope".into()),
            Err(crate::Error::CheckpointNotFound(_))
        ));
        assert!(matches!(
            log.rollback_closure(&"f0".into()),
            Err(crate::Error::NotRestorable { .. })
        ));
    }

    #[test]
    fn rollback_truncates_and_marks_current_location() {
        let mut log = CausalLog::new();

        let s1 = log.record(&send(1, "s1", 0, 1, 5));
        let r1 = log.record(&recv(2, "r1", 1, 0, 5));
        let s2 = log.record(&send(1, "s2", 0, 1, 6));
        let r2 = log.record(&recv(2, "r2", 1, 0, 6));

        let points = log.rollback_closure(&"r1".into()).unwrap();
        assert_eq!(points.len(), 2);

        log.apply_rollback(&points);
        assert_symmetric(&log);

        let w1 = log.events(WorkerId(1)).map(|r| r.id).collect::<Vec<_>>();
        let w2 = log.events(WorkerId(2)).map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(w1, vec![s1]);
        assert_eq!(w2, vec![r1]);

        assert!(log.get(s1).unwrap().current_location);
        assert!(log.get(r1).unwrap().current_location);
        assert_eq!(log.get(s1).unwrap().matched, None);
        assert_eq!(log.get(r1).unwrap().matched, None);

        // dropped records are no longer linked nor found
        assert_eq!(log.get(s2).unwrap().matched, None);
        assert_eq!(log.get(r2).unwrap().matched, None);
        assert!(log.find(&"r2".into()).is_none());

        // current locations are not matched until both workers progress
        log.notify_progress(WorkerId(1));
        assert!(!log.get(s1).unwrap().current_location);
        assert_eq!(log.get(s1).unwrap().matched, None);

        log.notify_progress(WorkerId(2));
        assert_eq!(log.get(r1).unwrap().matched, Some(s1));
        assert_symmetric(&log);
    }

    #[test]
    fn rollback_point_of_single_worker() {
        let mut log = CausalLog::new();

        log.record(&send(1, "s1", 0, 1, 5));

        let points = log.rollback_closure(&"s1".into()).unwrap();
        assert_eq!(
            points,
            vec![RollbackPoint {
                worker: WorkerId(1),
                record: log.find(&"s1".into()).unwrap().id,
                checkpoint_id: "s1".into(),
            }]
        );
    }

    #[test]
    fn listing_shows_matches() {
        let mut log = CausalLog::new();

        log.record(&send(1, "s1", 0, 1, 5));
        log.record(&recv(2, "r1", 1, 0, 5));

        let listing = log.to_string();
        assert!(listing.contains("worker 1 (rank 0):"));
        assert!(listing.contains("s1 MPI_Send tag=5 <-> worker 2 r1"));
    }
}
