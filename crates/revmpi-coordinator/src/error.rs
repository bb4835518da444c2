use revmpi_proto::{CheckpointId, WorkerId};

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No live record was taken at this checkpoint.
    #[error("no checkpoint with ID {0}")]
    CheckpointNotFound(CheckpointId),

    /// Rolling back to this checkpoint is not supported.
    #[error("checkpoint {checkpoint} of {op_name} cannot be rolled back to")]
    NotRestorable {
        /// Requested checkpoint.
        checkpoint: CheckpointId,
        /// Operation which triggered the checkpoint.
        op_name: String,
    },

    /// `commit` was called without a submitted rollback.
    #[error("no pending rollback")]
    NoPendingRollback,

    /// The worker is not registered.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// The worker's process has exited.
    #[error("worker {0} has exited")]
    WorkerExited(WorkerId),

    /// The connection to the worker is closed.
    #[error("worker {0} is gone")]
    WorkerGone(WorkerId),

    /// The processing task of the coordinator stopped.
    #[error("coordinator stopped")]
    CoordinatorGone,

    /// Wire encoding failure.
    #[error(transparent)]
    Proto(#[from] revmpi_proto::Error),

    /// Network failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
