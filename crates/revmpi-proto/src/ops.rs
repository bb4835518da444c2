//! Message-passing operations known to the debugger.

/// Initialization of the message-passing runtime.
pub const MPI_INIT: &str = "MPI_Init";

/// Blocking send.
pub const MPI_SEND: &str = "MPI_Send";

/// Blocking receive.
pub const MPI_RECV: &str = "MPI_Recv";

/// Shutdown of the message-passing runtime.
pub const MPI_FINALIZE: &str = "MPI_Finalize";

/// Tag value matching any tag.
pub const ANY_TAG: i64 = -1;

/// Global variable holding the rank of the process, set by the wrapper.
pub const RANK_VARIABLE: &str = "_MPI_WRAPPER_PROC_RANK";

/// Global variable holding the PID of the process image forked by the
/// wrapper at each message operation.
pub const CHECKPOINT_CHILD_VARIABLE: &str = "_MPI_CHECKPOINT_CHILD";

/// Parameter names of an [OperationRecord](crate::OperationRecord).
pub mod param {
    /// Rank of the reporting process.
    pub const RANK: &str = "rank";
    /// Message tag.
    pub const TAG: &str = "tag";
    /// Destination rank of a send.
    pub const DEST: &str = "dest";
    /// Source rank of a receive.
    pub const SOURCE: &str = "source";
}

/// Whether `op` sends a message.
pub fn is_send_event(op: &str) -> bool {
    op == MPI_SEND
}

/// Whether a checkpoint taken at `op` can be rolled back to.
pub fn is_restorable(op: &str) -> bool {
    matches!(op, MPI_SEND | MPI_RECV)
}

/// Variables captured when `op` is intercepted, as `(parameter, variable)`.
pub fn captured_arguments(op: &str) -> &'static [(&'static str, &'static str)] {
    match op {
        MPI_SEND => &[
            (param::RANK, RANK_VARIABLE),
            (param::TAG, "tag"),
            (param::DEST, "dest"),
        ],
        MPI_RECV => &[
            (param::RANK, RANK_VARIABLE),
            (param::TAG, "tag"),
            (param::SOURCE, "source"),
        ],
        MPI_FINALIZE => &[(param::RANK, RANK_VARIABLE)],
        _ => &[],
    }
}
