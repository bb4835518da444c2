//! Vocabulary shared by revmpi workers and the revmpi coordinator.
//!
//! A worker traces one process and reports every intercepted message
//! operation as an [OperationRecord]. The coordinator drives workers with
//! [Command]s, each answered by a [CommandResult]. Both directions travel
//! over TCP as length-delimited bincode frames (see [MessageCodec]).

mod command;
mod error;
pub mod ops;
mod record;
mod wire;

pub use self::command::{Command, CommandResult, InternalTopic};
pub use self::error::{Error, Result};
pub use self::record::{CheckpointId, OperationRecord, WorkerId};
pub use self::wire::{
    CoordinatorCodec, CoordinatorMessage, DEFAULT_COORDINATOR_PORT, MessageCodec, WorkerCodec,
    WorkerMessage,
};
