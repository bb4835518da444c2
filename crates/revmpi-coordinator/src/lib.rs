//! This crate keeps the causal history of the messages exchanged by revmpi
//! workers, and computes which checkpoints must be restored together so
//! that rolling one worker back never leaves a message received but not
//! sent.
//!
//! Operations reported by workers are appended to a [CausalLog], where
//! every send is linked to the receive of the same message. Rolling back to
//! a checkpoint pulls the peers of every later message back too, until a
//! consistent cut is reached.
//!
//! The [Coordinator] owns the log in a single Tokio task, and dispatches
//! commands to the registered workers.

mod error;
mod log;
mod service;

pub use self::error::{Error, Result};
pub use self::log::{CausalLog, CausalRecord, RecordId, RollbackPoint};
pub use self::service::{CommandReceiver, Coordinator, PendingCommand};
