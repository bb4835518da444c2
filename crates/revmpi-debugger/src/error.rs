use revmpi_proto::CheckpointId;

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Tracing request failure. The traced process is no longer in a known
    /// state.
    #[error(transparent)]
    Trace(#[from] crate::sys::Error),

    /// The traced process kept stopping on signals the debugger ignores.
    #[error("stuck at wait with signal: {signal}")]
    WaitExhausted {
        /// Last observed stop signal.
        signal: String,
    },

    /// The tracer thread stopped.
    #[error("tracer thread stopped")]
    TracerGone,

    /// The tracer thread could not be started.
    #[error("cannot spawn tracer thread: {0}")]
    TracerSpawn(#[source] std::io::Error),

    /// Debug information lookup failure.
    #[error(transparent)]
    Symbol(#[from] revmpi_symbol::Error),

    /// A breakpoint is already armed at this address.
    #[error("breakpoint already armed at {0:#x}")]
    BreakpointArmed(u64),

    /// No checkpoint with this ID.
    #[error("no checkpoint with ID {0}")]
    CheckpointNotFound(CheckpointId),

    /// No variable with this name is visible.
    #[error("variable not found: {0}")]
    VariableNotFound(String),

    /// A variable location evaluated to an unreadable address.
    #[error("cannot read {name} at {addr:#x}")]
    UnreadableVariable {
        /// Variable identifier.
        name: String,
        /// Evaluated address.
        addr: u64,
    },

    /// The operation requires a stopped process.
    #[error("process is not stopped")]
    NotStopped,

    /// The traced process has exited.
    #[error("process exited with code {0}")]
    ProcessExited(i32),

    /// The checkpoint store cannot be used with this target.
    #[error("checkpoint store unavailable: {0}")]
    StoreUnavailable(String),
}

impl Error {
    /// Whether the error leaves the traced process in an unknown state,
    /// so that the worker must terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Trace(_) | Self::WaitExhausted { .. } | Self::TracerGone | Self::TracerSpawn(_)
        )
    }
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
