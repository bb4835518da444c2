use nix::sys::wait::WaitStatus;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// File open/read/write error.
    #[error("{0}: {1}")]
    File(std::path::PathBuf, std::io::Error),

    #[error("bad child wait status: {0:?}")]
    BadChildWait(WaitStatus),

    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    #[error("memory read/write {0} bytes instead of {1}")]
    PartialMemOp(usize, usize),

    #[error("malformed line in {0}: {1}")]
    MalformedMaps(std::path::PathBuf, String),

    #[error("Child process execution failed: {0}")]
    ChildExec(std::io::Error),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
