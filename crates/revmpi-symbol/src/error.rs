/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// File open/read error.
    #[error("{0}: {1}")]
    File(std::path::PathBuf, std::io::Error),

    /// Error from the [goblin] crate.
    #[error(transparent)]
    Goblin(#[from] goblin::error::Error),

    /// Error from the [gimli] crate.
    #[error(transparent)]
    Gimli(#[from] gimli::Error),

    /// The binary carries no `.debug_info` section.
    #[error("missing .debug_info")]
    MissingDebugInfo,

    /// No statement boundary matches the requested source line.
    #[error("unable to find suitable instruction for line {line} in file {file}")]
    LineNotFound {
        /// Requested source file.
        file: String,

        /// Requested source line.
        line: u64,
    },

    /// No line-table entry matches the given address.
    #[error("unable to find instruction matching address {0:#x}")]
    AddressNotFound(u64),

    /// No function with the given name is described by the debug information.
    #[error("function {0} not found")]
    FunctionNotFound(String),

    /// The location expression uses an opcode this resolver does not evaluate.
    #[error("unsupported location opcode {0:#04x}")]
    UnsupportedOpcode(u8),

    /// The location expression left nothing on the stack.
    #[error("empty location stack")]
    EmptyLocationStack,

    /// The location expression is frame-relative but no frame base is known.
    #[error("missing frame base")]
    MissingFrameBase,

    /// The location expression refers to the call frame address but none is known.
    #[error("could not retrieve CFA for current PC")]
    MissingCfa,
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
