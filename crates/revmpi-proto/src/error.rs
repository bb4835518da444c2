/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Message serialization error.
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),

    /// Message deserialization error.
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),

    /// Unknown introspection topic.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
