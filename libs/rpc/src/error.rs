use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] meridian_core::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Method not registered: {0}")]
    MethodNotRegistered(String),

    #[error("Method {method} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// The buffered bytes do not yet hold a complete frame
    #[error("Insufficient data")]
    InsufficientData,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("No outstanding call for response {0}")]
    DispatchMismatch(u64),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Argument {0} cannot be encoded")]
    UnencodableArgument(usize),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Whether the channel that produced this error must be evicted
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::MalformedFrame(_)
        )
    }

    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Error::InsufficientData)
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedFrame(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
