use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Unknown compress type: {0}")]
    UnknownCompressType(i32),

    #[error("Method already registered: {0}")]
    DuplicateMethod(String),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
