//! Error types for sqlite-vss

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid index configuration: {0}")]
    InvalidConfig(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Column '{0}' requires training before vectors can be added")]
    NotTrained(String),

    #[error("Training requires at least {required} vectors, got {provided}")]
    InsufficientTrainingData { required: usize, provided: usize },

    #[error("Duplicate id: {0}")]
    DuplicateId(i64),

    #[error("Invalid usage: {0}")]
    Usage(String),

    #[error("Table is busy: {0}")]
    Busy(String),

    #[error("Corrupt index data: {0}")]
    Corrupt(String),

    #[error("Invalid vector format: {0}")]
    InvalidVectorFormat(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Coarse error classes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfig,
    DimensionMismatch,
    NotTrained,
    InsufficientTrainingData,
    DuplicateId,
    Usage,
    Busy,
    StorageIo,
    InvalidInput,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Error::NotTrained(_) => ErrorKind::NotTrained,
            Error::InsufficientTrainingData { .. } => ErrorKind::InsufficientTrainingData,
            Error::DuplicateId(_) => ErrorKind::DuplicateId,
            Error::Usage(_) => ErrorKind::Usage,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Sqlite(_) | Error::Corrupt(_) => ErrorKind::StorageIo,
            Error::InvalidVectorFormat(_) | Error::InvalidState(_) | Error::JsonParse(_) => {
                ErrorKind::InvalidInput
            }
        }
    }
}

impl From<Error> for rusqlite::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Sqlite(e) => e,
            Error::Busy(msg) => rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some(format!("Table is busy: {}", msg)),
            ),
            other => rusqlite::Error::UserFunctionError(Box::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
