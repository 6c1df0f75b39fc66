use std::io;

use thiserror::Error;

use crate::source::SourceError;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("malformed key: {0}")]
    MalformedKey(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("unrecognized etcd watch type {action} at {index}")]
    UnrecognizedAction { action: String, index: u64 },
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("aggregate error: [{}]", join_errors(.0))]
    Aggregate(Vec<ArchiveError>),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Collapses a list of failures into a single error, or `None` when the
    /// list is empty.
    pub fn aggregate(mut errs: Vec<ArchiveError>) -> Option<ArchiveError> {
        match errs.len() {
            0 => None,
            1 => Some(errs.remove(0)),
            _ => Some(ArchiveError::Aggregate(errs)),
        }
    }
}

fn join_errors(errs: &[ArchiveError]) -> String {
    errs.iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<toml::de::Error> for ArchiveError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for ArchiveError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
