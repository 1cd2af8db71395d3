use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to persist trial record to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("trial sequence has no slots")]
    Empty,
}

pub type Result<T> = std::result::Result<T, HarnessError>;
