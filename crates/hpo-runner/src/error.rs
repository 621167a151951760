use std::path::PathBuf;
use thiserror::Error;

use crate::event::EventRangeIdError;

pub const EC_MISSING_ARG: i32 = 10;
pub const EC_NO_INPUT: i32 = 11;
pub const EC_TARBALL: i32 = 143;
pub const EC_WGET: i32 = 146;
pub const EC_EVENT: i32 = 147;
pub const EC_LOCAL_IO: i32 = 1;

/// Failure of a single remote call. Never fatal on its own: callers decide
/// whether to retry, log, or escalate.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("request rejected (StatusCode={code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed to load credentials from {}: {source}", .path.display())]
    Credentials {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("missing required argument: {0}")]
    MissingArgument(String),
    #[error("no input file is available")]
    NoInput,
    #[error("{} is corrupted", .path.display())]
    CorruptedArchive { path: PathBuf },
    #[error("failed to download {url}: {source}")]
    Download { url: String, source: RemoteError },
    #[error("malformed event range: {0}")]
    MalformedEventRange(#[from] EventRangeIdError),
    #[error("failed to persist run context at {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::MissingArgument(_) => EC_MISSING_ARG,
            WorkerError::NoInput => EC_NO_INPUT,
            WorkerError::CorruptedArchive { .. } => EC_TARBALL,
            WorkerError::Download { .. } => EC_WGET,
            WorkerError::MalformedEventRange(_) | WorkerError::Persist { .. } => EC_EVENT,
            WorkerError::Io(_) => EC_LOCAL_IO,
        }
    }
}
