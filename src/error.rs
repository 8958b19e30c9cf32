//! Error types for trace sessions.
//!
//! Library code returns [`TraceError`]; the binary wraps it in `anyhow`.

use crate::model::NodeId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading a trace capture archive
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a valid capture archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Malformed CSV in {entry}: {source}")]
    Csv {
        entry: &'static str,
        #[source]
        source: csv::Error,
    },

    #[error("Invalid record {record} in {entry}: {reason}")]
    InvalidRecord {
        entry: &'static str,
        record: u64,
        reason: String,
    },

    #[error("Input text is not valid UTF-8")]
    InputEncoding(#[from] std::string::FromUtf8Error),
}

/// Errors surfaced by the trace store and its readers
#[derive(Error, Debug)]
pub enum TraceError {
    /// Node or resource absent; may appear later while loading is in progress
    #[error("Node {0} not found")]
    NotFound(NodeId),

    #[error("Range [{start}, {end}) out of bounds for input of length {length}")]
    RangeError {
        start: usize,
        end: usize,
        length: usize,
    },

    #[error("Corrupt trace capture: {0}")]
    CorruptFormat(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Trace file does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Trace file is not readable: {}", .0.display())]
    NotReadable(PathBuf),

    #[error("Trace database is closed")]
    Closed,
}

impl TraceError {
    /// Short title for user-facing error reports
    pub fn title(&self) -> &'static str {
        match self {
            TraceError::NotFound(_) => "Not found",
            TraceError::RangeError { .. } => "Invalid range",
            TraceError::CorruptFormat(_) => "Corrupt trace file",
            TraceError::StorageFailure(_) => "Database error",
            TraceError::FileNotFound(_) => "Trace file does not exist",
            TraceError::NotReadable(_) => "Trace file is not readable",
            TraceError::Closed => "Trace closed",
        }
    }

    /// Whether retrying after more ingestion could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TraceError::NotFound(_))
    }
}

impl From<CaptureError> for TraceError {
    fn from(e: CaptureError) -> Self {
        TraceError::CorruptFormat(e.to_string())
    }
}

impl From<diesel::result::Error> for TraceError {
    fn from(e: diesel::result::Error) -> Self {
        TraceError::StorageFailure(e.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for TraceError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        TraceError::StorageFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
