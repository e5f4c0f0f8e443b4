//! Error types for VExport core

use thiserror::Error;
use vexport_types::{ChunkError, ErrorCode};

/// Errors that can occur in VExport core
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("An export is already in progress")]
    ExportInProgress,

    #[error("Export item not found: {0}")]
    ItemNotFound(String),

    #[error("Export item already exists: {0}")]
    ItemAlreadyExists(String),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Invalid time range: end {end} is not after start {start}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Export link request failed: {0}")]
    LinkRequestFailed(String),

    #[error("Download failed with HTTP status {status}")]
    DownloadFailed { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Export was cancelled")]
    Cancelled,
}

impl ExportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ExportError::ExportInProgress => ErrorCode::ExportInProgress,
            ExportError::ItemNotFound(_) => ErrorCode::ItemNotFound,
            ExportError::ItemAlreadyExists(_) => ErrorCode::ItemAlreadyExists,
            ExportError::ChunkNotFound(_) => ErrorCode::ChunkNotFound,
            ExportError::InvalidTimeRange { .. } => ErrorCode::InvalidTimeRange,
            ExportError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            ExportError::LinkRequestFailed(_) => ErrorCode::LinkRequestFailed,
            ExportError::DownloadFailed { .. } => ErrorCode::DownloadFailed,
            ExportError::Network(_) => ErrorCode::NetworkError,
            ExportError::FileSystem(_) => ErrorCode::FileSystemError,
            ExportError::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Failures that are recorded on a chunk instead of returned to the caller
    pub fn is_chunk_failure(&self) -> bool {
        matches!(
            self,
            ExportError::LinkRequestFailed(_)
                | ExportError::DownloadFailed { .. }
                | ExportError::Network(_)
                | ExportError::FileSystem(_)
        )
    }

    pub fn to_chunk_error(&self) -> ChunkError {
        ChunkError {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<reqwest::Error> for ExportError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => ExportError::DownloadFailed {
                status: status.as_u16(),
            },
            None => ExportError::Network(error.to_string()),
        }
    }
}
