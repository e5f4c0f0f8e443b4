//! Shared types for VExport
//!
//! This crate contains the data model shared by the export engine
//! and the CLI: export items, chunks, engine state, configuration
//! and the events the engine emits.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// One hour, the default upper bound for a chunk
pub const DEFAULT_MAX_CHUNK_DURATION_MS: u64 = 60 * 60 * 1000;

/// Two minutes, the default lower bound for a trailing chunk
pub const DEFAULT_MIN_CHUNK_DURATION_MS: u64 = 2 * 60 * 1000;

// ============================================================================
// Export Items
// ============================================================================

/// A user-requested export of one camera stream over a time range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportItem {
    pub id: String,
    pub camera_name: String,
    #[serde(default)]
    pub camera_uuid: String,
    #[serde(default)]
    pub camera_id: String,
    pub stream_uuid: String,
    /// Epoch milliseconds, inclusive
    pub start_time: i64,
    /// Epoch milliseconds, exclusive
    pub end_time: i64,
    #[serde(default)]
    pub with_audio: bool,
}

impl ExportItem {
    /// Create an item with a freshly generated id
    pub fn new(
        camera_name: impl Into<String>,
        stream_uuid: impl Into<String>,
        start_time: i64,
        end_time: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            camera_name: camera_name.into(),
            camera_uuid: String::new(),
            camera_id: String::new(),
            stream_uuid: stream_uuid.into(),
            start_time,
            end_time,
            with_audio: false,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_time - self.start_time
    }
}

// ============================================================================
// Chunks
// ============================================================================

/// Status of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Ready,
    Waiting,
    InProcess,
    Downloaded,
    Errored,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkStatus::Ready => "ready",
            ChunkStatus::Waiting => "waiting",
            ChunkStatus::InProcess => "in process",
            ChunkStatus::Downloaded => "downloaded",
            ChunkStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Machine-readable kind of a chunk failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ExportInProgress,
    ItemNotFound,
    ItemAlreadyExists,
    ChunkNotFound,
    InvalidTimeRange,
    InvalidConfig,
    LinkRequestFailed,
    DownloadFailed,
    NetworkError,
    FileSystemError,
    Cancelled,
}

/// Last error recorded on a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkError {
    pub code: ErrorCode,
    pub message: String,
}

/// Where a downloaded chunk ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// Written to disk at this path
    File(PathBuf),
    /// Held in memory until the host takes it
    Memory(Bytes),
}

impl ChunkPayload {
    /// Size of a buffered payload; files are not inspected
    pub fn byte_len(&self) -> Option<u64> {
        match self {
            ChunkPayload::File(_) => None,
            ChunkPayload::Memory(bytes) => Some(bytes.len() as u64),
        }
    }
}

/// One independently downloadable slice of an export item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub item_id: String,
    pub index: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub status: ChunkStatus,
    pub error: Option<ChunkError>,
    /// 0-100
    pub progress: f64,
    #[serde(skip)]
    pub payload: Option<ChunkPayload>,
}

impl Chunk {
    pub fn new(item_id: &str, index: u32, start_time: i64, end_time: i64) -> Self {
        Self {
            id: Self::make_id(item_id, index),
            item_id: item_id.to_string(),
            index,
            start_time,
            end_time,
            status: ChunkStatus::Ready,
            error: None,
            progress: 0.0,
            payload: None,
        }
    }

    /// Chunk ids are derived from the owning item and the sequence index
    pub fn make_id(item_id: &str, index: u32) -> String {
        format!("{}#{}", item_id, index)
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_time - self.start_time
    }

    /// Share of this chunk that counts as done for aggregate progress
    pub fn completion(&self) -> f64 {
        match self.status {
            ChunkStatus::Downloaded => 100.0,
            ChunkStatus::InProcess => self.progress,
            _ => 0.0,
        }
    }
}

// ============================================================================
// Engine State & Config
// ============================================================================

/// Container format requested from the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Mkv,
    Avi,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Mkv => "mkv",
            ExportFormat::Avi => "avi",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mkv" => Ok(ExportFormat::Mkv),
            "avi" => Ok(ExportFormat::Avi),
            other => Err(format!("unsupported export format: {}", other)),
        }
    }
}

/// Snapshot of the engine's run state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub is_running: bool,
    pub current_chunk_id: Option<String>,
    /// Duration-weighted progress of the active run, 0-100
    pub progress: f64,
    pub format: ExportFormat,
}

impl EngineState {
    pub fn idle(format: ExportFormat) -> Self {
        Self {
            is_running: false,
            current_chunk_id: None,
            progress: 0.0,
            format,
        }
    }
}

/// Engine-wide configuration, fixed at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub format: ExportFormat,
    /// Trailing chunks shorter than this merge into their predecessor
    pub min_chunk_duration: u64,
    pub max_chunk_duration: u64,
    /// Advisory flag for hosts that guard against closing mid-export
    pub enable_before_unload_warning: bool,
    /// Directory for the filesystem sink; memory buffering when unset
    pub destination: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::Mkv,
            min_chunk_duration: DEFAULT_MIN_CHUNK_DURATION_MS,
            max_chunk_duration: DEFAULT_MAX_CHUNK_DURATION_MS,
            enable_before_unload_warning: true,
            destination: None,
        }
    }
}

impl ExportConfig {
    /// Copy with the minimum chunk duration clamped to the maximum
    pub fn normalized(&self) -> Self {
        Self {
            min_chunk_duration: self.min_chunk_duration.min(self.max_chunk_duration),
            ..self.clone()
        }
    }
}

// ============================================================================
// Resolver Types
// ============================================================================

/// Payload handed to the export-link resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub stream_uuid: String,
    pub format: ExportFormat,
    /// Epoch milliseconds
    pub start_date: i64,
    /// Epoch milliseconds
    pub end_date: i64,
    pub with_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResponse {
    pub link: String,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ExportEvent {
    ChunkStatusChanged {
        chunk_id: String,
        status: ChunkStatus,
        error: Option<String>,
        error_code: Option<ErrorCode>,
    },
    ChunkProgress {
        chunk_id: String,
        percentage: f64,
    },
    ChunkFailed {
        chunk_id: String,
        error: ChunkError,
    },
    ExportSucceeded,
    ExportCompleted,
    ExportCancelled,
    ItemsChanged,
}
