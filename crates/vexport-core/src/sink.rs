//! Chunk sinks - where a chunk's bytes are committed
//!
//! Two interchangeable strategies, picked once per run:
//! - Filesystem: bytes go straight to a `.part` scratch file next to the
//!   destination and are renamed into place on finalize
//! - Buffering: bytes accumulate in memory and finalize yields one blob

use crate::error::ExportError;
use async_trait::async_trait;
use bytes::BytesMut;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use vexport_types::ChunkPayload;

/// Destination for one chunk's transfer
#[async_trait]
pub trait ChunkSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ExportError>;

    /// Commit everything written so far
    async fn finalize(&mut self) -> Result<ChunkPayload, ExportError>;

    /// Discard everything written so far
    async fn abort(&mut self);
}

/// How chunks are persisted for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStrategy {
    Filesystem { dir: PathBuf },
    Buffering,
}

impl SinkStrategy {
    /// Prefer the filesystem when a destination is granted and usable
    pub async fn select(destination: Option<&Path>) -> Self {
        let Some(dir) = destination else {
            debug!("No destination configured, buffering chunks in memory");
            return SinkStrategy::Buffering;
        };

        match fs::create_dir_all(dir).await {
            Ok(()) => {
                info!("Writing chunks to {:?}", dir);
                SinkStrategy::Filesystem {
                    dir: dir.to_path_buf(),
                }
            }
            Err(e) => {
                warn!("Destination {:?} is not writable ({}), buffering chunks in memory", dir, e);
                SinkStrategy::Buffering
            }
        }
    }

    /// Open a sink for one chunk
    pub async fn open(&self, filename: &str) -> Result<Box<dyn ChunkSink>, ExportError> {
        match self {
            SinkStrategy::Filesystem { dir } => Ok(Box::new(FileSink::create(dir, filename).await?)),
            SinkStrategy::Buffering => Ok(Box::new(MemorySink::new())),
        }
    }
}

/// Writes to `<dir>/<filename>.part` until finalized
#[derive(Debug)]
pub struct FileSink {
    file: Option<File>,
    part_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

impl FileSink {
    pub async fn create(dir: &Path, filename: &str) -> Result<Self, ExportError> {
        let final_path = dir.join(filename);
        let part_path = dir.join(format!("{}.part", filename));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part_path)
            .await?;

        Ok(Self {
            file: Some(file),
            part_path,
            final_path,
            written: 0,
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ExportError> {
        let file = self.file.as_mut().ok_or_else(closed_sink)?;
        file.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<ChunkPayload, ExportError> {
        let mut file = self.file.take().ok_or_else(closed_sink)?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let target = get_unique_path(&self.final_path).await;
        fs::rename(&self.part_path, &target).await?;
        info!("Chunk written to {:?} ({} bytes)", target, self.written);
        Ok(ChunkPayload::File(target))
    }

    async fn abort(&mut self) {
        drop(self.file.take());
        match fs::remove_file(&self.part_path).await {
            Ok(()) => debug!("Removed partial file {:?}", self.part_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial file {:?}: {}", self.part_path, e),
        }
    }
}

/// Accumulates a chunk in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: BytesMut,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ExportError> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<ChunkPayload, ExportError> {
        Ok(ChunkPayload::Memory(self.buffer.split().freeze()))
    }

    async fn abort(&mut self) {
        self.buffer = BytesMut::new();
    }
}

fn closed_sink() -> ExportError {
    ExportError::FileSystem(std::io::Error::new(
        std::io::ErrorKind::Other,
        "sink already closed",
    ))
}

/// Get unique path (avoid conflicts)
async fn get_unique_path(path: &Path) -> PathBuf {
    let mut counter = 1;
    let mut new_path = path.to_path_buf();

    while fs::try_exists(&new_path).await.unwrap_or(false) {
        let stem = path.file_stem().unwrap_or_default();
        let new_name = match path.extension() {
            Some(extension) => format!(
                "{} ({}).{}",
                stem.to_string_lossy(),
                counter,
                extension.to_string_lossy()
            ),
            None => format!("{} ({})", stem.to_string_lossy(), counter),
        };
        new_path = path.with_file_name(new_name);
        counter += 1;

        // Safety limit
        if counter > 10000 {
            return new_path;
        }
    }

    new_path
}
