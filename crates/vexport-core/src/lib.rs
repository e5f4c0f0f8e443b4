//! VExport Core - Export Engine
//!
//! This crate turns requested time ranges of a recorded stream into
//! bounded-duration chunks, downloads them one at a time through a
//! caller-supplied export-link resolver, and commits each chunk to disk
//! or memory.

mod downloader;
mod error;
mod events;
mod naming;
mod planner;
mod resolver;
mod scheduler;
mod sink;

pub use downloader::*;
pub use error::*;
pub use events::{
    ChunkErrorCallback, ExportCallbacks, NotifyCallback, ProgressCallback, StatusCallback,
};
pub use naming::*;
pub use planner::*;
pub use resolver::*;
pub use sink::*;

use events::EventHub;
use parking_lot::Mutex;
use scheduler::EngineData;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use vexport_types::{
    Chunk, ChunkError, ChunkPayload, EngineState, ExportConfig, ExportEvent, ExportFormat,
    ExportItem,
};

/// The export engine.
///
/// Cloning is cheap and every clone drives the same engine, so one task can
/// run `start_export` while another calls `cancel`.
#[derive(Clone)]
pub struct ExportEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: ExportConfig,
    pub(crate) resolver: LinkResolverAdapter,
    pub(crate) downloader: Arc<dyn Downloader>,
    /// Items, chunks and run state. Never held across an await.
    pub(crate) data: Mutex<EngineData>,
    pub(crate) events: EventHub,
    /// Held by the run loop for the lifetime of a run
    pub(crate) run_lock: tokio::sync::Mutex<()>,
}

impl ExportEngine {
    /// Start building an engine around the export-link resolver
    pub fn builder(resolver: impl LinkResolver + 'static) -> ExportEngineBuilder {
        ExportEngineBuilder::new(Arc::new(resolver))
    }

    // ========================================================================
    // Configuration & State
    // ========================================================================

    pub fn config(&self) -> &ExportConfig {
        &self.inner.config
    }

    /// Snapshot of the run state
    pub fn state(&self) -> EngineState {
        self.inner.data.lock().state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.data.lock().state.is_running
    }

    /// Whether a host should ask before the user closes it mid-export
    pub fn should_warn_before_unload(&self) -> bool {
        self.inner.config.enable_before_unload_warning && self.is_running()
    }

    /// Directory for the next run's filesystem sink; `None` buffers in memory
    pub fn set_destination(&self, destination: Option<PathBuf>) {
        self.inner.data.lock().destination = destination;
    }

    pub fn destination(&self) -> Option<PathBuf> {
        self.inner.data.lock().destination.clone()
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Replace the registered callbacks
    pub fn set_callbacks(&self, callbacks: ExportCallbacks) {
        self.inner.events.set_callbacks(callbacks);
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<ExportEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Add one export item and plan its chunks
    pub fn add_item(&self, item: ExportItem) -> Result<(), ExportError> {
        self.add_items(vec![item])
    }

    /// Add several items at once. Nothing is added if any item is invalid.
    pub fn add_items(&self, items: Vec<ExportItem>) -> Result<(), ExportError> {
        let config = &self.inner.config;
        {
            let mut data = self.inner.data.lock();

            let mut seen: HashSet<&str> = data.items.iter().map(|i| i.id.as_str()).collect();
            for item in &items {
                if !seen.insert(item.id.as_str()) {
                    return Err(ExportError::ItemAlreadyExists(item.id.clone()));
                }
            }

            let mut planned = Vec::with_capacity(items.len());
            for item in &items {
                planned.push(plan_chunks(
                    item,
                    config.max_chunk_duration,
                    config.min_chunk_duration,
                )?);
            }

            for (item, chunks) in items.into_iter().zip(planned) {
                info!(
                    "Added export item {} ({}): {} chunk(s)",
                    item.id,
                    item.camera_name,
                    chunks.len()
                );
                data.items.push(item);
                data.chunks.extend(chunks);
            }
        }

        self.inner.events.emit(ExportEvent::ItemsChanged);
        Ok(())
    }

    /// Remove an item and its chunks, cancelling its in-flight chunk first
    pub fn remove_item(&self, id: &str) -> Result<(), ExportError> {
        self.inner.data.lock().remove_item(id)?;
        info!("Removed export item {}", id);
        self.inner.events.emit(ExportEvent::ItemsChanged);
        Ok(())
    }

    /// Remove an item once `confirm` resolves true. Returns whether it was removed.
    pub async fn remove_item_with_confirmation<F>(&self, id: &str, confirm: F) -> Result<bool, ExportError>
    where
        F: Future<Output = bool>,
    {
        if self.item(id).is_none() {
            return Err(ExportError::ItemNotFound(id.to_string()));
        }
        if !confirm.await {
            return Ok(false);
        }
        self.remove_item(id)?;
        Ok(true)
    }

    /// Remove every item, cancelling the active run if there is one
    pub fn clear_all(&self) {
        if self.cancel() {
            info!("Cancelled active run before clearing items");
        }
        {
            let mut data = self.inner.data.lock();
            data.items.clear();
            data.chunks.clear();
            data.state.progress = 0.0;
        }
        self.inner.events.emit(ExportEvent::ItemsChanged);
    }

    /// Clear everything once `confirm` resolves true. Returns whether it did.
    pub async fn clear_all_with_confirmation<F>(&self, confirm: F) -> bool
    where
        F: Future<Output = bool>,
    {
        if !confirm.await {
            return false;
        }
        self.clear_all();
        true
    }

    pub fn items(&self) -> Vec<ExportItem> {
        self.inner.data.lock().items.clone()
    }

    pub fn item(&self, id: &str) -> Option<ExportItem> {
        self.inner.data.lock().items.iter().find(|i| i.id == id).cloned()
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// All chunks, in processing order
    pub fn all_chunks(&self) -> Vec<Chunk> {
        self.inner.data.lock().chunks.clone()
    }

    pub fn chunk(&self, id: &str) -> Option<Chunk> {
        self.inner.data.lock().chunks.iter().find(|c| c.id == id).cloned()
    }

    pub fn chunks_for_item(&self, item_id: &str) -> Result<Vec<Chunk>, ExportError> {
        let data = self.inner.data.lock();
        if !data.items.iter().any(|i| i.id == item_id) {
            return Err(ExportError::ItemNotFound(item_id.to_string()));
        }
        Ok(data
            .chunks
            .iter()
            .filter(|c| c.item_id == item_id)
            .cloned()
            .collect())
    }

    /// Hand a downloaded chunk's payload to the caller, releasing it from the engine
    pub fn take_chunk_payload(&self, id: &str) -> Result<Option<ChunkPayload>, ExportError> {
        let mut data = self.inner.data.lock();
        let chunk = data
            .chunks
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ExportError::ChunkNotFound(id.to_string()))?;
        Ok(chunk.payload.take())
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ExportEngine`]
pub struct ExportEngineBuilder {
    resolver: Arc<dyn LinkResolver>,
    config: ExportConfig,
    downloader: Option<Arc<dyn Downloader>>,
    on_export_success: Option<NotifyCallback>,
    on_chunk_error: Option<ChunkErrorCallback>,
}

impl ExportEngineBuilder {
    fn new(resolver: Arc<dyn LinkResolver>) -> Self {
        Self {
            resolver,
            config: ExportConfig::default(),
            downloader: None,
            on_export_success: None,
            on_chunk_error: None,
        }
    }

    pub fn config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn format(mut self, format: ExportFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn min_chunk_duration(mut self, millis: u64) -> Self {
        self.config.min_chunk_duration = millis;
        self
    }

    pub fn max_chunk_duration(mut self, millis: u64) -> Self {
        self.config.max_chunk_duration = millis;
        self
    }

    pub fn enable_before_unload_warning(mut self, enabled: bool) -> Self {
        self.config.enable_before_unload_warning = enabled;
        self
    }

    pub fn destination(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.destination = Some(dir.into());
        self
    }

    /// Replace the HTTP downloader
    pub fn downloader(mut self, downloader: impl Downloader + 'static) -> Self {
        self.downloader = Some(Arc::new(downloader));
        self
    }

    pub fn on_export_success(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_export_success = Some(Arc::new(f));
        self
    }

    pub fn on_chunk_error(mut self, f: impl Fn(&str, &ChunkError) + Send + Sync + 'static) -> Self {
        self.on_chunk_error = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<ExportEngine, ExportError> {
        let config = self.config;
        if config.max_chunk_duration == 0 {
            return Err(ExportError::InvalidConfig(
                "max chunk duration must be greater than zero".to_string(),
            ));
        }
        if config.min_chunk_duration > config.max_chunk_duration {
            warn!(
                "Minimum chunk duration {}ms exceeds maximum {}ms, clamping",
                config.min_chunk_duration, config.max_chunk_duration
            );
        }
        let config = config.normalized();

        let downloader: Arc<dyn Downloader> = match self.downloader {
            Some(downloader) => downloader,
            None => Arc::new(HttpDownloader::new()?),
        };

        let data = EngineData::new(config.format, config.destination.clone());
        let inner = EngineInner {
            resolver: LinkResolverAdapter::new(self.resolver, config.format),
            downloader,
            data: Mutex::new(data),
            events: EventHub::new(self.on_export_success, self.on_chunk_error),
            run_lock: tokio::sync::Mutex::new(()),
            config,
        };

        Ok(ExportEngine {
            inner: Arc::new(inner),
        })
    }
}
