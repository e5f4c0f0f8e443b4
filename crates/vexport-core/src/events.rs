//! Observer registry for engine events
//!
//! Every event goes to the matching registered callback and is also
//! broadcast as an [`ExportEvent`] to any subscriber.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use vexport_types::{ChunkError, ChunkStatus, ErrorCode, ExportEvent};

pub type StatusCallback = Arc<dyn Fn(&str, ChunkStatus, Option<&str>, Option<ErrorCode>) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;
pub type ChunkErrorCallback = Arc<dyn Fn(&str, &ChunkError) + Send + Sync>;
pub type NotifyCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks registered through `ExportEngine::set_callbacks`
#[derive(Clone, Default)]
pub struct ExportCallbacks {
    pub on_chunk_status_change: Option<StatusCallback>,
    pub on_chunk_progress: Option<ProgressCallback>,
    pub on_export_complete: Option<NotifyCallback>,
    pub on_export_cancelled: Option<NotifyCallback>,
    pub on_items_change: Option<NotifyCallback>,
}

impl ExportCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_chunk_status_change(
        mut self,
        f: impl Fn(&str, ChunkStatus, Option<&str>, Option<ErrorCode>) + Send + Sync + 'static,
    ) -> Self {
        self.on_chunk_status_change = Some(Arc::new(f));
        self
    }

    pub fn on_chunk_progress(mut self, f: impl Fn(&str, f64) + Send + Sync + 'static) -> Self {
        self.on_chunk_progress = Some(Arc::new(f));
        self
    }

    pub fn on_export_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_export_complete = Some(Arc::new(f));
        self
    }

    pub fn on_export_cancelled(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_export_cancelled = Some(Arc::new(f));
        self
    }

    pub fn on_items_change(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_items_change = Some(Arc::new(f));
        self
    }
}

pub(crate) struct EventHub {
    callbacks: RwLock<ExportCallbacks>,
    on_export_success: Option<NotifyCallback>,
    on_chunk_error: Option<ChunkErrorCallback>,
    event_tx: broadcast::Sender<ExportEvent>,
}

impl EventHub {
    pub(crate) fn new(
        on_export_success: Option<NotifyCallback>,
        on_chunk_error: Option<ChunkErrorCallback>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            callbacks: RwLock::new(ExportCallbacks::default()),
            on_export_success,
            on_chunk_error,
            event_tx,
        }
    }

    pub(crate) fn set_callbacks(&self, callbacks: ExportCallbacks) {
        *self.callbacks.write() = callbacks;
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ExportEvent> {
        self.event_tx.subscribe()
    }

    /// Dispatch an event. Must be called without the engine lock held.
    pub(crate) fn emit(&self, event: ExportEvent) {
        // Clone out so a callback may re-register without deadlocking
        let callbacks = self.callbacks.read().clone();

        match &event {
            ExportEvent::ChunkStatusChanged {
                chunk_id,
                status,
                error,
                error_code,
            } => {
                if let Some(cb) = &callbacks.on_chunk_status_change {
                    cb(chunk_id, *status, error.as_deref(), *error_code);
                }
            }
            ExportEvent::ChunkProgress { chunk_id, percentage } => {
                if let Some(cb) = &callbacks.on_chunk_progress {
                    cb(chunk_id, *percentage);
                }
            }
            ExportEvent::ChunkFailed { chunk_id, error } => {
                if let Some(cb) = &self.on_chunk_error {
                    cb(chunk_id, error);
                }
            }
            ExportEvent::ExportSucceeded => {
                if let Some(cb) = &self.on_export_success {
                    cb();
                }
            }
            ExportEvent::ExportCompleted => {
                if let Some(cb) = &callbacks.on_export_complete {
                    cb();
                }
            }
            ExportEvent::ExportCancelled => {
                if let Some(cb) = &callbacks.on_export_cancelled {
                    cb();
                }
            }
            ExportEvent::ItemsChanged => {
                if let Some(cb) = &callbacks.on_items_change {
                    cb();
                }
            }
        }

        let _ = self.event_tx.send(event);
    }

    pub(crate) fn emit_all(&self, events: Vec<ExportEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
