//! Export queue - the chunk state machine and the sequential run loop
//!
//! Chunks move `Ready -> Waiting -> InProcess -> Downloaded | Errored`,
//! and `Errored -> Waiting` on retry. One chunk is in flight at a time:
//! the next one is always the first `Waiting` chunk in item insertion
//! order, then chunk order. A failed chunk never stops the run.
//!
//! Every pick of a chunk is a numbered attempt. Only the attempt that is
//! still in flight may settle its chunk; outcomes of attempts that were
//! cancelled or whose item was removed are dropped.

use crate::downloader::DownloadBody;
use crate::error::ExportError;
use crate::naming::generate_filename;
use crate::sink::{ChunkSink, SinkStrategy};
use crate::ExportEngine;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vexport_types::{
    Chunk, ChunkPayload, ChunkStatus, EngineState, ExportEvent, ExportFormat, ExportItem,
};

/// Minimum progress step between two progress events for one chunk
const PROGRESS_STEP: f64 = 0.1;

/// Everything the engine owns, guarded by one lock
pub(crate) struct EngineData {
    pub(crate) items: Vec<ExportItem>,
    /// Kept in processing order: item insertion order, then chunk index
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) state: EngineState,
    pub(crate) run: Option<ActiveRun>,
    pub(crate) destination: Option<PathBuf>,
    /// Last attempt number handed out by `next_chunk`
    attempts: u64,
    /// Bumped by every `begin_run`
    runs_started: u64,
}

pub(crate) struct ActiveRun {
    token: CancellationToken,
    chunk_ids: HashSet<String>,
    in_flight: Option<InFlight>,
}

struct InFlight {
    attempt: u64,
    chunk_id: String,
    item_id: String,
    token: CancellationToken,
}

/// One chunk handed to the run loop
struct Attempt {
    number: u64,
    item: ExportItem,
    chunk: Chunk,
    token: CancellationToken,
}

/// Outcome of trying to claim the run from the idle state
enum RunClaim<'a> {
    /// A new run was opened; the guard keeps other run loops out
    Opened(tokio::sync::MutexGuard<'a, ()>, CancellationToken, Vec<ExportEvent>),
    /// A run is active; the eligible chunks were queued into it
    Joined(Vec<ExportEvent>),
    /// A run is active and joining it was not allowed
    Busy,
    /// Idle, but a cancelled run loop still holds the lock
    WindingDown { runs_started: u64 },
}

fn status_event(chunk: &Chunk) -> ExportEvent {
    ExportEvent::ChunkStatusChanged {
        chunk_id: chunk.id.clone(),
        status: chunk.status,
        error: chunk.error.as_ref().map(|e| e.message.clone()),
        error_code: chunk.error.as_ref().map(|e| e.code),
    }
}

fn reset_to_ready(chunk: &mut Chunk) {
    chunk.status = ChunkStatus::Ready;
    chunk.progress = 0.0;
    chunk.error = None;
}

impl EngineData {
    pub(crate) fn new(format: ExportFormat, destination: Option<PathBuf>) -> Self {
        Self {
            items: Vec::new(),
            chunks: Vec::new(),
            state: EngineState::idle(format),
            run: None,
            destination,
            attempts: 0,
            runs_started: 0,
        }
    }

    fn ensure_chunks_exist<S: AsRef<str>>(&self, ids: &[S]) -> Result<(), ExportError> {
        for id in ids {
            let id = id.as_ref();
            if !self.chunks.iter().any(|c| c.id == id) {
                return Err(ExportError::ChunkNotFound(id.to_string()));
            }
        }
        Ok(())
    }

    /// Move eligible chunks to `Waiting` and make them part of the active run
    fn enqueue(&mut self, eligible: impl Fn(&Chunk) -> bool) -> Vec<ExportEvent> {
        let Some(run) = self.run.as_mut() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for chunk in self.chunks.iter_mut().filter(|c| eligible(c)) {
            chunk.status = ChunkStatus::Waiting;
            chunk.error = None;
            chunk.progress = 0.0;
            run.chunk_ids.insert(chunk.id.clone());
            events.push(status_event(chunk));
        }
        self.recompute_progress();
        events
    }

    fn begin_run(&mut self, eligible: impl Fn(&Chunk) -> bool) -> (CancellationToken, Vec<ExportEvent>) {
        let token = CancellationToken::new();
        self.run = Some(ActiveRun {
            token: token.clone(),
            chunk_ids: HashSet::new(),
            in_flight: None,
        });
        self.runs_started += 1;
        self.state.is_running = true;
        self.state.current_chunk_id = None;
        let events = self.enqueue(eligible);
        (token, events)
    }

    /// Pick the next `Waiting` chunk and mark it `InProcess`
    fn next_chunk(&mut self) -> Option<(Attempt, ExportEvent)> {
        let run = self.run.as_mut()?;
        let index = self.chunks.iter().position(|c| c.status == ChunkStatus::Waiting)?;
        let item = self
            .items
            .iter()
            .find(|i| i.id == self.chunks[index].item_id)
            .cloned()?;

        let chunk = &mut self.chunks[index];
        chunk.status = ChunkStatus::InProcess;
        chunk.progress = 0.0;
        chunk.error = None;
        let snapshot = chunk.clone();
        let event = status_event(chunk);

        self.attempts += 1;
        let token = run.token.child_token();
        run.in_flight = Some(InFlight {
            attempt: self.attempts,
            chunk_id: snapshot.id.clone(),
            item_id: snapshot.item_id.clone(),
            token: token.clone(),
        });
        self.state.current_chunk_id = Some(snapshot.id.clone());
        self.recompute_progress();

        let attempt = Attempt {
            number: self.attempts,
            item,
            chunk: snapshot,
            token,
        };
        Some((attempt, event))
    }

    /// The `InProcess` chunk owned by `attempt`, if that attempt is still in flight
    fn chunk_of_attempt(&mut self, attempt: u64) -> Option<&mut Chunk> {
        let in_flight = self.run.as_ref()?.in_flight.as_ref()?;
        if in_flight.attempt != attempt {
            return None;
        }
        let chunk_id = &in_flight.chunk_id;
        self.chunks
            .iter_mut()
            .find(|c| &c.id == chunk_id && c.status == ChunkStatus::InProcess)
    }

    fn record_progress(&mut self, attempt: u64, percentage: f64) -> Option<ExportEvent> {
        let chunk = self.chunk_of_attempt(attempt)?;
        if percentage <= chunk.progress {
            return None;
        }
        chunk.progress = percentage.min(100.0);
        let event = ExportEvent::ChunkProgress {
            chunk_id: chunk.id.clone(),
            percentage: chunk.progress,
        };
        self.recompute_progress();
        Some(event)
    }

    /// Apply the outcome of one processing attempt
    fn settle(&mut self, attempt: u64, result: Result<ChunkPayload, ExportError>) -> Vec<ExportEvent> {
        if self.chunk_of_attempt(attempt).is_none() {
            debug!("Dropping outcome of superseded attempt {}", attempt);
            if let Ok(ChunkPayload::File(path)) = &result {
                info!("Keeping {:?} written by superseded attempt {}", path, attempt);
            }
            return Vec::new();
        }

        let Some(in_flight) = self.run.as_mut().and_then(|run| run.in_flight.take()) else {
            return Vec::new();
        };
        if self.state.current_chunk_id.as_ref() == Some(&in_flight.chunk_id) {
            self.state.current_chunk_id = None;
        }
        let Some(chunk) = self.chunks.iter_mut().find(|c| c.id == in_flight.chunk_id) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        match result {
            Ok(payload) => {
                if chunk.progress < 100.0 {
                    chunk.progress = 100.0;
                    events.push(ExportEvent::ChunkProgress {
                        chunk_id: chunk.id.clone(),
                        percentage: 100.0,
                    });
                }
                chunk.status = ChunkStatus::Downloaded;
                chunk.error = None;
                chunk.payload = Some(payload);
                info!("Chunk {} downloaded", chunk.id);
                events.push(status_event(chunk));
            }
            Err(ExportError::Cancelled) => {
                reset_to_ready(chunk);
                info!("Chunk {} cancelled", chunk.id);
                events.push(status_event(chunk));
            }
            Err(e) => {
                if e.is_chunk_failure() {
                    warn!("Chunk {} failed: {}", chunk.id, e);
                } else {
                    error!("Chunk {} failed unexpectedly: {}", chunk.id, e);
                }
                let error = e.to_chunk_error();
                chunk.status = ChunkStatus::Errored;
                chunk.error = Some(error.clone());
                events.push(status_event(chunk));
                events.push(ExportEvent::ChunkFailed {
                    chunk_id: chunk.id.clone(),
                    error,
                });
            }
        }

        self.recompute_progress();
        events
    }

    /// Close the run once nothing is left `Waiting` or `InProcess`
    fn finish_run(&mut self) -> Vec<ExportEvent> {
        let Some(run) = self.run.take() else {
            return Vec::new();
        };
        self.state.is_running = false;
        self.state.current_chunk_id = None;

        let run_chunks: Vec<&Chunk> = self
            .chunks
            .iter()
            .filter(|c| run.chunk_ids.contains(&c.id))
            .collect();
        let failed = run_chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Downloaded)
            .count();
        info!(
            "Export run finished: {} chunk(s), {} not downloaded",
            run_chunks.len(),
            failed
        );

        let mut events = Vec::new();
        if !run_chunks.is_empty() && failed == 0 {
            events.push(ExportEvent::ExportSucceeded);
        }
        events.push(ExportEvent::ExportCompleted);
        events
    }

    /// Stop the active run: the in-flight chunk and `Waiting` chunks go back to `Ready`
    fn cancel_run(&mut self) -> Option<Vec<ExportEvent>> {
        let mut run = self.run.take()?;
        run.token.cancel();

        let mut events = Vec::new();
        if let Some(in_flight) = run.in_flight.take() {
            if let Some(chunk) = self
                .chunks
                .iter_mut()
                .find(|c| c.id == in_flight.chunk_id && c.status == ChunkStatus::InProcess)
            {
                reset_to_ready(chunk);
                events.push(status_event(chunk));
            }
        }
        for chunk in self
            .chunks
            .iter_mut()
            .filter(|c| c.status == ChunkStatus::Waiting)
        {
            reset_to_ready(chunk);
            events.push(status_event(chunk));
        }
        self.state.is_running = false;
        self.state.current_chunk_id = None;
        self.state.progress = 0.0;
        events.push(ExportEvent::ExportCancelled);
        Some(events)
    }

    pub(crate) fn remove_item(&mut self, id: &str) -> Result<(), ExportError> {
        let position = self
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| ExportError::ItemNotFound(id.to_string()))?;

        if let Some(run) = self.run.as_mut() {
            if run.in_flight.as_ref().is_some_and(|f| f.item_id == id) {
                if let Some(in_flight) = run.in_flight.take() {
                    info!("Cancelling in-flight chunk {} of removed item {}", in_flight.chunk_id, id);
                    in_flight.token.cancel();
                }
            }
            let removed: Vec<String> = self
                .chunks
                .iter()
                .filter(|c| c.item_id == id)
                .map(|c| c.id.clone())
                .collect();
            for chunk_id in &removed {
                run.chunk_ids.remove(chunk_id);
            }
        }

        if let Some(current) = self.state.current_chunk_id.as_deref() {
            if self.chunks.iter().any(|c| c.id == current && c.item_id == id) {
                self.state.current_chunk_id = None;
            }
        }

        self.items.remove(position);
        self.chunks.retain(|c| c.item_id != id);
        self.recompute_progress();
        Ok(())
    }

    /// Duration-weighted completion over the chunks of the active run
    fn recompute_progress(&mut self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };

        let (mut done, mut total) = (0.0, 0.0);
        for chunk in self.chunks.iter().filter(|c| run.chunk_ids.contains(&c.id)) {
            let weight = chunk.duration_ms() as f64;
            total += weight;
            done += weight * chunk.completion() / 100.0;
        }
        self.state.progress = if total > 0.0 { done / total * 100.0 } else { 0.0 };
    }
}

impl ExportEngine {
    // ========================================================================
    // Run Controls
    // ========================================================================

    /// Export every `Ready` chunk. Resolves when the run completes or is cancelled.
    pub async fn start_export(&self) -> Result<(), ExportError> {
        let ready = |c: &Chunk| c.status == ChunkStatus::Ready;

        let (_run_guard, token, events) = match self.claim_run(&ready, false) {
            RunClaim::Opened(guard, token, events) => (guard, token, events),
            RunClaim::Joined(_) | RunClaim::Busy => return Err(ExportError::ExportInProgress),
            RunClaim::WindingDown { runs_started } => {
                debug!("Waiting for the cancelled run to wind down");
                let guard = self.inner.run_lock.lock().await;
                let opened = {
                    let mut data = self.inner.data.lock();
                    // Another start may have claimed the run while we waited
                    if data.state.is_running || data.runs_started != runs_started {
                        None
                    } else {
                        Some(data.begin_run(ready))
                    }
                };
                let (token, events) = opened.ok_or(ExportError::ExportInProgress)?;
                (guard, token, events)
            }
        };
        info!("Starting export of {} queued chunk(s)", events.len());
        self.inner.events.emit_all(events);

        self.drive(token).await;
        Ok(())
    }

    /// Export or retry a single chunk
    pub async fn start_chunk_export(&self, id: &str) -> Result<(), ExportError> {
        self.start_chunks_export(&[id]).await
    }

    /// Export or retry the given chunks. `Downloaded` chunks are left alone.
    ///
    /// While a run is active the chunks join it and this returns at once.
    /// Otherwise a run restricted to these chunks is driven to completion.
    pub async fn start_chunks_export<S: AsRef<str>>(&self, ids: &[S]) -> Result<(), ExportError> {
        let wanted: HashSet<String> = ids.iter().map(|id| id.as_ref().to_string()).collect();
        let eligible = |c: &Chunk| {
            wanted.contains(&c.id) && matches!(c.status, ChunkStatus::Ready | ChunkStatus::Errored)
        };

        self.inner.data.lock().ensure_chunks_exist(ids)?;
        let (_run_guard, token, events) = match self.claim_run(&eligible, true) {
            RunClaim::Opened(guard, token, events) => (guard, token, events),
            RunClaim::Joined(events) => {
                debug!("Queued {} chunk(s) into the active run", events.len());
                self.inner.events.emit_all(events);
                return Ok(());
            }
            RunClaim::Busy => return Err(ExportError::ExportInProgress),
            RunClaim::WindingDown { .. } => {
                let guard = self.inner.run_lock.lock().await;
                let (token, events) = self.inner.data.lock().begin_run(&eligible);
                (guard, token, events)
            }
        };
        info!("Starting export of {} selected chunk(s)", events.len());
        self.inner.events.emit_all(events);

        self.drive(token).await;
        Ok(())
    }

    /// Open a run in the same critical section that observes the engine idle
    fn claim_run(&self, eligible: &impl Fn(&Chunk) -> bool, join_active: bool) -> RunClaim<'_> {
        let mut data = self.inner.data.lock();
        if data.state.is_running {
            if !join_active {
                return RunClaim::Busy;
            }
            return RunClaim::Joined(data.enqueue(eligible));
        }
        match self.inner.run_lock.try_lock() {
            Ok(guard) => {
                let (token, events) = data.begin_run(eligible);
                RunClaim::Opened(guard, token, events)
            }
            Err(_) => RunClaim::WindingDown {
                runs_started: data.runs_started,
            },
        }
    }

    /// Cancel the active run. Returns false when nothing was running.
    pub fn cancel(&self) -> bool {
        let events = self.inner.data.lock().cancel_run();
        match events {
            Some(events) => {
                info!("Export cancelled");
                self.inner.events.emit_all(events);
                true
            }
            None => false,
        }
    }

    /// Cancel once `confirm` resolves true. Returns whether a run was cancelled.
    pub async fn cancel_with_confirmation<F>(&self, confirm: F) -> bool
    where
        F: Future<Output = bool>,
    {
        if !self.is_running() {
            return false;
        }
        if !confirm.await {
            debug!("Cancellation declined");
            return false;
        }
        self.cancel()
    }

    /// Process `Waiting` chunks one at a time until none is left or the run is cancelled
    async fn drive(&self, token: CancellationToken) {
        let destination = self.destination();
        let strategy = SinkStrategy::select(destination.as_deref()).await;

        loop {
            let next = {
                let mut data = self.inner.data.lock();
                if token.is_cancelled() {
                    return;
                }
                data.next_chunk()
            };
            let Some((attempt, event)) = next else {
                break;
            };
            self.inner.events.emit(event);

            info!(
                "Processing chunk {} ({} - {})",
                attempt.chunk.id, attempt.chunk.start_time, attempt.chunk.end_time
            );
            let result = self.process_chunk(&attempt, &strategy).await;

            let events = self.inner.data.lock().settle(attempt.number, result);
            self.inner.events.emit_all(events);
        }

        let events = {
            let mut data = self.inner.data.lock();
            if token.is_cancelled() {
                return;
            }
            data.finish_run()
        };
        self.inner.events.emit_all(events);
    }

    /// Resolve, download and commit one chunk
    async fn process_chunk(
        &self,
        attempt: &Attempt,
        strategy: &SinkStrategy,
    ) -> Result<ChunkPayload, ExportError> {
        let Attempt { item, chunk, token, .. } = attempt;
        let url = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ExportError::Cancelled),
            url = self.inner.resolver.resolve(item, chunk) => url?,
        };

        let mut body = self.inner.downloader.fetch(&url, token).await?;

        let filename = generate_filename(
            &item.camera_name,
            chunk.start_time,
            chunk.end_time,
            self.inner.config.format,
        );
        let mut sink = strategy.open(&filename).await?;

        let written = self.pump(attempt, &mut body, sink.as_mut()).await;
        let committed = match written {
            Ok(()) => sink.finalize().await,
            Err(e) => Err(e),
        };
        if committed.is_err() {
            sink.abort().await;
        }
        committed
    }

    /// Copy the body into the sink, reporting progress along the way
    async fn pump(
        &self,
        attempt: &Attempt,
        body: &mut DownloadBody,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), ExportError> {
        let mut reported = 0.0;
        while let Some(bytes) = body.next_chunk().await? {
            sink.write(&bytes).await?;

            let percentage = body.percentage();
            if percentage - reported >= PROGRESS_STEP {
                reported = percentage;
                let event = self.inner.data.lock().record_progress(attempt.number, percentage);
                if let Some(event) = event {
                    self.inner.events.emit(event);
                }
            }
        }

        if attempt.token.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        debug!("Chunk {}: received {} bytes", attempt.chunk.id, body.received_bytes());
        Ok(())
    }
}
