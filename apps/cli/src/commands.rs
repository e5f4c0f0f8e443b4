//! CLI command implementations

use crate::output::{format_bytes, print_plan, print_reports, ChunkReport, PlannedChunk};
use crate::progress::ExportProgress;
use crate::OutputFormat;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use vexport_core::{
    format_duration, generate_filename, plan_chunks, ExportEngine, HttpLinkResolver,
};
use vexport_types::{ChunkPayload, ExportConfig, ExportItem};

fn load_items(path: &Path) -> Result<Vec<ExportItem>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read items {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid items file {}", path.display()))
}

// ============================================================================
// Plan
// ============================================================================

pub fn plan(config: &ExportConfig, items_path: &Path, format: OutputFormat) -> Result<()> {
    let items = load_items(items_path)?;

    let mut chunks = Vec::new();
    for item in &items {
        for chunk in plan_chunks(item, config.max_chunk_duration, config.min_chunk_duration)? {
            chunks.push(PlannedChunk {
                duration: format_duration(chunk.duration_ms().max(0) as u64),
                filename: generate_filename(&item.camera_name, chunk.start_time, chunk.end_time, config.format),
                id: chunk.id,
                start_time: chunk.start_time,
                end_time: chunk.end_time,
            });
        }
    }
    print_plan(&chunks, format)
}

// ============================================================================
// Run
// ============================================================================

pub async fn run(
    config: ExportConfig,
    items_path: &Path,
    endpoint: &str,
    token: Option<String>,
    assume_yes: bool,
    format: OutputFormat,
) -> Result<()> {
    let items = load_items(items_path)?;

    let mut resolver = HttpLinkResolver::new(endpoint)?;
    if let Some(token) = token {
        resolver = resolver.with_token(token);
    }

    let destination = config
        .destination
        .clone()
        .or_else(|| dirs::download_dir().map(|d| d.join("vexport")))
        .unwrap_or_else(|| PathBuf::from("."));

    let engine = ExportEngine::builder(resolver).config(config).build()?;
    engine.set_destination(Some(destination));
    engine.add_items(items)?;

    let mut progress = ExportProgress::new(engine.clone(), matches!(format, OutputFormat::Human));
    let mut events = engine.subscribe();

    let runner = engine.clone();
    let mut run = tokio::spawn(async move { runner.start_export().await });

    loop {
        tokio::select! {
            result = &mut run => {
                result.context("export task panicked")??;
                while let Ok(event) = events.try_recv() {
                    progress.handle_event(&event);
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => progress.handle_event(&event),
                Err(RecvError::Lagged(skipped)) => debug!("Progress display skipped {} events", skipped),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                let cancelled = if assume_yes || !engine.should_warn_before_unload() {
                    engine.cancel()
                } else {
                    progress.suspend(engine.cancel_with_confirmation(confirm_cancel())).await
                };
                if !cancelled {
                    debug!("Export continues");
                }
            }
        }
    }
    progress.finish();

    let reports = collect_reports(&engine)?;
    print_reports(&reports, format)
}

async fn confirm_cancel() -> bool {
    tokio::task::spawn_blocking(|| {
        dialoguer::Confirm::new()
            .with_prompt("Cancel the running export?")
            .default(false)
            .interact()
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

/// Pair each chunk with its file, writing memory-buffered chunks out to the working directory
fn collect_reports(engine: &ExportEngine) -> Result<Vec<ChunkReport>> {
    let mut reports = Vec::new();
    for item in engine.items() {
        for chunk in engine.chunks_for_item(&item.id)? {
            let payload = engine.take_chunk_payload(&chunk.id)?;
            let buffered = payload.as_ref().and_then(ChunkPayload::byte_len);
            let (file, size) = match payload {
                Some(ChunkPayload::File(path)) => {
                    let size = std::fs::metadata(&path).ok().map(|m| m.len());
                    (Some(path), size)
                }
                Some(ChunkPayload::Memory(bytes)) => {
                    let path = PathBuf::from(generate_filename(
                        &item.camera_name,
                        chunk.start_time,
                        chunk.end_time,
                        engine.config().format,
                    ));
                    warn!(
                        "Destination unavailable, writing {} to {}",
                        format_bytes(buffered.unwrap_or_default()),
                        path.display()
                    );
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    (Some(path), buffered)
                }
                None => (None, None),
            };
            reports.push(ChunkReport { chunk, file, size });
        }
    }
    Ok(reports)
}
