//! Rendering of chunk plans and run reports

use crate::OutputFormat;
use anyhow::Result;
use console::style;
use serde::Serialize;
use std::path::PathBuf;
use tabled::{Table, Tabled};
use vexport_core::format_duration;
use vexport_types::{Chunk, ChunkStatus};

#[derive(Serialize)]
pub struct PlannedChunk {
    pub id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: String,
    pub filename: String,
}

/// Final state of one chunk and where its bytes ended up
#[derive(Serialize)]
pub struct ChunkReport {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub file: Option<PathBuf>,
    pub size: Option<u64>,
}

pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn print_plan(chunks: &[PlannedChunk], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Plan<'a> {
                chunks: &'a [PlannedChunk],
            }
            println!("{}", serde_json::to_string_pretty(&Plan { chunks })?);
        }
        OutputFormat::Table => {
            #[derive(Tabled)]
            struct PlanRow {
                id: String,
                duration: String,
                filename: String,
            }

            let rows: Vec<PlanRow> = chunks
                .iter()
                .map(|c| PlanRow {
                    id: c.id.clone(),
                    duration: c.duration.clone(),
                    filename: c.filename.clone(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for chunk in chunks {
                println!("{} {} [{}]", style("·").dim(), style(&chunk.filename).bold(), chunk.duration);
            }
            println!("{} chunk(s) planned", style(chunks.len()).bold());
        }
    }
    Ok(())
}

pub fn print_reports(reports: &[ChunkReport], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(reports)?);
        }
        OutputFormat::Table => {
            #[derive(Tabled)]
            struct ChunkRow {
                id: String,
                status: String,
                size: String,
                file: String,
                error: String,
            }

            let rows: Vec<ChunkRow> = reports
                .iter()
                .map(|r| ChunkRow {
                    id: r.chunk.id.clone(),
                    status: r.chunk.status.to_string(),
                    size: r.size.map(format_bytes).unwrap_or_default(),
                    file: r
                        .file
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    error: r
                        .chunk
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_default(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for report in reports {
                print_chunk_summary(report);
            }
            let downloaded: Vec<&ChunkReport> = reports
                .iter()
                .filter(|r| r.chunk.status == ChunkStatus::Downloaded)
                .collect();
            let total: u64 = downloaded.iter().filter_map(|r| r.size).sum();
            println!();
            println!(
                "{}/{} chunk(s) exported, {}",
                style(downloaded.len()).bold(),
                reports.len(),
                format_bytes(total)
            );
        }
    }
    Ok(())
}

fn print_chunk_summary(report: &ChunkReport) {
    let chunk = &report.chunk;
    let status_icon = match chunk.status {
        ChunkStatus::Downloaded => style("✓").green(),
        ChunkStatus::Errored => style("✗").red(),
        ChunkStatus::InProcess | ChunkStatus::Waiting => style("↓").cyan(),
        ChunkStatus::Ready => style("○").dim(),
    };

    let target = report
        .file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| chunk.id.clone());
    let mut detail = format_duration(chunk.duration_ms().max(0) as u64);
    if let Some(size) = report.size {
        detail = format!("{}, {}", detail, format_bytes(size));
    }
    println!("{} {} [{}]", status_icon, style(target).bold(), style(detail).dim());
    if let Some(error) = &chunk.error {
        println!("    Error: {}", style(&error.message).red());
    }
}
