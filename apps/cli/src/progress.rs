//! Progress bar utilities for CLI exports

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::future::Future;
use vexport_core::ExportEngine;
use vexport_types::{ChunkStatus, ExportEvent};

/// Bars are in tenths of a percent
const BAR_SCALE: f64 = 10.0;

/// One overall bar for the run plus one bar per chunk in flight
pub struct ExportProgress {
    engine: ExportEngine,
    multi: MultiProgress,
    overall: ProgressBar,
    bars: HashMap<String, ProgressBar>,
    visible: bool,
}

fn chunk_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn overall_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:.bold} [{bar:40.green/white}] {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

impl ExportProgress {
    pub fn new(engine: ExportEngine, visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let multi = MultiProgress::with_draw_target(target);

        let overall = multi.add(ProgressBar::new(100 * BAR_SCALE as u64));
        overall.set_style(overall_style());
        overall.set_prefix("Export");
        overall.set_message(format!("{} chunk(s)", engine.all_chunks().len()));

        Self {
            engine,
            multi,
            overall,
            bars: HashMap::new(),
            visible,
        }
    }

    /// Update the bars from an event
    pub fn handle_event(&mut self, event: &ExportEvent) {
        match event {
            ExportEvent::ChunkStatusChanged {
                chunk_id,
                status,
                error,
                ..
            } => match status {
                ChunkStatus::InProcess => {
                    let pb = self.multi.add(ProgressBar::new(100 * BAR_SCALE as u64));
                    pb.set_style(chunk_style());
                    pb.set_message(chunk_id.clone());
                    self.bars.insert(chunk_id.clone(), pb);
                }
                ChunkStatus::Downloaded => {
                    if let Some(pb) = self.bars.remove(chunk_id) {
                        pb.finish_with_message(format!("{} {}", style("✓").green().bold(), chunk_id));
                    }
                }
                ChunkStatus::Errored => {
                    if let Some(pb) = self.bars.remove(chunk_id) {
                        pb.abandon_with_message(format!(
                            "{} {}: {}",
                            style("✗").red().bold(),
                            chunk_id,
                            error.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                }
                ChunkStatus::Ready => {
                    if let Some(pb) = self.bars.remove(chunk_id) {
                        pb.abandon_with_message(format!("{} {} cancelled", style("○").dim(), chunk_id));
                    }
                }
                ChunkStatus::Waiting => {}
            },

            ExportEvent::ChunkProgress { chunk_id, percentage } => {
                if let Some(pb) = self.bars.get(chunk_id) {
                    pb.set_position((percentage * BAR_SCALE) as u64);
                }
            }

            ExportEvent::ExportCancelled => {
                self.overall
                    .abandon_with_message(format!("{} Cancelled", style("○").dim()));
                return;
            }

            ExportEvent::ExportCompleted => {
                self.overall.finish_with_message("done");
                return;
            }

            _ => {}
        }

        let state = self.engine.state();
        self.overall.set_position((state.progress * BAR_SCALE) as u64);
    }

    /// Hide the bars while `f` runs, e.g. for an interactive prompt
    pub async fn suspend<F: Future>(&self, f: F) -> F::Output {
        self.multi.set_draw_target(ProgressDrawTarget::hidden());
        let output = f.await;
        if self.visible {
            self.multi.set_draw_target(ProgressDrawTarget::stderr());
        }
        output
    }

    /// Clear whatever bars are left
    pub fn finish(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
        if !self.overall.is_finished() {
            self.overall.finish_and_clear();
        }
    }
}
