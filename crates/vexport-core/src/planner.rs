//! Chunk planner - splits an export item into bounded-duration chunks
//!
//! Planning is pure: the same item and bounds always produce the same
//! chunks, which tile `[start_time, end_time)` in ascending order.

use crate::error::ExportError;
use vexport_types::{Chunk, ExportItem};

/// Split `item` into chunks of at most `max_chunk_duration` milliseconds.
///
/// A trailing remainder shorter than `min_chunk_duration` is folded into the
/// previous chunk instead of becoming a chunk of its own. A minimum larger
/// than the maximum is treated as equal to the maximum.
pub fn plan_chunks(
    item: &ExportItem,
    max_chunk_duration: u64,
    min_chunk_duration: u64,
) -> Result<Vec<Chunk>, ExportError> {
    if item.end_time <= item.start_time {
        return Err(ExportError::InvalidTimeRange {
            start: item.start_time,
            end: item.end_time,
        });
    }
    if max_chunk_duration == 0 {
        return Err(ExportError::InvalidConfig(
            "max chunk duration must be greater than zero".to_string(),
        ));
    }

    let max = i64::try_from(max_chunk_duration).unwrap_or(i64::MAX);
    let min = i64::try_from(min_chunk_duration.min(max_chunk_duration)).unwrap_or(max);

    let mut bounds: Vec<(i64, i64)> = Vec::new();
    let mut start = item.start_time;
    while start < item.end_time {
        let len = max.min(item.end_time - start);
        bounds.push((start, start + len));
        start += len;
    }

    if bounds.len() > 1 {
        if let Some(&(tail_start, tail_end)) = bounds.last() {
            if tail_end - tail_start < min {
                bounds.pop();
                if let Some(previous) = bounds.last_mut() {
                    previous.1 = tail_end;
                }
            }
        }
    }

    Ok(bounds
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| Chunk::new(&item.id, index as u32, start, end))
        .collect())
}
