//! Human-facing formatting for durations and export filenames
//!
//! Filenames are rendered in UTC unless the caller picks a timezone
//! through [`generate_filename_in`].

use chrono::{DateTime, TimeZone, Utc};
use vexport_types::ExportFormat;

/// Format a duration in milliseconds as `HH:MM:SS`. Hours do not wrap.
pub fn format_duration(duration_ms: u64) -> String {
    let total_secs = duration_ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// `<camera>_<YYYY-MM-DD>_<HH-MM-SS>_to_<HH-MM-SS>.<ext>`, rendered in UTC
pub fn generate_filename(camera_name: &str, start_ms: i64, end_ms: i64, format: ExportFormat) -> String {
    generate_filename_in(&Utc, camera_name, start_ms, end_ms, format)
}

/// Same as [`generate_filename`], with timestamps rendered in `tz`
pub fn generate_filename_in<Tz: TimeZone>(
    tz: &Tz,
    camera_name: &str,
    start_ms: i64,
    end_ms: i64,
    format: ExportFormat,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let start = at(tz, start_ms);
    let end = at(tz, end_ms);
    format!(
        "{}_{}_{}_to_{}.{}",
        sanitize_camera_name(camera_name),
        start.format("%Y-%m-%d"),
        start.format("%H-%M-%S"),
        end.format("%H-%M-%S"),
        format.extension()
    )
}

fn at<Tz: TimeZone>(tz: &Tz, millis: i64) -> DateTime<Tz> {
    tz.timestamp_millis_opt(millis)
        .earliest()
        .unwrap_or_else(|| DateTime::<Utc>::default().with_timezone(tz))
}

/// Replace everything but ASCII letters and digits with `_`
fn sanitize_camera_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if sanitized.is_empty() {
        "camera".to_string()
    } else {
        sanitized
    }
}
