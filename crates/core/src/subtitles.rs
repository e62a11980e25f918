//! SubRip (`.srt`) rendering.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};

use crate::transcription::Segment;

/// Formats seconds as `HH:MM:SS,mmm`. Sub-millisecond precision is truncated;
/// negative and non-finite inputs clamp to zero.
pub fn format_timestamp(seconds: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    // Epsilon absorbs representation error, e.g. 3.042 * 1000 = 3041.999...
    let total_millis = (seconds * 1000.0 + 1e-6) as u64;
    let whole = total_millis / 1000;
    let millis = total_millis % 1000;

    let hours = whole / 3600;
    let minutes = (whole % 3600) / 60;
    let secs = whole % 60;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

/// Renders segments as numbered SRT cues, each followed by a blank line.
pub fn render_srt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for (index, segment) in segments.iter().enumerate() {
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_timestamp(segment.start),
            format_timestamp(segment.end),
            segment.text.trim()
        );
    }
    out
}

pub async fn write_srt(path: &Path, segments: &[Segment]) -> Result<()> {
    tokio::fs::write(path, render_srt(segments))
        .await
        .with_context(|| format!("failed to write subtitle file: {}", path.display()))
}
