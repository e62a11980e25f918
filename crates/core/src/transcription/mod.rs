//! Speech-to-text behind a narrow trait so the pipeline can run against
//! `whisper-cli` in production and an in-process fake in tests.

mod model;
mod whisper;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use model::{ModelManager, ModelState};
pub use whisper::WhisperCli;

/// One timed span of recognised speech, in seconds from the start of the media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    /// Name of the model variant that produced the transcript.
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub job_id: String,
    pub media_path: PathBuf,
    /// Stem for scratch files; the transcriber removes whatever it creates there.
    pub scratch_stem: PathBuf,
}

impl TranscriptionRequest {
    pub fn new(job_id: &str, media_path: &Path, scratch_stem: &Path) -> Self {
        Self {
            job_id: job_id.to_string(),
            media_path: media_path.to_path_buf(),
            scratch_stem: scratch_stem.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptionError {
    #[error("input media not found: {0}")]
    MediaMissing(String),
    #[error("input has no audio stream")]
    NoAudio,
    #[error("speech engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("speech engine ran out of resources: {0}")]
    ResourceExhausted(String),
    #[error("transcription failed: {0}")]
    Failed(String),
    #[error("transcription cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        cancel: &CancellationToken,
    ) -> Result<Transcript, TranscriptionError>;

    /// Short description for `/system_info`.
    fn describe(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Drops empty segments and whisper's non-speech markers such as `[BLANK_AUDIO]`.
pub fn retain_speech(segments: Vec<Segment>) -> Vec<Segment> {
    segments
        .into_iter()
        .map(|segment| Segment {
            text: segment.text.trim().to_string(),
            ..segment
        })
        .filter(|segment| !segment.text.is_empty() && !is_non_speech_marker(&segment.text))
        .collect()
}

fn is_non_speech_marker(text: &str) -> bool {
    let bracketed = (text.starts_with('[') && text.ends_with(']'))
        || (text.starts_with('(') && text.ends_with(')'));
    bracketed
        && text[1..text.len() - 1]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '_' || c == ' ')
}
