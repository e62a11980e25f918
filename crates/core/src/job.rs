//! Job records and the per-job lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Uploaded,
    Transcribing,
    GeneratingCaptions,
    EmbeddingSubtitles,
    Completed,
    CompletedSrtOnly,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Uploaded,
        JobStatus::Transcribing,
        JobStatus::GeneratingCaptions,
        JobStatus::EmbeddingSubtitles,
        JobStatus::Completed,
        JobStatus::CompletedSrtOnly,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedSrtOnly | JobStatus::Failed
        )
    }

    /// Whether `self -> next` is an edge of the pipeline state machine.
    ///
    /// Stages advance strictly one at a time; `failed` is reachable from any
    /// non-terminal state and nothing leaves a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Uploaded, Transcribing)
            | (Transcribing, GeneratingCaptions)
            | (GeneratingCaptions, EmbeddingSubtitles)
            | (EmbeddingSubtitles, Completed)
            | (EmbeddingSubtitles, CompletedSrtOnly) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Uploaded => "uploaded",
            JobStatus::Transcribing => "transcribing",
            JobStatus::GeneratingCaptions => "generating_captions",
            JobStatus::EmbeddingSubtitles => "embedding_subtitles",
            JobStatus::Completed => "completed",
            JobStatus::CompletedSrtOnly => "completed_srt_only",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// Client-supplied name, display only. Never used to build paths.
    pub original_filename: String,
    pub error: Option<String>,
    pub download_url: Option<String>,
    pub srt_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancel_token: CancellationToken,
}

impl Job {
    pub fn new(id: String, original_filename: String, cancel_token: CancellationToken) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Uploaded,
            original_filename,
            error: None,
            download_url: None,
            srt_url: None,
            created_at: now,
            updated_at: now,
            cancel_token,
        }
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id.clone(),
            status: self.status,
            filename: self.original_filename.clone(),
            error: self.error.clone(),
            download_url: self.download_url.clone(),
            srt_url: self.srt_url.clone(),
            created_at: self.created_at,
        }
    }
}

/// Partial state applied by [`crate::registry::JobRegistry::update`].
///
/// Fields left as `None` keep their current value, except that moving to a
/// new status clears the result fields the caller did not supply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub error: Option<String>,
    pub download_url: Option<String>,
    pub srt_url: Option<String>,
}

impl JobUpdate {
    pub fn advance(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn completed(download_url: String, srt_url: String) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            error: None,
            download_url: Some(download_url),
            srt_url: Some(srt_url),
        }
    }

    pub fn srt_only(srt_url: String, error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::CompletedSrtOnly),
            error: Some(error.into()),
            download_url: None,
            srt_url: Some(srt_url),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            download_url: None,
            srt_url: None,
        }
    }
}

/// Client-facing copy of a job, as returned by `GET /status/{job_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srt_url: Option<String>,
    pub created_at: DateTime<Utc>,
}
