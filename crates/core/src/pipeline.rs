//! Per-job processing: transcribe, write captions, burn them in.
//!
//! The pipeline is the only writer of a job's intermediate statuses. Each
//! stage transition goes through the registry, so a job that was evicted
//! mid-flight is noticed at the next transition and the run stops there.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::burn_in::{BurnInError, BurnRequest, SubtitleBurner};
use crate::job::{JobStatus, JobUpdate};
use crate::registry::{JobRegistry, RegistryError};
use crate::subtitles;
use crate::transcription::{Transcriber, TranscriptionError, TranscriptionRequest};
use crate::workdir::WorkDir;

pub const MISSING_OUTPUT_MESSAGE: &str =
    "Output video file was not created, but SRT file is available";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("no speech detected")]
    NoSpeech,
    #[error("{0}")]
    Transcription(TranscriptionError),
    #[error("failed to write subtitles: {0}")]
    Subtitles(String),
    #[error("job was removed while processing")]
    Evicted,
    #[error("processing cancelled")]
    Cancelled,
    #[error("job registry rejected update: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for PipelineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => PipelineError::Evicted,
            other => PipelineError::Registry(other),
        }
    }
}

impl From<TranscriptionError> for PipelineError {
    fn from(err: TranscriptionError) -> Self {
        match err {
            TranscriptionError::Cancelled => PipelineError::Cancelled,
            // A track-less clip is reported the same way as a silent one.
            TranscriptionError::NoAudio => PipelineError::NoSpeech,
            other => PipelineError::Transcription(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub job_id: String,
    pub original_filename: String,
    pub input_path: PathBuf,
}

#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<dyn JobRegistry>,
    workdir: WorkDir,
    transcriber: Arc<dyn Transcriber>,
    burner: Arc<dyn SubtitleBurner>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        workdir: WorkDir,
        transcriber: Arc<dyn Transcriber>,
        burner: Arc<dyn SubtitleBurner>,
    ) -> Self {
        Self {
            registry,
            workdir,
            transcriber,
            burner,
        }
    }

    pub fn transcriber(&self) -> &Arc<dyn Transcriber> {
        &self.transcriber
    }

    pub fn burner(&self) -> &Arc<dyn SubtitleBurner> {
        &self.burner
    }

    fn advance(
        &self,
        job_id: &str,
        status: JobStatus,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.registry.update(job_id, JobUpdate::advance(status))?;
        info!(job_id, status = %status, "Job advanced");
        Ok(())
    }

    /// Drives one job from `uploaded` to a terminal status.
    ///
    /// Terminal outcomes reached here are `completed` and `completed_srt_only`.
    /// Every error is returned to the caller, which owns the `failed` transition.
    pub async fn run(
        &self,
        input: &PipelineInput,
        cancel: &CancellationToken,
    ) -> Result<JobStatus, PipelineError> {
        let job_id = input.job_id.as_str();

        self.advance(job_id, JobStatus::Transcribing, cancel)?;
        let request = TranscriptionRequest::new(
            job_id,
            &input.input_path,
            &self.workdir.scratch_stem(job_id),
        );
        let transcript = self.transcriber.transcribe(&request, cancel).await?;
        if transcript.segments.is_empty() {
            return Err(PipelineError::NoSpeech);
        }

        self.advance(job_id, JobStatus::GeneratingCaptions, cancel)?;
        let srt_name = WorkDir::srt_file_name(job_id);
        let srt_path = self.workdir.srt_path(job_id);
        subtitles::write_srt(&srt_path, &transcript.segments)
            .await
            .map_err(|err| PipelineError::Subtitles(format!("{err:#}")))?;

        self.advance(job_id, JobStatus::EmbeddingSubtitles, cancel)?;
        let output_name = WorkDir::output_file_name(job_id, &input.original_filename);
        let output_path = self.workdir.output_path(job_id, &input.original_filename);
        let burn = BurnRequest {
            job_id: job_id.to_string(),
            input: input.input_path.clone(),
            subtitles: srt_path,
            output: output_path.clone(),
        };
        let burned = self.burner.burn(&burn, cancel).await;

        let srt_url = format!("/download_srt/{srt_name}");
        let update = match burned {
            Err(BurnInError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                warn!(job_id, error = %err, "Subtitle burn-in failed; keeping captions only");
                JobUpdate::srt_only(srt_url, format!("Failed to embed subtitles: {err}"))
            }
            Ok(()) if output_is_present(&output_path).await => JobUpdate::completed(
                format!("/download/{output_name}"),
                srt_url,
            ),
            Ok(()) => {
                warn!(job_id, output = %output_path.display(), "Burn-in reported success but produced no output");
                JobUpdate::srt_only(srt_url, MISSING_OUTPUT_MESSAGE)
            }
        };

        let finished = self.registry.update(job_id, update)?;
        self.reclaim_intermediates(job_id, finished.status, &input.input_path, &output_path);
        info!(job_id, status = %finished.status, "Job finished");
        Ok(finished.status)
    }

    /// Deletes the upload, and for SRT-only results any partial render.
    fn reclaim_intermediates(
        &self,
        job_id: &str,
        status: JobStatus,
        input_path: &Path,
        output_path: &Path,
    ) {
        let mut report = self.workdir.remove_file(input_path);
        if status == JobStatus::CompletedSrtOnly {
            report.merge(self.workdir.remove_file(output_path));
        }
        if report.failures > 0 {
            warn!(job_id, failures = report.failures, "Some intermediate files could not be deleted");
        }
    }
}

async fn output_is_present(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}
