use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    retain_speech, ModelManager, Segment, Transcriber, Transcript, TranscriptionError,
    TranscriptionRequest,
};
use crate::config::{ModelVariantConfig, TranscriptionConfig};
use crate::runtime::{self, ToolOutcome};

const AUDIO_SAMPLE_RATE: &str = "16000";
const STDERR_TAIL_LINES: usize = 6;

const NO_AUDIO_MARKERS: [&str; 3] = [
    "does not contain any stream",
    "matches no streams",
    "output file is empty",
];
const RESOURCE_MARKERS: [&str; 4] = [
    "out of memory",
    "failed to allocate",
    "bad_alloc",
    "cannot allocate memory",
];

/// Speech recognition through the `whisper-cli` sidecar of whisper.cpp.
///
/// The media is first reduced to 16 kHz mono PCM by ffmpeg, since whisper-cli
/// only reads WAV. Both intermediate files live next to the job's other
/// artifacts and are removed before `transcribe` returns.
pub struct WhisperCli {
    whisper_binary: String,
    ffmpeg_binary: String,
    language: String,
    threads: u32,
    models: Arc<ModelManager>,
}

#[derive(Debug, Deserialize)]
struct WhisperJson {
    #[serde(default)]
    transcription: Vec<WhisperJsonSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperJsonSegment {
    offsets: WhisperOffsets,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: u64,
    to: u64,
}

impl WhisperCli {
    pub fn new(config: &TranscriptionConfig, models: Arc<ModelManager>) -> Self {
        Self {
            whisper_binary: config.whisper_binary.clone(),
            ffmpeg_binary: config.ffmpeg_binary.clone(),
            language: config.language.clone(),
            threads: config.threads.max(1),
            models,
        }
    }

    fn extract_audio_args(media: &Path, wav: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-y", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(media.as_os_str().to_owned());
        args.extend(
            [
                "-vn",
                "-ac",
                "1",
                "-ar",
                AUDIO_SAMPLE_RATE,
                "-c:a",
                "pcm_s16le",
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(wav.as_os_str().to_owned());
        args
    }

    fn whisper_args(&self, model: &ModelVariantConfig, wav: &Path, out_stem: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        args.push("--model".into());
        args.push(model.path.as_os_str().to_owned());
        args.push("--language".into());
        args.push(self.language.as_str().into());
        args.push("--threads".into());
        args.push(self.threads.to_string().into());
        args.push("--output-json".into());
        args.push("--output-file".into());
        args.push(out_stem.as_os_str().to_owned());
        args.push("--no-prints".into());
        args.push("--file".into());
        args.push(wav.as_os_str().to_owned());
        args
    }

    async fn extract_audio(
        &self,
        request: &TranscriptionRequest,
        wav: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TranscriptionError> {
        let mut command = runtime::command_for(&self.ffmpeg_binary);
        command.args(Self::extract_audio_args(&request.media_path, wav));

        let output = finished(
            runtime::run_cancellable(command, cancel).await,
            &self.ffmpeg_binary,
        )?;
        for line in runtime::stderr_lines(&output.stderr) {
            debug!(target: "ffmpeg_stderr", job_id = %request.job_id, "{line}");
        }

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_ascii_lowercase();
        if NO_AUDIO_MARKERS.iter().any(|marker| stderr.contains(marker)) {
            return Err(TranscriptionError::NoAudio);
        }
        Err(TranscriptionError::Failed(format!(
            "audio extraction exited with {}: {}",
            output.status,
            runtime::stderr_tail(&output.stderr, STDERR_TAIL_LINES)
        )))
    }

    async fn run_whisper(
        &self,
        request: &TranscriptionRequest,
        model: &ModelVariantConfig,
        wav: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<Segment>, TranscriptionError> {
        let out_stem = &request.scratch_stem;
        let mut command = runtime::command_for(&self.whisper_binary);
        command.args(self.whisper_args(model, wav, out_stem));

        let output = finished(
            runtime::run_cancellable(command, cancel).await,
            &self.whisper_binary,
        )?;
        for line in runtime::stderr_lines(&output.stderr) {
            debug!(target: "whisper_stderr", job_id = %request.job_id, "{line}");
        }

        if !output.status.success() {
            return Err(classify_whisper_failure(&output));
        }

        let json_path = json_output_path(out_stem);
        let raw = tokio::fs::read(&json_path).await.map_err(|err| {
            TranscriptionError::Failed(format!(
                "whisper produced no JSON output at {}: {err}",
                json_path.display()
            ))
        })?;
        parse_whisper_json(&raw)
    }

    async fn transcribe_with_fallback(
        &self,
        request: &TranscriptionRequest,
        wav: &Path,
        cancel: &CancellationToken,
    ) -> Result<Transcript, TranscriptionError> {
        let mut model = self.models.acquire().await?;
        loop {
            match self.run_whisper(request, &model, wav, cancel).await {
                Ok(segments) => {
                    return Ok(Transcript {
                        segments: retain_speech(segments),
                        model: model.name,
                    })
                }
                Err(TranscriptionError::ResourceExhausted(reason)) => {
                    warn!(job_id = %request.job_id, model = %model.name, %reason, "Speech engine exhausted resources");
                    match self.models.degrade(&model.name).await? {
                        Some(next) => model = next,
                        None => return Err(TranscriptionError::ResourceExhausted(reason)),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Transcriber for WhisperCli {
    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        cancel: &CancellationToken,
    ) -> Result<Transcript, TranscriptionError> {
        if !tokio::fs::try_exists(&request.media_path)
            .await
            .unwrap_or(false)
        {
            return Err(TranscriptionError::MediaMissing(
                request.media_path.display().to_string(),
            ));
        }

        let wav = request.scratch_stem.with_extension("wav");
        let result = match self.extract_audio(request, &wav, cancel).await {
            Ok(()) => self.transcribe_with_fallback(request, &wav, cancel).await,
            Err(err) => Err(err),
        };

        for scratch in [wav, json_output_path(&request.scratch_stem)] {
            if let Err(err) = tokio::fs::remove_file(&scratch).await {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %scratch.display(), error = %err, "Failed to remove transcription scratch file");
                }
            }
        }

        if let Ok(transcript) = &result {
            info!(
                job_id = %request.job_id,
                model = %transcript.model,
                segments = transcript.segments.len(),
                "Transcription finished"
            );
        }
        result
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "engine": "whisper.cpp",
            "binary": self.whisper_binary,
            "language": self.language,
            "threads": self.threads,
        })
    }
}

fn finished(
    spawned: io::Result<ToolOutcome>,
    binary: &str,
) -> Result<Output, TranscriptionError> {
    match spawned {
        Ok(ToolOutcome::Finished(output)) => Ok(output),
        Ok(ToolOutcome::Cancelled) => Err(TranscriptionError::Cancelled),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(
            TranscriptionError::EngineUnavailable(format!("{binary} not found")),
        ),
        Err(err) => Err(TranscriptionError::Failed(format!(
            "failed to start {binary}: {err}"
        ))),
    }
}

fn json_output_path(out_stem: &Path) -> PathBuf {
    let mut name = out_stem.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

fn classify_whisper_failure(output: &Output) -> TranscriptionError {
    let stderr = String::from_utf8_lossy(&output.stderr).to_ascii_lowercase();
    // No exit code means the process was killed by a signal, typically the OOM killer.
    if output.status.code().is_none() || RESOURCE_MARKERS.iter().any(|m| stderr.contains(m)) {
        return TranscriptionError::ResourceExhausted(format!(
            "whisper exited with {}: {}",
            output.status,
            runtime::stderr_tail(&output.stderr, STDERR_TAIL_LINES)
        ));
    }
    TranscriptionError::Failed(format!(
        "whisper exited with {}: {}",
        output.status,
        runtime::stderr_tail(&output.stderr, STDERR_TAIL_LINES)
    ))
}

fn parse_whisper_json(raw: &[u8]) -> Result<Vec<Segment>, TranscriptionError> {
    let parsed: WhisperJson = serde_json::from_slice(raw)
        .map_err(|err| TranscriptionError::Failed(format!("malformed whisper JSON: {err}")))?;
    Ok(parsed
        .transcription
        .into_iter()
        .map(|segment| Segment {
            start: segment.offsets.from as f64 / 1000.0,
            end: segment.offsets.to.max(segment.offsets.from) as f64 / 1000.0,
            text: segment.text,
        })
        .collect())
}
