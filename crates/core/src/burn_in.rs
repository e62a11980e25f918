//! Hard-coding subtitles into the video stream with ffmpeg's `subtitles` filter.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BurnInConfig;
use crate::runtime::{self, ToolOutcome};

const STDERR_TAIL_LINES: usize = 6;

#[derive(Debug, Clone)]
pub struct BurnRequest {
    pub job_id: String,
    pub input: PathBuf,
    pub subtitles: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BurnInError {
    #[error("failed to start encoder: {0}")]
    Spawn(String),
    #[error("encoder failed: {0}")]
    Failed(String),
    #[error("encoding cancelled")]
    Cancelled,
}

#[async_trait]
pub trait SubtitleBurner: Send + Sync {
    /// Writes `request.output`. Callers must still check that the file exists.
    async fn burn(&self, request: &BurnRequest, cancel: &CancellationToken)
        -> Result<(), BurnInError>;

    fn describe(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

pub struct FfmpegBurner {
    config: BurnInConfig,
}

impl FfmpegBurner {
    pub fn new(config: BurnInConfig) -> Self {
        Self { config }
    }

    fn filter_graph(&self, subtitles: &Path) -> String {
        format!(
            "subtitles='{}':force_style='{}'",
            escape_filter_value(&subtitles.to_string_lossy()),
            self.config.force_style
        )
    }

    pub(crate) fn build_args(&self, request: &BurnRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-y", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(request.input.as_os_str().to_owned());
        args.push("-vf".into());
        args.push(self.filter_graph(&request.subtitles).into());
        args.push("-c:a".into());
        args.push("copy".into());
        args.push("-c:v".into());
        args.push(self.config.video_codec.as_str().into());
        args.push("-preset".into());
        args.push(self.config.preset.as_str().into());
        args.push("-crf".into());
        args.push(self.config.crf.to_string().into());
        args.push(request.output.as_os_str().to_owned());
        args
    }
}

/// Escapes a value for a single-quoted ffmpeg filter option.
///
/// Backslashes and colons are escaped for the option parser; a single quote
/// ends the quoted run, is emitted escaped, and reopens the quote.
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            ':' => escaped.push_str("\\:"),
            '\'' => escaped.push_str("'\\''"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[async_trait]
impl SubtitleBurner for FfmpegBurner {
    async fn burn(
        &self,
        request: &BurnRequest,
        cancel: &CancellationToken,
    ) -> Result<(), BurnInError> {
        let mut command = runtime::command_for(&self.config.ffmpeg_binary);
        command.args(self.build_args(request));
        debug!(job_id = %request.job_id, output = %request.output.display(), "Starting subtitle burn-in");

        let output = match runtime::run_cancellable(command, cancel).await {
            Ok(ToolOutcome::Finished(output)) => output,
            Ok(ToolOutcome::Cancelled) => return Err(BurnInError::Cancelled),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(BurnInError::Spawn(format!(
                    "{} not found",
                    self.config.ffmpeg_binary
                )))
            }
            Err(err) => return Err(BurnInError::Spawn(err.to_string())),
        };

        for line in runtime::stderr_lines(&output.stderr) {
            debug!(target: "ffmpeg_stderr", job_id = %request.job_id, "{line}");
        }

        if !output.status.success() {
            return Err(BurnInError::Failed(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                runtime::stderr_tail(&output.stderr, STDERR_TAIL_LINES)
            )));
        }

        info!(job_id = %request.job_id, "Subtitle burn-in finished");
        Ok(())
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "binary": self.config.ffmpeg_binary,
            "video_codec": self.config.video_codec,
            "preset": self.config.preset,
            "crf": self.config.crf,
        })
    }
}
