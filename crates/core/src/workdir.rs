//! On-disk layout of the ephemeral working root.
//!
//! Every file a job produces lives directly under `uploads/` or `processed/`
//! and is named `<job_id>_<suffix>`, so concurrent jobs never share a path and
//! all of one job's files can be found (and deleted) by prefix.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

pub const UPLOADS_DIR_NAME: &str = "uploads";
pub const PROCESSED_DIR_NAME: &str = "processed";

const DEFAULT_MEDIA_EXTENSION: &str = "mp4";
const MAX_EXTENSION_LEN: usize = 10;
const FALLBACK_DISPLAY_BASE: &str = "video";

#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    uploads: PathBuf,
    processed: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub files_removed: usize,
    pub bytes_freed: u64,
    pub failures: usize,
}

impl RemovalReport {
    pub fn merge(&mut self, other: RemovalReport) {
        self.files_removed += other.files_removed;
        self.bytes_freed += other.bytes_freed;
        self.failures += other.failures;
    }
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            uploads: root.join(UPLOADS_DIR_NAME),
            processed: root.join(PROCESSED_DIR_NAME),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.uploads, &self.processed] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create work directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed
    }

    pub fn input_path(&self, job_id: &str, original_filename: &str) -> PathBuf {
        self.uploads.join(format!(
            "{job_id}_input.{}",
            media_extension(original_filename)
        ))
    }

    /// Where an upload is streamed before admission; renamed to the input path once admitted.
    pub fn partial_input_path(&self, job_id: &str) -> PathBuf {
        self.uploads.join(format!("{job_id}_input.part"))
    }

    pub fn srt_file_name(job_id: &str) -> String {
        format!("{job_id}_captions.srt")
    }

    pub fn output_file_name(job_id: &str, original_filename: &str) -> String {
        format!(
            "{job_id}_with_subtitles.{}",
            media_extension(original_filename)
        )
    }

    pub fn srt_path(&self, job_id: &str) -> PathBuf {
        self.processed.join(Self::srt_file_name(job_id))
    }

    pub fn output_path(&self, job_id: &str, original_filename: &str) -> PathBuf {
        self.processed
            .join(Self::output_file_name(job_id, original_filename))
    }

    /// Stem for transcription scratch files (extracted audio, engine output).
    pub fn scratch_stem(&self, job_id: &str) -> PathBuf {
        self.processed.join(format!("{job_id}_audio"))
    }

    /// Resolves a client-supplied artifact name inside `processed/`.
    ///
    /// Returns `None` for anything that is not a single plain file name.
    pub fn resolve_artifact(&self, filename: &str) -> Option<PathBuf> {
        if !is_plain_file_name(filename) {
            return None;
        }
        Some(self.processed.join(filename))
    }

    /// Deletes every file in the working tree whose name carries `job_id`'s prefix.
    ///
    /// Missing files count as already removed; other failures are logged and
    /// reported, never returned as errors.
    pub fn remove_job_files(&self, job_id: &str) -> RemovalReport {
        let prefix = format!("{job_id}_");
        let mut report = RemovalReport::default();
        for dir in [&self.uploads, &self.processed] {
            report.merge(remove_matching(dir, |name| name.starts_with(&prefix)));
        }
        if report.files_removed > 0 || report.failures > 0 {
            debug!(
                job_id,
                files_removed = report.files_removed,
                bytes_freed = report.bytes_freed,
                failures = report.failures,
                "Removed job files"
            );
        }
        report
    }

    /// Deletes one named file, tolerating its absence.
    pub fn remove_file(&self, path: &Path) -> RemovalReport {
        let mut report = RemovalReport::default();
        let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(path) {
            Ok(()) => {
                report.files_removed = 1;
                report.bytes_freed = len;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to delete file");
                report.failures = 1;
            }
        }
        report
    }

    /// Job ids that currently own at least one file in the working tree.
    pub fn job_ids_on_disk(&self) -> HashSet<String> {
        let mut ids = HashSet::new();
        for dir in [&self.uploads, &self.processed] {
            for name in file_names(dir) {
                if let Some(id) = job_id_from_artifact(&name) {
                    ids.insert(id.to_string());
                }
            }
        }
        ids
    }

    pub fn upload_file_count(&self) -> usize {
        file_names(&self.uploads).len()
    }

    pub fn processed_file_count(&self) -> usize {
        file_names(&self.processed).len()
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %err, "Failed to list work directory");
            }
            return Vec::new();
        }
    };

    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
        .collect()
}

fn remove_matching(dir: &Path, matches: impl Fn(&str) -> bool) -> RemovalReport {
    let mut report = RemovalReport::default();
    for name in file_names(dir).into_iter().filter(|name| matches(name)) {
        let path = dir.join(&name);
        let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&path) {
            Ok(()) => {
                report.files_removed += 1;
                report.bytes_freed += len;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to delete job file");
                report.failures += 1;
            }
        }
    }
    report
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0'])
}

/// Extracts the job id prefix from a job-namespaced file name.
pub fn job_id_from_artifact(filename: &str) -> Option<&str> {
    let (prefix, _) = filename.split_once('_')?;
    Uuid::parse_str(prefix).ok().map(|_| prefix)
}

/// Last path component of a client-supplied name, whatever separator it used.
fn client_base_name(original: &str) -> &str {
    original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original)
        .trim()
}

/// Lowercase alphanumeric extension of the client file name, or `mp4`.
pub fn media_extension(original_filename: &str) -> String {
    let base = client_base_name(original_filename);
    base.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| DEFAULT_MEDIA_EXTENSION.to_string())
}

/// Attachment name shown to the client: `<prefix>-<original base>.<ext>`.
pub fn branded_download_name(prefix: &str, original_filename: &str, extension: &str) -> String {
    let base = client_base_name(original_filename);
    // A name that is only an extension, like `.mp4`, has an empty stem.
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => base,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '"' | ';' | '\\' | '/') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim();
    let cleaned = if cleaned.is_empty() {
        FALLBACK_DISPLAY_BASE
    } else {
        cleaned
    };
    format!("{prefix}-{cleaned}.{extension}")
}
