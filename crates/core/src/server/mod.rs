use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::burn_in::{FfmpegBurner, SubtitleBurner};
use crate::config::{AppConfig, CorsConfig};
use crate::dispatcher::TaskDispatcher;
use crate::job::{Job, JobView};
use crate::pipeline::{Pipeline, PipelineInput};
use crate::reaper::{CleanupOutcome, Reaper, RetentionPolicy, SweepReport};
use crate::registry::{InMemoryJobRegistry, JobRegistry, RegistryError};
use crate::runtime::{self, ToolStatus};
use crate::storage::StorageAccountant;
use crate::transcription::{ModelManager, Transcriber, WhisperCli};
use crate::workdir::{branded_download_name, job_id_from_artifact, WorkDir};

const UPLOAD_FIELD: &str = "video";
const MIB: u64 = 1024 * 1024;
/// Room for multipart framing on top of the per-file cap.
const MULTIPART_OVERHEAD_BYTES: u64 = MIB;
const SERVICE_NAME: &str = "capvid";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    registry: Arc<dyn JobRegistry>,
    workdir: WorkDir,
    accountant: StorageAccountant,
    reaper: Reaper,
    dispatcher: TaskDispatcher,
    models: Option<Arc<ModelManager>>,
    /// Held from the admission check until the upload is at its input path.
    admission: Mutex<()>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        transcriber: Arc<dyn Transcriber>,
        burner: Arc<dyn SubtitleBurner>,
        models: Option<Arc<ModelManager>>,
    ) -> Result<Self> {
        let workdir = WorkDir::new(&config.paths.work_dir);
        workdir.ensure()?;

        let registry: Arc<dyn JobRegistry> = Arc::new(InMemoryJobRegistry::new());
        let accountant = StorageAccountant::new(workdir.root(), config.storage.capacity_bytes);
        let reaper = Reaper::new(
            registry.clone(),
            accountant.clone(),
            workdir.clone(),
            RetentionPolicy::from_config(&config),
        );
        let pipeline = Pipeline::new(registry.clone(), workdir.clone(), transcriber, burner);
        let dispatcher = TaskDispatcher::new(pipeline, registry.clone(), workdir.clone());

        info!(
            work_dir = %workdir.root().display(),
            capacity_bytes = config.storage.capacity_bytes,
            max_upload_bytes = config.storage.max_upload_bytes,
            "Job service initialized"
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                registry,
                workdir,
                accountant,
                reaper,
                dispatcher,
                models,
                admission: Mutex::new(()),
                started_at: Instant::now(),
            }),
        })
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.inner.registry
    }

    pub fn workdir(&self) -> &WorkDir {
        &self.inner.workdir
    }

    /// Starts the retention loop. Its first pass runs immediately and clears
    /// whatever a previous process left in the working tree.
    pub fn start_background(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.inner
            .reaper
            .spawn(self.inner.config.retention.sweep_interval(), shutdown)
    }

    /// Interrupts running jobs and waits up to `grace` for their workers.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.dispatcher.shutdown(grace).await
    }
}

/// Production state: `whisper-cli` for speech, `ffmpeg` for burn-in.
pub fn app_state_with_config(config: AppConfig) -> Result<AppState> {
    let models = Arc::new(ModelManager::new(config.transcription.models.clone()));
    let transcriber = Arc::new(WhisperCli::new(&config.transcription, models.clone()));
    let burner = Arc::new(FfmpegBurner::new(config.burn_in.clone()));
    AppState::new(config, transcriber, burner, Some(models))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub job_id: String,
    pub removed: bool,
    pub bytes_freed: u64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkCleanupResponse {
    pub jobs_removed: usize,
    pub orphans_removed: usize,
    pub bytes_freed: u64,
}

impl From<SweepReport> for BulkCleanupResponse {
    fn from(report: SweepReport) -> Self {
        Self {
            jobs_removed: report.capacity_evicted,
            orphans_removed: report.orphans_removed,
            bytes_freed: report.bytes_freed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StorageInfoResponse {
    pub usage_bytes: u64,
    pub capacity_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
    pub eviction_target_bytes: u64,
    pub max_upload_bytes: u64,
    pub upload_files: usize,
    pub processed_files: usize,
    pub total_jobs: usize,
    pub jobs_by_status: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app_router(state: AppState) -> Router {
    let body_limit = state
        .inner
        .config
        .storage
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);
    let cors = cors_layer(&state.inner.config.cors);

    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload_video))
        .route("/status/{job_id}", get(job_status))
        .route("/download/{filename}", get(download_video))
        .route("/download_srt/{filename}", get(download_subtitles))
        .route("/cleanup", post(cleanup_finished))
        .route("/cleanup/{job_id}", post(cleanup_job))
        .route("/storage_info", get(storage_info))
        .route("/system_info", get(system_info))
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "upload": "POST /upload",
            "status": "GET /status/{job_id}",
            "download": "GET /download/{filename}",
            "download_srt": "GET /download_srt/{filename}",
            "cleanup": "POST /cleanup/{job_id}",
            "cleanup_finished": "POST /cleanup",
            "storage_info": "GET /storage_info",
            "system_info": "GET /system_info",
        },
    }))
}

async fn route_not_found() -> AppError {
    AppError::NotFound("Endpoint not found".to_string())
}

/// Client file name of the upload field, which must be present.
fn upload_file_name(field: &Field<'_>) -> Result<String, AppError> {
    let filename = field.file_name().map(str::trim).unwrap_or_default();
    if filename.is_empty() {
        return Err(AppError::BadRequest("No file selected".to_string()));
    }
    Ok(filename.to_string())
}

/// Streams `field` into `dest`, enforcing the per-file cap. Returns the bytes written.
async fn stream_field_to_file(
    field: &mut Field<'_>,
    dest: &std::path::Path,
    max_bytes: u64,
) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let mut written: u64 = 0;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(AppError::BadRequest(format!(
                "File too large. Maximum size is {} MB",
                max_bytes / MIB
            )));
        }
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))?;
    }
    file.flush()
        .await
        .with_context(|| format!("failed to flush {}", dest.display()))?;
    if written == 0 {
        return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
    }
    Ok(written)
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    AppError::BadRequest(format!("Invalid upload: {}", err.body_text()))
}

/// Receives a registered job's file: stream to the part file, admit, then
/// move it to the input path. Returns the input path and its size.
async fn receive_upload(
    state: &AppState,
    field: &mut Field<'_>,
    job_id: &str,
    filename: &str,
) -> Result<(PathBuf, u64), AppError> {
    let part_path = state.inner.workdir.partial_input_path(job_id);
    let max_bytes = state.inner.config.storage.max_upload_bytes;
    let size = stream_field_to_file(field, &part_path, max_bytes).await?;

    let _admission_guard = state.inner.admission.lock().await;

    let accountant = state.inner.accountant.clone();
    let reaper = state.inner.reaper.clone();
    let admission = tokio::task::spawn_blocking(move || accountant.admit_stored(size, &reaper))
        .await
        .map_err(|err| AppError::Internal(format!("storage admission check failed: {err}")))?;
    if !admission.admitted {
        warn!(
            job_id,
            requested_bytes = admission.requested_bytes,
            usage_bytes = admission.usage_bytes,
            capacity_bytes = admission.capacity_bytes,
            "Upload rejected for lack of storage"
        );
        return Err(AppError::InsufficientStorage(format!(
            "Insufficient storage: {} bytes requested, {} of {} bytes in use",
            admission.requested_bytes, admission.usage_bytes, admission.capacity_bytes
        )));
    }

    let input_path = state.inner.workdir.input_path(job_id, filename);
    tokio::fs::rename(&part_path, &input_path)
        .await
        .with_context(|| format!("failed to store upload at {}", input_path.display()))?;
    Ok((input_path, size))
}

async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut field = loop {
        match multipart.next_field().await.map_err(multipart_error)? {
            Some(field) if field.name() == Some(UPLOAD_FIELD) => break field,
            Some(_) => continue,
            None => return Err(AppError::BadRequest("No video file provided".to_string())),
        }
    };
    let filename = upload_file_name(&field)?;

    let job_id = Uuid::new_v4().to_string();
    let cancel = state.inner.dispatcher.job_token();

    // Registered before any bytes land so a concurrent sweep never treats
    // the partial upload as an orphan.
    state
        .inner
        .registry
        .insert(Job::new(job_id.clone(), filename.clone(), cancel.clone()))
        .map_err(|err| AppError::Internal(err.to_string()))?;

    let (input_path, size) = match receive_upload(&state, &mut field, &job_id, &filename).await {
        Ok(received) => received,
        Err(err) => {
            state.inner.registry.remove(&job_id);
            state.inner.workdir.remove_job_files(&job_id);
            return Err(err);
        }
    };

    info!(
        job_id = %job_id,
        filename = %filename,
        bytes = size,
        "Upload accepted"
    );

    state.inner.dispatcher.dispatch(
        PipelineInput {
            job_id: job_id.clone(),
            original_filename: filename,
            input_path,
        },
        cancel,
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            job_id,
            status: "uploaded".to_string(),
            message: "Video uploaded successfully. Processing started.".to_string(),
        }),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    state
        .inner
        .registry
        .get(&job_id)
        .map(|job| Json(job.view()))
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))
}

#[derive(Debug, Clone, Copy)]
enum ArtifactKind {
    Video,
    Subtitles,
}

impl ArtifactKind {
    fn route(self) -> &'static str {
        match self {
            ArtifactKind::Video => "/download",
            ArtifactKind::Subtitles => "/download_srt",
        }
    }

    fn published_url(self, job: &Job) -> Option<&str> {
        match self {
            ArtifactKind::Video => job.download_url.as_deref(),
            ArtifactKind::Subtitles => job.srt_url.as_deref(),
        }
    }
}

async fn download_video(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    serve_artifact(&state, &filename, ArtifactKind::Video).await
}

async fn download_subtitles(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    serve_artifact(&state, &filename, ArtifactKind::Subtitles).await
}

/// Streams a published artifact under its branded display name.
///
/// Only files a registered job currently advertises are served, so an artifact
/// disappears from the API at the same moment as its job.
async fn serve_artifact(
    state: &AppState,
    filename: &str,
    kind: ArtifactKind,
) -> Result<Response, AppError> {
    let path = state
        .inner
        .workdir
        .resolve_artifact(filename)
        .ok_or_else(|| AppError::BadRequest("Invalid filename".to_string()))?;

    let job = job_id_from_artifact(filename)
        .and_then(|job_id| state.inner.registry.get(job_id))
        .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;
    let expected_url = format!("{}/{}", kind.route(), filename);
    if kind.published_url(&job) != Some(expected_url.as_str()) {
        return Err(AppError::NotFound("File not found".to_string()));
    }

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("File not found".to_string()));
        }
        Err(err) => {
            return Err(AppError::Internal(format!(
                "failed to open {}: {err}",
                path.display()
            )));
        }
    };
    let length = file.metadata().await.ok().map(|meta| meta.len());

    let extension = match kind {
        ArtifactKind::Video => path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("mp4")
            .to_string(),
        ArtifactKind::Subtitles => "srt".to_string(),
    };
    let display_name = branded_download_name(
        &state.inner.config.branding.download_prefix,
        &job.original_filename,
        &extension,
    );
    let content_type = mime_guess::from_path(&path).first_or_octet_stream();

    info!(job_id = %job.id, file = %filename, "Serving download");

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type.as_ref())
        .header(CONTENT_DISPOSITION, attachment_disposition(&display_name));
    if let Some(length) = length {
        builder = builder.header(CONTENT_LENGTH, length);
    }
    builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| AppError::Internal(format!("failed to build download response: {err}")))
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 UTF-8 name.
fn attachment_disposition(display_name: &str) -> String {
    let fallback: String = display_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(display_name, NON_ALPHANUMERIC);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

async fn cleanup_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CleanupResponse>, AppError> {
    let reaper = state.inner.reaper.clone();
    let target = job_id.clone();
    let outcome = tokio::task::spawn_blocking(move || reaper.cleanup(&target))
        .await
        .map_err(|err| AppError::Internal(format!("cleanup failed: {err}")))?;

    match outcome {
        Ok(CleanupOutcome::Evicted { bytes_freed }) => Ok(Json(CleanupResponse {
            job_id,
            removed: true,
            bytes_freed,
            message: "Job cleaned up".to_string(),
        })),
        Ok(CleanupOutcome::Absent { bytes_freed }) => Ok(Json(CleanupResponse {
            job_id,
            removed: false,
            bytes_freed,
            message: "Job not found; nothing left to clean up".to_string(),
        })),
        Err(RegistryError::NotTerminal { status, .. }) => Err(AppError::BadRequest(format!(
            "Job is still {status}; cleanup is only allowed once processing has finished"
        ))),
        Err(err) => Err(AppError::Internal(err.to_string())),
    }
}

async fn cleanup_finished(
    State(state): State<AppState>,
) -> Result<Json<BulkCleanupResponse>, AppError> {
    let reaper = state.inner.reaper.clone();
    let report = tokio::task::spawn_blocking(move || reaper.purge_terminal())
        .await
        .map_err(|err| AppError::Internal(format!("cleanup failed: {err}")))?;
    Ok(Json(report.into()))
}

async fn storage_info(
    State(state): State<AppState>,
) -> Result<Json<StorageInfoResponse>, AppError> {
    let accountant = state.inner.accountant.clone();
    let workdir = state.inner.workdir.clone();
    let (usage, upload_files, processed_files) = tokio::task::spawn_blocking(move || {
        (
            accountant.current_usage(),
            workdir.upload_file_count(),
            workdir.processed_file_count(),
        )
    })
    .await
    .map_err(|err| AppError::Internal(format!("storage scan failed: {err}")))?;

    let storage = &state.inner.config.storage;
    let capacity = storage.capacity_bytes;
    let usage_percent = if capacity == 0 {
        100.0
    } else {
        (usage as f64 / capacity as f64 * 10_000.0).round() / 100.0
    };
    let jobs_by_status: BTreeMap<String, usize> = state
        .inner
        .registry
        .status_counts()
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count))
        .collect();

    Ok(Json(StorageInfoResponse {
        usage_bytes: usage,
        capacity_bytes: capacity,
        available_bytes: capacity.saturating_sub(usage),
        usage_percent,
        eviction_target_bytes: storage.eviction_target_bytes(),
        max_upload_bytes: storage.max_upload_bytes,
        upload_files,
        processed_files,
        total_jobs: state.inner.registry.len(),
        jobs_by_status,
    }))
}

async fn system_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = &state.inner.config;
    let (ffmpeg, whisper): (ToolStatus, ToolStatus) = tokio::join!(
        runtime::check_tool(&config.burn_in.ffmpeg_binary, "-version"),
        runtime::check_tool(&config.transcription.whisper_binary, "--help"),
    );
    let model_state = match &state.inner.models {
        Some(models) => serde_json::to_value(models.state().await).unwrap_or_default(),
        None => serde_json::Value::Null,
    };
    let pipeline = state.inner.dispatcher.pipeline();

    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
        "uptime_secs": state.inner.started_at.elapsed().as_secs(),
        "active_workers": state.inner.dispatcher.active_workers(),
        "shutting_down": state.inner.dispatcher.is_shutting_down(),
        "registered_jobs": state.inner.registry.len(),
        "available_memory_mb": runtime::available_memory_mb(),
        "model": model_state,
        "transcriber": pipeline.transcriber().describe(),
        "burner": pipeline.burner().describe(),
        "tools": {
            "ffmpeg": ffmpeg,
            "whisper": whisper,
        },
        "retention": {
            "sweep_interval_secs": config.retention.sweep_interval_secs,
            "max_age_secs": config.retention.max_age_secs,
        },
    }))
}

// --- Error handling ---

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    InsufficientStorage(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::InsufficientStorage(msg) => (StatusCode::INSUFFICIENT_STORAGE, msg),
            AppError::Internal(msg) => {
                warn!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::job::JobStatus;
    use crate::pipeline::test_support::{BurnBehaviour, FakeBurner, FakeTranscriber};
    use axum::http::Request;
    use tower::{Service, ServiceExt};

    const BOUNDARY: &str = "capvid-test-boundary";

    struct TestServer {
        _temp: tempfile::TempDir,
        state: AppState,
        router: Router,
    }

    fn test_config(work_dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.work_dir = work_dir.to_path_buf();
        config
    }

    fn test_server_with(
        transcriber: FakeTranscriber,
        burn: BurnBehaviour,
        storage: Option<StorageConfig>,
    ) -> TestServer {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(&temp.path().join("work"));
        if let Some(storage) = storage {
            config.storage = storage;
        }
        let state = AppState::new(
            config,
            Arc::new(transcriber),
            Arc::new(FakeBurner::new(burn)),
            None,
        )
        .unwrap();
        let router = app_router(state.clone());
        TestServer {
            _temp: temp,
            state,
            router,
        }
    }

    fn test_server() -> TestServer {
        test_server_with(
            FakeTranscriber::speaking("hello there"),
            BurnBehaviour::WriteOutput,
            None,
        )
    }

    fn small_storage() -> StorageConfig {
        StorageConfig {
            capacity_bytes: 1000,
            max_upload_bytes: 2000,
            eviction_target_ratio: 0.8,
        }
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn read_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn multipart_request(field: &str, filename: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn upload(server: &mut TestServer, filename: &str, data: &[u8]) -> Response {
        send_request(&mut server.router, multipart_request("video", filename, data)).await
    }

    async fn upload_ok(server: &mut TestServer, filename: &str, data: &[u8]) -> String {
        let resp = upload(server, filename, data).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        read_json(resp).await["job_id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn wait_for_terminal_status(state: &AppState, job_id: &str) -> JobStatus {
        const MAX_POLLS: usize = 100;
        const POLL_INTERVAL_MS: u64 = 20;

        for _ in 0..MAX_POLLS {
            if let Some(job) = state.registry().get(job_id) {
                if job.status.is_terminal() {
                    return job.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }

        panic!("job {job_id} did not reach terminal status within timeout");
    }

    async fn wait_for_status(state: &AppState, job_id: &str, expected: JobStatus) {
        for _ in 0..100 {
            if state.registry().get(job_id).map(|job| job.status) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {expected}");
    }

    #[tokio::test]
    async fn test_index_lists_endpoints() {
        let mut server = test_server();
        let resp = send_request(&mut server.router, get("/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = read_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["endpoints"]["upload"], "POST /upload");
    }

    #[tokio::test]
    async fn test_upload_runs_to_completion() {
        let mut server = test_server();
        let job_id = upload_ok(&mut server, "talk.mp4", b"fake video bytes").await;
        assert!(Uuid::parse_str(&job_id).is_ok());

        let status = wait_for_terminal_status(&server.state, &job_id).await;
        assert_eq!(status, JobStatus::Completed);

        let resp = send_request(&mut server.router, get(&format!("/status/{job_id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = read_json(resp).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["filename"], "talk.mp4");
        assert_eq!(
            json["download_url"],
            format!("/download/{job_id}_with_subtitles.mp4")
        );
        assert_eq!(json["srt_url"], format!("/download_srt/{job_id}_captions.srt"));
        assert!(json.get("error").is_none());

        // The original upload is released once the captioned video exists.
        assert!(!server.state.workdir().input_path(&job_id, "talk.mp4").exists());
    }

    #[tokio::test]
    async fn test_download_uses_branded_attachment_name() {
        let mut server = test_server();
        let job_id = upload_ok(&mut server, "talk.mp4", b"fake video bytes").await;
        wait_for_terminal_status(&server.state, &job_id).await;

        let resp = send_request(
            &mut server.router,
            get(&format!("/download/{job_id}_with_subtitles.mp4")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment;"));
        assert!(disposition.contains("filename=\"CapVid-talk.mp4\""));
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "video/mp4");

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.starts_with(b"fake video bytes"));
    }

    #[tokio::test]
    async fn test_download_srt_serves_captions() {
        let mut server = test_server();
        let job_id = upload_ok(&mut server, "My Talk.mov", b"fake video bytes").await;
        wait_for_terminal_status(&server.state, &job_id).await;

        let resp = send_request(
            &mut server.router,
            get(&format!("/download_srt/{job_id}_captions.srt")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp.headers().get(CONTENT_DISPOSITION).unwrap();
        assert!(disposition
            .to_str()
            .unwrap()
            .contains("filename=\"CapVid-My Talk.srt\"; filename*=UTF-8''CapVid%2DMy%20Talk%2Esrt"));

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text, "1\n00:00:00,000 --> 00:00:01,500\nhello there\n\n");
    }

    #[tokio::test]
    async fn test_burn_failure_degrades_to_srt_only() {
        let mut server = test_server_with(
            FakeTranscriber::speaking("hello"),
            BurnBehaviour::Fail("bad subtitle path"),
            None,
        );
        let job_id = upload_ok(&mut server, "clip.mp4", b"bytes").await;
        let status = wait_for_terminal_status(&server.state, &job_id).await;
        assert_eq!(status, JobStatus::CompletedSrtOnly);

        let json = read_json(
            send_request(&mut server.router, get(&format!("/status/{job_id}"))).await,
        )
        .await;
        assert_eq!(json["status"], "completed_srt_only");
        assert!(json.get("download_url").is_none());
        assert!(json["srt_url"].as_str().is_some());
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to embed subtitles"));

        // The partial video is never advertised, so it cannot be fetched.
        let resp = send_request(
            &mut server.router,
            get(&format!("/download/{job_id}_with_subtitles.mp4")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_silent_video_fails_with_no_speech() {
        let mut server = test_server_with(
            FakeTranscriber::with_outcome(Ok(Vec::new())),
            BurnBehaviour::WriteOutput,
            None,
        );
        let job_id = upload_ok(&mut server, "silent.mp4", b"bytes").await;
        assert_eq!(
            wait_for_terminal_status(&server.state, &job_id).await,
            JobStatus::Failed
        );

        let json = read_json(
            send_request(&mut server.router, get(&format!("/status/{job_id}"))).await,
        )
        .await;
        assert_eq!(json["status"], "failed");
        assert!(json["error"].as_str().unwrap().contains("no speech"));
    }

    #[tokio::test]
    async fn test_upload_without_video_field_is_rejected() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            multipart_request("document", "talk.mp4", b"bytes"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = read_json(resp).await;
        assert_eq!(json["error"], "No video file provided");
    }

    #[tokio::test]
    async fn test_upload_with_empty_filename_is_rejected() {
        let mut server = test_server();
        let resp = upload(&mut server, "", b"bytes").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(server.state.registry().is_empty());
    }

    #[tokio::test]
    async fn test_upload_with_empty_file_is_rejected() {
        let mut server = test_server();
        let resp = upload(&mut server, "talk.mp4", b"").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_over_size_cap_is_rejected() {
        let mut server = test_server_with(
            FakeTranscriber::speaking("hi"),
            BurnBehaviour::WriteOutput,
            Some(StorageConfig {
                capacity_bytes: 10_000,
                max_upload_bytes: 100,
                eviction_target_ratio: 0.8,
            }),
        );
        let resp = upload(&mut server, "big.mp4", &[7u8; 150]).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = read_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("too large"));
        assert!(server.state.registry().is_empty());
        assert_eq!(server.state.workdir().upload_file_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_beyond_capacity_returns_507() {
        let mut server = test_server_with(
            FakeTranscriber::speaking("hi"),
            BurnBehaviour::WriteOutput,
            Some(small_storage()),
        );
        let resp = upload(&mut server, "huge.mp4", &[1u8; 1200]).await;
        assert_eq!(resp.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert!(server.state.registry().is_empty());
        assert_eq!(server.state.workdir().upload_file_count(), 0);
    }

    #[tokio::test]
    async fn test_admitted_upload_is_moved_out_of_partial_file() {
        let mut server = test_server_with(
            FakeTranscriber::speaking("hi").slow(Duration::from_secs(30)),
            BurnBehaviour::WriteOutput,
            Some(small_storage()),
        );
        // 900 bytes fits once; counting the streamed copy twice would reject it.
        let job_id = upload_ok(&mut server, "clip.mp4", &[3u8; 900]).await;

        let workdir = server.state.workdir();
        assert!(!workdir.partial_input_path(&job_id).exists());
        let input = workdir.input_path(&job_id, "clip.mp4");
        assert_eq!(std::fs::metadata(&input).unwrap().len(), 900);
        server.state.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_second_upload_evicts_finished_job() {
        let mut server = test_server_with(
            FakeTranscriber::speaking("hi"),
            BurnBehaviour::WriteOutput,
            Some(small_storage()),
        );
        let first = upload_ok(&mut server, "one.mp4", &[1u8; 600]).await;
        assert_eq!(
            wait_for_terminal_status(&server.state, &first).await,
            JobStatus::Completed
        );

        let second = upload_ok(&mut server, "two.mp4", &[2u8; 600]).await;
        assert!(server.state.registry().get(&first).is_none());
        assert!(!server.state.workdir().job_ids_on_disk().contains(&first));

        let resp = send_request(&mut server.router, get(&format!("/status/{first}"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        wait_for_terminal_status(&server.state, &second).await;
    }

    #[tokio::test]
    async fn test_in_progress_jobs_are_never_evicted_for_space() {
        let mut server = test_server_with(
            FakeTranscriber::speaking("hi").slow(Duration::from_secs(30)),
            BurnBehaviour::WriteOutput,
            Some(small_storage()),
        );
        let first = upload_ok(&mut server, "one.mp4", &[1u8; 600]).await;
        wait_for_status(&server.state, &first, JobStatus::Transcribing).await;

        let resp = upload(&mut server, "two.mp4", &[2u8; 600]).await;
        assert_eq!(resp.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(
            server.state.registry().get(&first).unwrap().status,
            JobStatus::Transcribing
        );
        assert_eq!(server.state.registry().len(), 1);
        assert_eq!(server.state.workdir().upload_file_count(), 1);
        server.state.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_status_unknown_job_is_404() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            get(&format!("/status/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(read_json(resp).await["error"], "Job not found");
    }

    #[tokio::test]
    async fn test_download_rejects_path_traversal() {
        let mut server = test_server();
        let resp = send_request(&mut server.router, get("/download/..%2Fconfig.toml")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send_request(&mut server.router, get("/download_srt/.hidden")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_download_unknown_artifact_is_404() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            get(&format!("/download/{}_with_subtitles.mp4", Uuid::new_v4())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_in_progress_job() {
        let mut server = test_server_with(
            FakeTranscriber::speaking("hi").slow(Duration::from_secs(30)),
            BurnBehaviour::WriteOutput,
            None,
        );
        let job_id = upload_ok(&mut server, "talk.mp4", b"bytes").await;
        wait_for_status(&server.state, &job_id, JobStatus::Transcribing).await;

        let resp = send_request(&mut server.router, post(&format!("/cleanup/{job_id}"))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(read_json(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("transcribing"));

        // Nothing was deleted.
        assert!(server.state.registry().get(&job_id).is_some());
        assert!(server.state.workdir().input_path(&job_id, "talk.mp4").exists());
        server.state.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_cleanup_finished_job_removes_everything() {
        let mut server = test_server();
        let job_id = upload_ok(&mut server, "talk.mp4", b"bytes").await;
        wait_for_terminal_status(&server.state, &job_id).await;

        let resp = send_request(&mut server.router, post(&format!("/cleanup/{job_id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = read_json(resp).await;
        assert_eq!(json["removed"], true);
        assert!(json["bytes_freed"].as_u64().unwrap() > 0);

        let resp = send_request(&mut server.router, get(&format!("/status/{job_id}"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(!server.state.workdir().job_ids_on_disk().contains(&job_id));
    }

    #[tokio::test]
    async fn test_cleanup_unknown_job_is_idempotent() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            post(&format!("/cleanup/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["removed"], false);
    }

    #[tokio::test]
    async fn test_bulk_cleanup_keeps_running_jobs() {
        let mut server = test_server();
        let done = upload_ok(&mut server, "a.mp4", b"bytes").await;
        wait_for_terminal_status(&server.state, &done).await;

        let resp = send_request(&mut server.router, post("/cleanup")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = read_json(resp).await;
        assert_eq!(json["jobs_removed"], 1);
        assert!(server.state.registry().is_empty());
    }

    #[tokio::test]
    async fn test_storage_info_reports_usage_and_jobs() {
        let mut server = test_server();
        let job_id = upload_ok(&mut server, "talk.mp4", b"0123456789").await;
        wait_for_terminal_status(&server.state, &job_id).await;

        let resp = send_request(&mut server.router, get("/storage_info")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let info: StorageInfoResponse =
            serde_json::from_slice(&axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap())
                .unwrap();
        assert!(info.usage_bytes > 0);
        assert_eq!(info.capacity_bytes, 250 * MIB);
        assert_eq!(info.upload_files, 0);
        assert_eq!(info.processed_files, 2);
        assert_eq!(info.total_jobs, 1);
        assert_eq!(info.jobs_by_status.get("completed"), Some(&1));
    }

    #[tokio::test]
    async fn test_system_info_reports_runtime() {
        let mut server = test_server();
        let resp = send_request(&mut server.router, get("/system_info")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = read_json(resp).await;
        assert_eq!(json["pid"], std::process::id());
        assert_eq!(json["active_workers"], 0);
        assert!(json["tools"]["ffmpeg"]["binary"].is_string());
        assert!(json["model"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_route_returns_json_404() {
        let mut server = test_server();
        let resp = send_request(&mut server.router, get("/api/jobs")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(read_json(resp).await["error"], "Endpoint not found");
    }

    #[test]
    fn test_attachment_disposition_keeps_ascii_fallback() {
        assert_eq!(
            attachment_disposition("CapVid-vidéo.mp4"),
            "attachment; filename=\"CapVid-vid_o.mp4\"; filename*=UTF-8''CapVid%2Dvid%C3%A9o%2Emp4"
        );
    }
}
