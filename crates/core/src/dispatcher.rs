use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::job::{JobStatus, JobUpdate};
use crate::pipeline::{Pipeline, PipelineError, PipelineInput};
use crate::registry::{JobRegistry, RegistryError};
use crate::workdir::WorkDir;

pub const PANIC_MESSAGE: &str = "internal error while processing the video";
pub const SHUTDOWN_MESSAGE: &str = "processing interrupted by server shutdown";

/// Runs one pipeline worker per job, off the request-handling path.
///
/// Each worker is supervised: whatever way it ends (error, panic or
/// cancellation) the job is left terminal or gone, never stuck mid-stage.
#[derive(Clone)]
pub struct TaskDispatcher {
    pipeline: Pipeline,
    registry: Arc<dyn JobRegistry>,
    workdir: WorkDir,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskDispatcher {
    pub fn new(pipeline: Pipeline, registry: Arc<dyn JobRegistry>, workdir: WorkDir) -> Self {
        Self {
            pipeline,
            registry,
            workdir,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Cancellation token for a new job. Cancelled on eviction or server shutdown.
    pub fn job_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn active_workers(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Starts processing `input` in the background and returns immediately.
    pub fn dispatch(&self, input: PipelineInput, cancel: CancellationToken) {
        let dispatcher = self.clone();
        self.tracker.spawn(async move {
            let job_id = input.job_id.clone();
            let pipeline = dispatcher.pipeline.clone();
            let worker_cancel = cancel.clone();
            let worker =
                tokio::spawn(async move { pipeline.run(&input, &worker_cancel).await });

            match worker.await {
                Ok(Ok(status)) => debug!(job_id = %job_id, status = %status, "Worker finished"),
                Ok(Err(PipelineError::Evicted)) => {
                    info!(job_id = %job_id, "Job removed while processing; discarding its files");
                    dispatcher.workdir.remove_job_files(&job_id);
                }
                Ok(Err(PipelineError::Cancelled)) => {
                    let reason = if dispatcher.shutdown.is_cancelled() {
                        SHUTDOWN_MESSAGE.to_string()
                    } else {
                        PipelineError::Cancelled.to_string()
                    };
                    dispatcher.fail(&job_id, reason);
                }
                Ok(Err(err)) => {
                    warn!(job_id = %job_id, error = %err, "Job failed");
                    dispatcher.fail(&job_id, err.to_string());
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(job_id = %job_id, "Worker panicked");
                    dispatcher.fail(&job_id, PANIC_MESSAGE.to_string());
                }
                Err(join_error) => {
                    warn!(job_id = %job_id, error = %join_error, "Worker aborted");
                    dispatcher.fail(&job_id, PipelineError::Cancelled.to_string());
                }
            }
        });
    }

    /// Marks the job failed and deletes its files. The registry entry stays
    /// so the client can read the error.
    fn fail(&self, job_id: &str, reason: String) {
        match self.registry.update(job_id, JobUpdate::failed(reason)) {
            Ok(_) | Err(RegistryError::NotFound(_)) => {}
            Err(RegistryError::InvalidTransition {
                from: JobStatus::Failed,
                ..
            }) => {}
            Err(err) => warn!(job_id, error = %err, "Could not record job failure"),
        }
        self.workdir.remove_job_files(job_id);
    }

    /// Cancels every running job and waits up to `grace` for workers to settle.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        let active = self.tracker.len();
        if active > 0 {
            info!(active, "Waiting for job workers to stop");
        }
        let settled = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        if !settled {
            warn!(remaining = self.tracker.len(), "Job workers did not stop in time");
        }
        settled
    }
}
