//! Authoritative in-memory map of job id to lifecycle state.
//!
//! Every operation runs under one mutex, so a status check and the action that
//! depends on it (for example "remove only if terminal") cannot interleave with
//! a pipeline stage writing the same job. Readers always receive clones.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::job::{Job, JobStatus, JobUpdate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job already registered: {0}")]
    Duplicate(String),
    #[error("invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {job_id} is still {status}")]
    NotTerminal { job_id: String, status: JobStatus },
}

pub trait JobRegistry: Send + Sync {
    fn insert(&self, job: Job) -> Result<(), RegistryError>;

    /// Applies `update` atomically and returns the resulting record.
    fn update(&self, job_id: &str, update: JobUpdate) -> Result<Job, RegistryError>;

    fn get(&self, job_id: &str) -> Option<Job>;

    fn remove(&self, job_id: &str) -> Option<Job>;

    /// Removes the job only when it has reached a terminal state.
    /// `Ok(None)` means the job was already absent.
    fn remove_if_terminal(&self, job_id: &str) -> Result<Option<Job>, RegistryError>;

    /// Terminal jobs, oldest `created_at` first.
    fn list_terminal_sorted_by_age(&self) -> Vec<Job>;

    /// Jobs of any status created strictly before `cutoff`.
    fn list_created_before(&self, cutoff: DateTime<Utc>) -> Vec<Job>;

    fn job_ids(&self) -> HashSet<String>;

    fn status_counts(&self) -> Vec<(JobStatus, usize)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn apply_update(job: &mut Job, update: JobUpdate) -> Result<(), RegistryError> {
    let next = update.status.unwrap_or(job.status);

    if job.status.is_terminal() || (next != job.status && !job.status.can_transition_to(next)) {
        return Err(RegistryError::InvalidTransition {
            job_id: job.id.clone(),
            from: job.status,
            to: next,
        });
    }

    if next != job.status {
        job.status = next;
        job.error = update.error;
        job.download_url = update.download_url;
        job.srt_url = update.srt_url;
    } else {
        if update.error.is_some() {
            job.error = update.error;
        }
        if update.download_url.is_some() {
            job.download_url = update.download_url;
        }
        if update.srt_url.is_some() {
            job.srt_url = update.srt_url;
        }
    }
    job.updated_at = Utc::now();
    Ok(())
}

impl JobRegistry for InMemoryJobRegistry {
    fn insert(&self, job: Job) -> Result<(), RegistryError> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(RegistryError::Duplicate(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn update(&self, job_id: &str, update: JobUpdate) -> Result<Job, RegistryError> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;
        apply_update(job, update)?;
        Ok(job.clone())
    }

    fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().get(job_id).cloned()
    }

    fn remove(&self, job_id: &str) -> Option<Job> {
        self.lock().remove(job_id)
    }

    fn remove_if_terminal(&self, job_id: &str) -> Result<Option<Job>, RegistryError> {
        let mut jobs = self.lock();
        match jobs.get(job_id) {
            None => Ok(None),
            Some(job) if !job.status.is_terminal() => Err(RegistryError::NotTerminal {
                job_id: job_id.to_string(),
                status: job.status,
            }),
            Some(_) => Ok(jobs.remove(job_id)),
        }
    }

    fn list_terminal_sorted_by_age(&self) -> Vec<Job> {
        let mut terminal: Vec<Job> = self
            .lock()
            .values()
            .filter(|job| job.status.is_terminal())
            .cloned()
            .collect();
        terminal.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        terminal
    }

    fn list_created_before(&self, cutoff: DateTime<Utc>) -> Vec<Job> {
        self.lock()
            .values()
            .filter(|job| job.created_at < cutoff)
            .cloned()
            .collect()
    }

    fn job_ids(&self) -> HashSet<String> {
        self.lock().keys().cloned().collect()
    }

    fn status_counts(&self) -> Vec<(JobStatus, usize)> {
        let jobs = self.lock();
        JobStatus::ALL
            .into_iter()
            .map(|status| {
                let count = jobs.values().filter(|job| job.status == status).count();
                (status, count)
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}
