//! Retention: age expiry, capacity-driven eviction and orphan reconciliation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::registry::{JobRegistry, RegistryError};
use crate::storage::{CapacityEvictor, StorageAccountant};
use crate::workdir::{RemovalReport, WorkDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    /// Capacity eviction stops once usage is at or below this many bytes.
    pub eviction_target_bytes: u64,
}

impl RetentionPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_age: config.retention.max_age(),
            eviction_target_bytes: config.storage.eviction_target_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub capacity_evicted: usize,
    pub orphans_removed: usize,
    pub bytes_freed: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Evicted { bytes_freed: u64 },
    /// The job was not registered. Any files left under its id were still purged.
    Absent { bytes_freed: u64 },
}

#[derive(Clone)]
pub struct Reaper {
    registry: Arc<dyn JobRegistry>,
    accountant: StorageAccountant,
    workdir: WorkDir,
    policy: RetentionPolicy,
}

impl Reaper {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        accountant: StorageAccountant,
        workdir: WorkDir,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            registry,
            accountant,
            workdir,
            policy,
        }
    }

    /// Removes the registry entry first, then every file carrying the id.
    ///
    /// A worker still running for the job is signalled to stop. Evicting an
    /// absent id only purges stray files.
    pub fn evict(&self, job_id: &str) -> RemovalReport {
        if let Some(job) = self.registry.remove(job_id) {
            job.cancel_token.cancel();
            debug!(job_id, status = %job.status, "Job evicted");
        }
        self.workdir.remove_job_files(job_id)
    }

    /// Manual per-job cleanup. Refuses jobs that are still being processed.
    pub fn cleanup(&self, job_id: &str) -> Result<CleanupOutcome, RegistryError> {
        let removed = self.registry.remove_if_terminal(job_id)?;
        let report = self.workdir.remove_job_files(job_id);
        info!(job_id, bytes_freed = report.bytes_freed, "Job cleaned up on request");
        Ok(match removed {
            Some(_) => CleanupOutcome::Evicted {
                bytes_freed: report.bytes_freed,
            },
            None => CleanupOutcome::Absent {
                bytes_freed: report.bytes_freed,
            },
        })
    }

    /// Evicts every terminal job. In-flight jobs are left alone.
    pub fn purge_terminal(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for job in self.registry.list_terminal_sorted_by_age() {
            // Re-checked under the registry lock in case the job changed since listing.
            if let Ok(Some(_)) = self.registry.remove_if_terminal(&job.id) {
                report.capacity_evicted += 1;
                report.bytes_freed += self.workdir.remove_job_files(&job.id).bytes_freed;
            }
        }
        report.orphans_removed += self.reconcile_orphans(&mut report.bytes_freed);
        info!(
            jobs = report.capacity_evicted,
            bytes_freed = report.bytes_freed,
            "Purged all finished jobs"
        );
        report
    }

    /// One full retention pass: age expiry, then capacity, then orphans.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        if let Ok(max_age) = chrono::Duration::from_std(self.policy.max_age) {
            let cutoff = chrono::Utc::now() - max_age;
            for job in self.registry.list_created_before(cutoff) {
                if !job.status.is_terminal() {
                    warn!(job_id = %job.id, status = %job.status, "Expiring job that never finished");
                }
                report.expired += 1;
                report.bytes_freed += self.evict(&job.id).bytes_freed;
            }
        }

        // Only over-capacity storage triggers eviction; it then drains to the target.
        let usage = self.accountant.current_usage();
        if usage > self.accountant.capacity_bytes() {
            let (evicted, freed) = self.evict_until(usage, 0);
            report.capacity_evicted += evicted;
            report.bytes_freed += freed;
        }

        report.orphans_removed += self.reconcile_orphans(&mut report.bytes_freed);

        if !report.is_empty() {
            info!(
                expired = report.expired,
                capacity_evicted = report.capacity_evicted,
                orphans_removed = report.orphans_removed,
                bytes_freed = report.bytes_freed,
                "Retention sweep finished"
            );
        }
        report
    }

    /// Evicts terminal jobs oldest-first until `usage + incoming` fits the target.
    fn evict_until(&self, mut usage: u64, incoming: u64) -> (usize, u64) {
        let target = self.policy.eviction_target_bytes;
        let mut evicted = 0;
        let mut freed = 0;

        for job in self.registry.list_terminal_sorted_by_age() {
            if usage.saturating_add(incoming) <= target {
                break;
            }
            let Ok(Some(_)) = self.registry.remove_if_terminal(&job.id) else {
                continue;
            };
            let report = self.workdir.remove_job_files(&job.id);
            usage = usage.saturating_sub(report.bytes_freed);
            freed += report.bytes_freed;
            evicted += 1;
            debug!(job_id = %job.id, bytes_freed = report.bytes_freed, "Evicted for capacity");
        }
        (evicted, freed)
    }

    /// Deletes files whose job id is not registered. Returns the number of ids purged.
    pub fn reconcile_orphans(&self, bytes_freed: &mut u64) -> usize {
        let on_disk = self.workdir.job_ids_on_disk();
        let mut purged = 0;
        for job_id in on_disk {
            // The upload handler registers before writing, so an unregistered
            // prefix can only belong to an evicted or pre-restart job.
            if self.registry.get(&job_id).is_some() {
                continue;
            }
            let report = self.workdir.remove_job_files(&job_id);
            if report.files_removed > 0 {
                debug!(job_id = %job_id, files = report.files_removed, "Removed orphaned files");
                purged += 1;
                *bytes_freed += report.bytes_freed;
            }
        }
        purged
    }

    /// Starts the periodic sweep. The loop exits when `shutdown` is cancelled.
    pub fn spawn(&self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let reaper = self.clone();
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Retention loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let pass = reaper.clone();
                        if let Err(err) = tokio::task::spawn_blocking(move || pass.sweep()).await {
                            warn!(error = %err, "Retention sweep panicked");
                        }
                    }
                }
            }
        })
    }
}

impl CapacityEvictor for Reaper {
    fn reclaim(&self, incoming_bytes: u64) -> u64 {
        let usage = self.accountant.current_usage();
        let (evicted, freed) = self.evict_until(usage, incoming_bytes);
        let mut freed = freed;
        let orphans = self.reconcile_orphans(&mut freed);
        if evicted > 0 || orphans > 0 {
            info!(evicted, orphans, bytes_freed = freed, "Reclaimed space for upload");
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::job::{Job, JobStatus, JobUpdate};
    use crate::registry::InMemoryJobRegistry;

    struct Fixture {
        _temp: tempfile::TempDir,
        registry: Arc<InMemoryJobRegistry>,
        workdir: WorkDir,
        reaper: Reaper,
    }

    fn fixture(capacity: u64, target: u64, max_age: Duration) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(temp.path().join("work"));
        workdir.ensure().unwrap();
        let registry = Arc::new(InMemoryJobRegistry::new());
        let reaper = Reaper::new(
            registry.clone(),
            StorageAccountant::new(workdir.root(), capacity),
            workdir.clone(),
            RetentionPolicy {
                max_age,
                eviction_target_bytes: target,
            },
        );
        Fixture {
            _temp: temp,
            registry,
            workdir,
            reaper,
        }
    }

    impl Fixture {
        /// Registers a job aged `age_secs` with `bytes` of output on disk.
        fn job(&self, age_secs: i64, bytes: usize, status: JobStatus) -> String {
            let id = Uuid::new_v4().to_string();
            let mut job = Job::new(id.clone(), "clip.mp4".to_string(), CancellationToken::new());
            job.created_at = chrono::Utc::now() - chrono::Duration::seconds(age_secs);
            self.registry.insert(job).unwrap();
            match status {
                JobStatus::Uploaded => {}
                JobStatus::Failed => {
                    self.registry.update(&id, JobUpdate::failed("x")).unwrap();
                }
                JobStatus::Transcribing => {
                    self.registry
                        .update(&id, JobUpdate::advance(JobStatus::Transcribing))
                        .unwrap();
                }
                other => panic!("fixture does not build {other}"),
            }
            fs::write(self.workdir.srt_path(&id), vec![0u8; bytes]).unwrap();
            id
        }

        fn has_files(&self, id: &str) -> bool {
            self.workdir.job_ids_on_disk().contains(id)
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn evicting_absent_job_is_a_noop() {
        let f = fixture(1000, 800, HOUR);
        assert_eq!(f.reaper.evict("never-existed"), RemovalReport::default());
    }

    #[test]
    fn evict_cancels_running_worker_and_removes_files() {
        let f = fixture(1000, 800, HOUR);
        let id = f.job(0, 10, JobStatus::Transcribing);
        let token = f.registry.get(&id).unwrap().cancel_token;

        let report = f.reaper.evict(&id);
        assert_eq!(report.bytes_freed, 10);
        assert!(token.is_cancelled());
        assert!(f.registry.get(&id).is_none());
        assert!(!f.has_files(&id));
    }

    #[test]
    fn cleanup_rejects_in_progress_jobs_without_deleting() {
        let f = fixture(1000, 800, HOUR);
        let uploaded = f.job(0, 10, JobStatus::Uploaded);
        let running = f.job(0, 10, JobStatus::Transcribing);

        for id in [&uploaded, &running] {
            assert!(matches!(
                f.reaper.cleanup(id),
                Err(RegistryError::NotTerminal { .. })
            ));
            assert!(f.registry.get(id).is_some());
            assert!(f.has_files(id));
        }
    }

    #[test]
    fn cleanup_of_terminal_and_absent_jobs() {
        let f = fixture(1000, 800, HOUR);
        let done = f.job(0, 25, JobStatus::Failed);

        assert_eq!(
            f.reaper.cleanup(&done).unwrap(),
            CleanupOutcome::Evicted { bytes_freed: 25 }
        );
        assert!(!f.has_files(&done));
        assert_eq!(
            f.reaper.cleanup(&done).unwrap(),
            CleanupOutcome::Absent { bytes_freed: 0 }
        );
    }

    #[test]
    fn sweep_expires_old_jobs_of_any_status() {
        let f = fixture(10_000, 8_000, HOUR);
        let stale_done = f.job(7200, 10, JobStatus::Failed);
        let stale_stuck = f.job(7200, 10, JobStatus::Transcribing);
        let fresh = f.job(60, 10, JobStatus::Failed);
        let stuck_token = f.registry.get(&stale_stuck).unwrap().cancel_token;

        let report = f.reaper.sweep();
        assert_eq!(report.expired, 2);
        assert!(f.registry.get(&stale_done).is_none());
        assert!(f.registry.get(&stale_stuck).is_none());
        assert!(stuck_token.is_cancelled());
        assert!(f.registry.get(&fresh).is_some());
    }

    #[test]
    fn capacity_eviction_is_oldest_first_and_spares_active_jobs() {
        let f = fixture(900, 800, HOUR);
        let active = f.job(300, 400, JobStatus::Transcribing);
        let oldest = f.job(200, 300, JobStatus::Failed);
        let newer = f.job(100, 250, JobStatus::Failed);

        let report = f.reaper.sweep();
        assert_eq!(report.capacity_evicted, 1);
        assert_eq!(report.bytes_freed, 300);
        assert!(f.registry.get(&oldest).is_none());
        assert!(f.registry.get(&newer).is_some());
        assert!(f.registry.get(&active).is_some());
    }

    #[test]
    fn capacity_eviction_stops_when_only_active_jobs_remain() {
        let f = fixture(500, 100, HOUR);
        let active = f.job(0, 900, JobStatus::Transcribing);
        let report = f.reaper.sweep();
        assert_eq!(report.capacity_evicted, 0);
        assert!(f.has_files(&active));
    }

    #[test]
    fn usage_between_target_and_capacity_evicts_nothing() {
        let f = fixture(1000, 800, HOUR);
        let old = f.job(200, 500, JobStatus::Failed);
        let newer = f.job(100, 350, JobStatus::Completed);

        let report = f.reaper.sweep();
        assert_eq!(report.capacity_evicted, 0);
        assert_eq!(report.bytes_freed, 0);
        assert!(f.registry.get(&old).is_some());
        assert!(f.registry.get(&newer).is_some());
        assert!(f.has_files(&old));
    }

    #[test]
    fn orphaned_files_are_reconciled() {
        let f = fixture(1000, 800, HOUR);
        let orphan = Uuid::new_v4().to_string();
        fs::write(f.workdir.input_path(&orphan, "a.mp4"), b"abc").unwrap();
        fs::write(f.workdir.processed_dir().join("README"), b"not ours").unwrap();
        let kept = f.job(0, 5, JobStatus::Uploaded);

        let report = f.reaper.sweep();
        assert_eq!(report.orphans_removed, 1);
        assert!(!f.has_files(&orphan));
        assert!(f.has_files(&kept));
        assert!(f.workdir.processed_dir().join("README").exists());
    }

    #[test]
    fn purge_terminal_leaves_in_flight_jobs() {
        let f = fixture(1000, 800, HOUR);
        let a = f.job(0, 5, JobStatus::Failed);
        let b = f.job(0, 5, JobStatus::Transcribing);

        let report = f.reaper.purge_terminal();
        assert_eq!(report.capacity_evicted, 1);
        assert!(f.registry.get(&a).is_none());
        assert!(f.registry.get(&b).is_some());
    }

    #[test]
    fn reclaim_makes_room_for_incoming_upload() {
        let f = fixture(1000, 800, HOUR);
        let old = f.job(200, 500, JobStatus::Failed);
        let young = f.job(100, 200, JobStatus::Failed);

        // 700 used; 200 incoming needs usage <= 600.
        let freed = f.reaper.reclaim(200);
        assert_eq!(freed, 500);
        assert!(f.registry.get(&old).is_none());
        assert!(f.registry.get(&young).is_some());
    }

    #[tokio::test]
    async fn periodic_loop_sweeps_and_stops_on_shutdown() {
        let f = fixture(1000, 800, Duration::ZERO);
        let id = f.job(10, 5, JobStatus::Failed);
        let shutdown = CancellationToken::new();

        let handle = f.reaper.spawn(Duration::from_millis(10), shutdown.clone());
        for _ in 0..100 {
            if f.registry.get(&id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.registry.get(&id).is_none());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .unwrap();
    }
}
