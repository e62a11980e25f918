//! Storage accounting for the working root.
//!
//! Usage is measured from the filesystem on every call rather than tracked
//! incrementally, so it stays correct however files appear or disappear.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Something that can delete data to make room for an incoming upload.
pub trait CapacityEvictor: Send + Sync {
    /// Frees space until `usage + incoming_bytes` fits the eviction target,
    /// or nothing more can be evicted. Returns the bytes freed.
    fn reclaim(&self, incoming_bytes: u64) -> u64;
}

#[derive(Debug, Clone)]
pub struct StorageAccountant {
    root: PathBuf,
    capacity_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub admitted: bool,
    pub requested_bytes: u64,
    pub usage_bytes: u64,
    pub capacity_bytes: u64,
    pub reclaimed_bytes: u64,
}

impl StorageAccountant {
    pub fn new(root: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            root: root.into(),
            capacity_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Total size of regular files under the working root.
    ///
    /// Entries that vanish mid-walk or cannot be read count as zero.
    pub fn current_usage(&self) -> u64 {
        if !self.root.exists() {
            return 0;
        }
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.metadata().map(|meta| meta.len()).unwrap_or(0))
            .sum()
    }

    pub fn fits(&self, usage: u64, incoming_bytes: u64) -> bool {
        usage.saturating_add(incoming_bytes) <= self.capacity_bytes
    }

    /// Decides whether an upload of `estimated_bytes` may be accepted.
    ///
    /// When the first check fails the evictor runs once and the check is
    /// repeated against freshly measured usage.
    pub fn admit(&self, estimated_bytes: u64, evictor: &dyn CapacityEvictor) -> Admission {
        self.decide(estimated_bytes, 0, evictor)
    }

    /// Like [`admit`](Self::admit) for an upload already written under the
    /// root. Measured usage includes those bytes, so they are not added twice.
    pub fn admit_stored(&self, stored_bytes: u64, evictor: &dyn CapacityEvictor) -> Admission {
        self.decide(stored_bytes, stored_bytes, evictor)
    }

    fn decide(&self, requested: u64, on_disk: u64, evictor: &dyn CapacityEvictor) -> Admission {
        let incoming = requested.saturating_sub(on_disk);
        let usage = self.current_usage();
        if self.fits(usage, incoming) {
            return Admission {
                admitted: true,
                requested_bytes: requested,
                usage_bytes: usage.saturating_sub(on_disk),
                capacity_bytes: self.capacity_bytes,
                reclaimed_bytes: 0,
            };
        }

        debug!(
            usage_bytes = usage,
            requested_bytes = requested,
            capacity_bytes = self.capacity_bytes,
            "Upload does not fit, attempting eviction"
        );
        let reclaimed = evictor.reclaim(incoming);
        let usage = self.current_usage();
        let admitted = self.fits(usage, incoming);
        if reclaimed > 0 {
            info!(
                reclaimed_bytes = reclaimed,
                usage_bytes = usage,
                admitted,
                "Capacity eviction finished"
            );
        }

        Admission {
            admitted,
            requested_bytes: requested,
            usage_bytes: usage.saturating_sub(on_disk),
            capacity_bytes: self.capacity_bytes,
            reclaimed_bytes: reclaimed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct NoEviction;

    impl CapacityEvictor for NoEviction {
        fn reclaim(&self, _incoming_bytes: u64) -> u64 {
            0
        }
    }

    struct DeleteFile {
        path: PathBuf,
        calls: AtomicUsize,
    }

    impl CapacityEvictor for DeleteFile {
        fn reclaim(&self, _incoming_bytes: u64) -> u64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let len = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&self.path).map(|_| len).unwrap_or(0)
        }
    }

    #[test]
    fn usage_sums_nested_files() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("uploads")).unwrap();
        fs::write(temp.path().join("uploads/a"), vec![0u8; 100]).unwrap();
        fs::write(temp.path().join("b"), vec![0u8; 23]).unwrap();

        let accountant = StorageAccountant::new(temp.path(), 1_000);
        assert_eq!(accountant.current_usage(), 123);
    }

    #[test]
    fn missing_root_counts_as_empty() {
        let temp = tempfile::tempdir().unwrap();
        let accountant = StorageAccountant::new(temp.path().join("nope"), 10);
        assert_eq!(accountant.current_usage(), 0);
    }

    #[test]
    fn admits_when_upload_fits_without_eviction() {
        let temp = tempfile::tempdir().unwrap();
        let accountant = StorageAccountant::new(temp.path(), 100);
        let decision = accountant.admit(100, &NoEviction);
        assert!(decision.admitted);
        assert_eq!(decision.reclaimed_bytes, 0);
    }

    #[test]
    fn rejects_when_eviction_cannot_free_enough() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("pinned"), vec![0u8; 80]).unwrap();
        let accountant = StorageAccountant::new(temp.path(), 100);

        let decision = accountant.admit(50, &NoEviction);
        assert!(!decision.admitted);
        assert_eq!(decision.usage_bytes, 80);
    }

    #[test]
    fn eviction_runs_once_and_admission_is_rechecked() {
        let temp = tempfile::tempdir().unwrap();
        let victim = temp.path().join("victim");
        fs::write(&victim, vec![0u8; 80]).unwrap();
        let accountant = StorageAccountant::new(temp.path(), 100);
        let evictor = DeleteFile {
            path: victim.clone(),
            calls: AtomicUsize::new(0),
        };

        let decision = accountant.admit(50, &evictor);
        assert!(decision.admitted);
        assert_eq!(decision.reclaimed_bytes, 80);
        assert_eq!(evictor.calls.load(Ordering::SeqCst), 1);
        assert!(!victim.exists());
    }

    #[test]
    fn oversized_request_never_fits() {
        let temp = tempfile::tempdir().unwrap();
        let accountant = StorageAccountant::new(temp.path(), 100);
        assert!(!accountant.admit(u64::MAX, &NoEviction).admitted);
    }

    #[test]
    fn stored_upload_is_not_counted_twice() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("other"), vec![0u8; 40]).unwrap();
        fs::write(temp.path().join("upload.part"), vec![0u8; 60]).unwrap();
        let accountant = StorageAccountant::new(temp.path(), 100);

        let decision = accountant.admit_stored(60, &NoEviction);
        assert!(decision.admitted);
        assert_eq!(decision.requested_bytes, 60);
        assert_eq!(decision.usage_bytes, 40);
    }

    #[test]
    fn stored_upload_over_capacity_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("other"), vec![0u8; 50]).unwrap();
        fs::write(temp.path().join("upload.part"), vec![0u8; 60]).unwrap();
        let accountant = StorageAccountant::new(temp.path(), 100);

        let decision = accountant.admit_stored(60, &NoEviction);
        assert!(!decision.admitted);
        assert_eq!(decision.usage_bytes, 50);
    }
}
