//! Registry of output files currently being written.
//!
//! Other subsystems (a library scanner, for example) consult the tracker and
//! skip in-flight files. One instance is built at startup and shared through
//! an `Arc`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Entries whose file was written to within this window are never stale.
const RECENT_WRITE_WINDOW: Duration = Duration::from_secs(300);

/// Default age after which an entry is considered for stale cleanup.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
pub struct EncodingFileTracker {
    entries: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl EncodingFileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, SystemTime>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `path` as being written. Re-adding refreshes the timestamp.
    pub fn add(&self, path: &Path) {
        self.lock().insert(path.to_path_buf(), SystemTime::now());
        debug!(path = %path.display(), "tracking encoding output");
    }

    /// Unregisters `path`. Removing an unknown path is a no-op.
    pub fn remove(&self, path: &Path) -> bool {
        let removed = self.lock().remove(path).is_some();
        if removed {
            debug!(path = %path.display(), "stopped tracking encoding output");
        }
        removed
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn tracked_files(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }

    /// Time since `path` was registered.
    pub fn file_age(&self, path: &Path) -> Option<Duration> {
        let registered = *self.lock().get(path)?;
        SystemTime::now().duration_since(registered).ok()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        if count > 0 {
            warn!(count, "cleared all tracked encoding outputs");
        }
        count
    }

    /// Registers `path` and returns a guard that unregisters it on drop.
    pub fn track(self: &Arc<Self>, path: &Path) -> TrackedFile {
        self.add(path);
        TrackedFile {
            tracker: Arc::clone(self),
            path: path.to_path_buf(),
        }
    }

    /// Like [`track`](Self::track), but refuses a path that is already
    /// registered.
    pub fn try_track(self: &Arc<Self>, path: &Path) -> Option<TrackedFile> {
        {
            let mut entries = self.lock();
            if entries.contains_key(path) {
                return None;
            }
            entries.insert(path.to_path_buf(), SystemTime::now());
        }
        debug!(path = %path.display(), "tracking encoding output");
        Some(TrackedFile {
            tracker: Arc::clone(self),
            path: path.to_path_buf(),
        })
    }

    /// Drops entries older than `timeout` whose file looks abandoned.
    ///
    /// An entry is abandoned when its file is gone, cannot be stat'ed, or was
    /// last modified more than five minutes ago. Returns the number removed.
    pub fn cleanup_stale(&self, timeout: Duration) -> usize {
        self.cleanup_stale_at(timeout, SystemTime::now())
    }

    fn cleanup_stale_at(&self, timeout: Duration, now: SystemTime) -> usize {
        let mut entries = self.lock();
        let before = entries.len();

        entries.retain(|path, registered| {
            let age = now.duration_since(*registered).unwrap_or_default();
            if age <= timeout {
                return true;
            }
            let abandoned = match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => {
                    now.duration_since(modified).unwrap_or_default() > RECENT_WRITE_WINDOW
                }
                Err(_) => true,
            };
            if abandoned {
                info!(path = %path.display(), age_secs = age.as_secs(), "removing stale tracker entry");
            }
            !abandoned
        });

        before - entries.len()
    }

    #[cfg(test)]
    fn insert_at(&self, path: &Path, registered: SystemTime) {
        self.lock().insert(path.to_path_buf(), registered);
    }
}

/// Scoped registration; the path is unregistered when this is dropped.
#[derive(Debug)]
pub struct TrackedFile {
    tracker: Arc<EncodingFileTracker>,
    path: PathBuf,
}

impl TrackedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TrackedFile {
    fn drop(&mut self) {
        self.tracker.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #[test]
        fn prop_add_remove_balance(ops in proptest::collection::vec((0usize..5, proptest::bool::ANY), 0..60)) {
            let tracker = EncodingFileTracker::new();
            let mut model = std::collections::HashSet::new();
            for (idx, add) in ops {
                let path = PathBuf::from(format!("/out/{}.ts", idx));
                if add {
                    tracker.add(&path);
                    model.insert(path);
                } else {
                    tracker.remove(&path);
                    model.remove(&path);
                }
                prop_assert_eq!(tracker.len(), model.len());
            }
        }
    }

    #[test]
    fn test_add_contains_remove() {
        let tracker = EncodingFileTracker::new();
        let path = Path::new("/out/a.ts");

        tracker.add(path);
        assert!(tracker.contains(path));
        assert!(tracker.file_age(path).is_some());
        assert!(tracker.remove(path));
        assert!(!tracker.contains(path));
        // idempotent
        assert!(!tracker.remove(path));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let tracker = EncodingFileTracker::shared();
        let path = Path::new("/out/guarded.ts");
        {
            let guard = tracker.track(path);
            assert_eq!(guard.path(), path);
            assert!(tracker.contains(path));
        }
        assert!(!tracker.contains(path));
    }

    #[test]
    fn test_try_track_refuses_busy_path() {
        let tracker = EncodingFileTracker::shared();
        let path = Path::new("/out/busy.ts");
        let first = tracker.try_track(path).unwrap();
        assert!(tracker.try_track(path).is_none());
        drop(first);
        assert!(tracker.try_track(path).is_some());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_guard_removes_on_panic() {
        let tracker = EncodingFileTracker::shared();
        let path = PathBuf::from("/out/panicky.ts");
        let t = Arc::clone(&tracker);
        let p = path.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = t.track(&p);
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!tracker.contains(&path));
    }

    #[test]
    fn test_cleanup_stale_missing_file() {
        let tracker = EncodingFileTracker::new();
        let path = Path::new("/definitely/not/here.ts");
        let old = SystemTime::now() - Duration::from_secs(7200);
        tracker.insert_at(path, old);

        assert_eq!(tracker.cleanup_stale(DEFAULT_STALE_TIMEOUT), 1);
        assert!(!tracker.contains(path));
    }

    #[test]
    fn test_cleanup_keeps_young_entries() {
        let tracker = EncodingFileTracker::new();
        tracker.add(Path::new("/definitely/not/here.ts"));
        assert_eq!(tracker.cleanup_stale(DEFAULT_STALE_TIMEOUT), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_cleanup_keeps_recently_written_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.ts");
        std::fs::write(&path, b"data").unwrap();

        let tracker = EncodingFileTracker::new();
        tracker.insert_at(&path, SystemTime::now() - Duration::from_secs(7200));

        // Old registration, but the file was just modified.
        assert_eq!(tracker.cleanup_stale(DEFAULT_STALE_TIMEOUT), 0);
        assert!(tracker.contains(&path));
    }

    #[test]
    fn test_cleanup_removes_old_untouched_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abandoned.ts");
        std::fs::write(&path, b"data").unwrap();

        let tracker = EncodingFileTracker::new();
        let now = SystemTime::now();
        tracker.insert_at(&path, now - Duration::from_secs(7200));

        // Pretend an hour has passed since the last write.
        let later = now + Duration::from_secs(3600);
        assert_eq!(tracker.cleanup_stale_at(DEFAULT_STALE_TIMEOUT, later), 1);
    }

    #[test]
    fn test_clear() {
        let tracker = EncodingFileTracker::new();
        tracker.add(Path::new("/a"));
        tracker.add(Path::new("/b"));
        assert_eq!(tracker.clear(), 2);
        assert!(tracker.tracked_files().is_empty());
    }
}
