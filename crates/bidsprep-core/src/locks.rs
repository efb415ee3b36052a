use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One mutex per destination path, so concurrent subject runs never write the
/// same file at once.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles for `paths`, deduplicated and in sorted order so that callers
    /// locking several paths always acquire them in the same order.
    pub fn handles(&self, paths: &[PathBuf]) -> Vec<Arc<Mutex<()>>> {
        let mut sorted: Vec<&PathBuf> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();
        sorted
            .into_iter()
            .map(|p| self.locks.entry(p.clone()).or_default().clone())
            .collect()
    }

    pub fn with_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let handle = self.locks.entry(path.to_path_buf()).or_default().clone();
        let _guard = acquire(&handle);
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Lock a handle; a poisoned lock is still usable since it guards no data.
pub fn acquire(handle: &Mutex<()>) -> MutexGuard<'_, ()> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_handles_are_shared_per_path() {
        let locks = PathLocks::new();
        let a = PathBuf::from("/x/a.nii");
        let b = PathBuf::from("/x/b.nii");
        let first = locks.handles(&[b.clone(), a.clone(), a.clone()]);
        assert_eq!(first.len(), 2);
        let second = locks.handles(&[a]);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_with_lock_serializes_writers() {
        let locks = Arc::new(PathLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    locks.with_lock(Path::new("/x/out.nii.gz"), || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
