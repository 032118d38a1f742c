//! Process-wide registry of self-allocated working directories.
//!
//! Every [`FileStore`](crate::FileStore) that allocates its own temp
//! directory registers it here and deregisters it on cleanup. Whatever is
//! still registered at shutdown is removed by [`TempDirRegistry::sweep`],
//! typically through a [`SweepGuard`] held by the harness `main`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

static GLOBAL: OnceLock<TempDirRegistry> = OnceLock::new();

/// Mutex-guarded set of owned temp directories.
#[derive(Debug, Default)]
pub struct TempDirRegistry {
    dirs: Mutex<HashSet<PathBuf>>,
}

impl TempDirRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static TempDirRegistry {
        GLOBAL.get_or_init(|| {
            tracing::debug!("Initializing temp directory registry");
            TempDirRegistry::new()
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // A panic while holding the lock cannot leave the set inconsistent.
        self.dirs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a directory for removal at shutdown.
    pub fn register(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        tracing::trace!(path = %dir.display(), "Registering temp directory");
        self.lock().insert(dir);
    }

    /// Stop tracking a directory. Returns true if it was registered.
    pub fn deregister(&self, dir: &Path) -> bool {
        self.lock().remove(dir)
    }

    /// Whether a directory is currently tracked.
    pub fn contains(&self, dir: &Path) -> bool {
        self.lock().contains(dir)
    }

    /// Number of tracked directories.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no directories are tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every tracked directory and clear the registry.
    ///
    /// Removal is best effort: failures are logged and the directory is
    /// forgotten anyway. Returns the number of directories removed.
    pub fn sweep(&self) -> usize {
        let dirs: Vec<PathBuf> = self.lock().drain().collect();
        if dirs.is_empty() {
            return 0;
        }

        tracing::info!(count = dirs.len(), "Sweeping leftover temp directories");
        let mut removed = 0;
        for dir in dirs {
            match remove_dir_tree(&dir) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to remove temp directory")
                }
            }
        }
        removed
    }

    /// Guard that sweeps this registry when dropped.
    pub fn sweep_guard(&'static self) -> SweepGuard {
        SweepGuard { registry: self }
    }
}

/// Sweeps a registry on drop.
///
/// ```no_run
/// let _sweep = runcell_core::TempDirRegistry::global().sweep_guard();
/// // ... run the harness; leftover temp directories go away on exit.
/// ```
#[must_use = "the registry is swept when the guard is dropped"]
#[derive(Debug)]
pub struct SweepGuard {
    registry: &'static TempDirRegistry,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.registry.sweep();
    }
}

/// Recursively remove a directory, treating a missing one as success.
fn remove_dir_tree(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
