//! FileStore - the working directory behind every execution environment.

use crate::error::{EnvError, Result};
use crate::files::{relative_key, resolve_within, FileContent, Files};
use crate::registry::TempDirRegistry;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::TempDir;

/// A working directory that files are staged into and collected from.
///
/// The directory is either supplied by the caller, in which case it is
/// never deleted by the store, or a prefixed [`TempDir`] owned by the store:
/// it is registered in [`TempDirRegistry::global`] and removed by
/// [`cleanup`](Self::cleanup), by `Drop` if `cleanup` was never called, or
/// by a registry sweep.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    owned: bool,
    temp: Mutex<Option<TempDir>>,
}

impl FileStore {
    /// Allocate an owned, uniquely named temp directory.
    pub async fn temp(prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let root = tokio::fs::canonicalize(dir.path()).await?;
        TempDirRegistry::global().register(&root);
        tracing::info!(path = %root.display(), "Allocated working directory");

        Ok(Self {
            root,
            owned: true,
            temp: Mutex::new(Some(dir)),
        })
    }

    /// Use a caller-supplied directory, creating it if needed.
    ///
    /// The directory is never removed by the store.
    pub async fn at(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let root = tokio::fs::canonicalize(&dir).await?;
        tracing::debug!(path = %root.display(), "Using caller-supplied working directory");

        Ok(Self {
            root,
            owned: false,
            temp: Mutex::new(None),
        })
    }

    /// Use `dir` when given, otherwise allocate a temp directory.
    pub async fn open(dir: Option<PathBuf>, prefix: &str) -> Result<Self> {
        match dir {
            Some(dir) => Self::at(dir).await,
            None => Self::temp(prefix).await,
        }
    }

    /// Canonical path of the working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the store allocated (and will delete) the directory.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Write a file set into the working directory.
    ///
    /// Every path is validated and every payload decoded before anything is
    /// written, so a rejected upload leaves the directory untouched.
    ///
    /// # Errors
    ///
    /// - [`EnvError::PathSecurity`] if a path escapes the working directory.
    /// - [`EnvError::InvalidContent`] if a base64 payload does not decode.
    pub async fn upload(&self, files: &Files) -> Result<()> {
        let mut planned: Vec<(PathBuf, Cow<'_, [u8]>)> = Vec::with_capacity(files.len());
        for (key, content) in files {
            let target = resolve_within(&self.root, key)?;
            self.ensure_inside(key, &target).await?;
            let bytes = content.decode().map_err(|e| EnvError::InvalidContent {
                path: key.clone(),
                reason: e.to_string(),
            })?;
            planned.push((target, bytes));
        }

        for (target, bytes) in &planned {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(target, bytes).await?;
            tracing::trace!(path = %target.display(), size = bytes.len(), "File written");
        }

        tracing::debug!(root = %self.root.display(), count = planned.len(), "Files uploaded");
        Ok(())
    }

    /// Collect every regular file under the working directory.
    ///
    /// UTF-8 files come back as text, everything else as base64. Symlinks
    /// and special files are skipped.
    pub async fn download(&self) -> Result<Files> {
        let mut files = Files::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let Some(key) = relative_key(&self.root, &path) else {
                        tracing::warn!(path = %path.display(), "Skipping file with non UTF-8 name");
                        continue;
                    };
                    let bytes = tokio::fs::read(&path).await?;
                    files.insert(key, FileContent::from_bytes(bytes));
                }
            }
        }

        tracing::debug!(root = %self.root.display(), count = files.len(), "Files downloaded");
        Ok(files)
    }

    /// Remove the working directory if the store owns it.
    ///
    /// Best effort and idempotent: failures are logged, never returned.
    pub async fn cleanup(&self) {
        let Some(dir) = self.take_temp() else {
            return;
        };

        // A directory that could not be removed stays registered for the sweep.
        let removed = match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => {
                tracing::info!(path = %self.root.display(), "Removed working directory");
                true
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => true,
            Ok(Err(e)) => {
                tracing::warn!(path = %self.root.display(), error = %e, "Failed to remove working directory");
                false
            }
            Err(e) => {
                tracing::warn!(path = %self.root.display(), error = %e, "Working directory removal task failed");
                false
            }
        };
        if removed {
            TempDirRegistry::global().deregister(&self.root);
        }
    }

    fn take_temp(&self) -> Option<TempDir> {
        self.temp
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Reject targets that reach outside the root through an existing symlink.
    async fn ensure_inside(&self, key: &str, target: &Path) -> Result<()> {
        let reject = || EnvError::PathSecurity {
            path: key.to_string(),
            root: self.root.clone(),
        };

        let mut existing = target.to_path_buf();
        loop {
            match tokio::fs::symlink_metadata(&existing).await {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !existing.pop() {
                        return Err(reject());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Dangling symlinks fail to canonicalize and are rejected as well.
        let real = tokio::fs::canonicalize(&existing).await.map_err(|_| reject())?;
        if real.starts_with(&self.root) {
            Ok(())
        } else {
            Err(reject())
        }
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let temp = self
            .temp
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(dir) = temp else {
            return;
        };
        tracing::debug!(path = %self.root.display(), "Working directory dropped without cleanup");
        match dir.close() {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.root.display(), error = %e, "Failed to remove working directory");
            }
            _ => {
                TempDirRegistry::global().deregister(&self.root);
            }
        }
    }
}
