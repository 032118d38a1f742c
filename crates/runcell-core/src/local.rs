//! Host-process execution backend.

use crate::config::EnvConfig;
use crate::env::ExecutionEnv;
use crate::error::Result;
use crate::exec::{run_streamed, ExecResult, StreamOptions};
use crate::files::Files;
use crate::store::FileStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;

/// Runs commands directly on the host with `sh -c`.
///
/// The working directory is handed to each spawned process; the current
/// directory of this process is never changed, so any number of instances
/// can run side by side. Calls to [`run`](ExecutionEnv::run) on the same
/// instance are serialized.
///
/// This backend provides no isolation from the host. Use
/// [`DockerExecutionEnv`](crate::DockerExecutionEnv) for untrusted code that
/// may touch global state.
#[derive(Debug)]
pub struct SimpleExecutionEnv {
    store: FileStore,
    config: EnvConfig,
    run_lock: Mutex<()>,
}

impl SimpleExecutionEnv {
    /// Create an environment over `dir`, or over a fresh temp directory.
    pub async fn new(dir: Option<PathBuf>, config: EnvConfig) -> Result<Self> {
        config.validate()?;
        let store = FileStore::open(dir, &config.temp_prefix).await?;
        tracing::debug!(root = %store.root().display(), "Host execution environment ready");
        Ok(Self {
            store,
            config,
            run_lock: Mutex::new(()),
        })
    }

    /// Create an environment over a fresh temp directory with default settings.
    pub async fn temp() -> Result<Self> {
        Self::new(None, EnvConfig::default()).await
    }

    /// Working directory commands run in.
    pub fn root(&self) -> &Path {
        self.store.root()
    }

    /// Get the configuration.
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Remove the working directory if this environment allocated it.
    ///
    /// Never fails; calling it more than once is a no-op.
    pub async fn cleanup(&self) {
        self.store.cleanup().await;
    }
}

#[async_trait]
impl ExecutionEnv for SimpleExecutionEnv {
    async fn run(&self, command: &str, silent: bool) -> Result<ExecResult> {
        let _guard = self.run_lock.lock().await;
        tracing::debug!(root = %self.store.root().display(), cmd = %command, "Running on host");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(self.store.root());

        run_streamed(
            cmd,
            command,
            StreamOptions {
                timeout: self.config.timeout,
                silent,
            },
        )
        .await
    }

    async fn upload(&self, files: &Files) -> Result<()> {
        self.store.upload(files).await
    }

    async fn download(&self) -> Result<Files> {
        self.store.download().await
    }
}
