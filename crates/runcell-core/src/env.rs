//! The execution environment contract.

use crate::error::Result;
use crate::exec::ExecResult;
use crate::files::Files;
use async_trait::async_trait;

/// Runs a command against a staged file set and hands the files back.
///
/// Implementations differ only in where the command runs. Timeouts are
/// reported in the returned [`ExecResult`], not as errors, and nothing is
/// retried at this layer.
#[async_trait]
pub trait ExecutionEnv: Send + Sync {
    /// Run a shell command line in the working directory.
    ///
    /// With `silent` unset, output is echoed to this process's stdout and
    /// stderr as it arrives; it is captured either way.
    async fn run(&self, command: &str, silent: bool) -> Result<ExecResult>;

    /// Stage files into the working directory.
    async fn upload(&self, files: &Files) -> Result<()>;

    /// Collect every file currently in the working directory.
    async fn download(&self) -> Result<Files>;
}
