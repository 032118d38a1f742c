//! Error types for runcell-core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for runcell-core operations.
pub type Result<T> = std::result::Result<T, EnvError>;

/// Errors that can occur while staging files or running commands.
///
/// Timeouts are not errors: a command that runs past its deadline is
/// reported through [`ExecResult::timed_out`](crate::ExecResult::timed_out).
/// Cleanup never returns an error either; failures there are only logged.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A required binary is missing or a configuration value is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The container image does not exist locally.
    #[error("docker image `{image}` not found; build it first with `{build_hint}`")]
    ImageNotFound {
        /// Image tag that was requested
        image: String,
        /// Command that builds the image
        build_hint: String,
    },

    /// The container could not be started for a reason other than a missing image.
    #[error("failed to start container: {0}")]
    ResourceCreation(String),

    /// An upload path resolves outside the working directory.
    #[error("path `{path}` escapes working directory {}", root.display())]
    PathSecurity {
        /// Offending relative path as supplied by the caller
        path: String,
        /// Working directory root
        root: PathBuf,
    },

    /// Uploaded content could not be decoded.
    #[error("invalid content for `{path}`: {reason}")]
    InvalidContent {
        /// Relative path of the file
        path: String,
        /// Decoder error message
        reason: String,
    },

    /// The command (or the docker exec client) could not be spawned.
    #[error("execution failed: {0}")]
    Exec(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvError {
    /// Whether the caller has to fix its setup before retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::ImageNotFound { .. })
    }
}
