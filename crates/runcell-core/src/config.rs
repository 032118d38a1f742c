//! Execution environment configuration.
//!
//! Configuration can be built in code with [`EnvConfig::builder`] or loaded
//! from environment variables with [`EnvConfig::from_env`].

use crate::error::EnvError;
use std::path::PathBuf;
use std::time::Duration;

/// Default wall-clock budget for a single `run()`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default budget for `docker stop` after a timeout or during cleanup.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration shared by the host and container backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    /// Wall-clock budget for a single command (default: 30s).
    pub timeout: Duration,
    /// Budget for stopping the container (default: 10s).
    pub stop_timeout: Duration,
    /// Container image tag.
    pub image: String,
    /// Build context suggested when the image is missing.
    pub build_context: PathBuf,
    /// Mount point of the working directory inside the container.
    pub container_workdir: PathBuf,
    /// Docker CLI binary.
    pub docker_bin: PathBuf,
    /// Name prefix for temp directories and containers.
    pub temp_prefix: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            image: "runcell-sandbox:latest".to_string(),
            build_context: PathBuf::from("."),
            container_workdir: PathBuf::from("/workspace"),
            docker_bin: PathBuf::from("docker"),
            temp_prefix: "runcell-".to_string(),
        }
    }
}

impl EnvConfig {
    /// Create a new config builder.
    pub fn builder() -> EnvConfigBuilder {
        EnvConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `RUNCELL_TIMEOUT_SECS` | `30` |
    /// | `RUNCELL_STOP_TIMEOUT_SECS` | `10` |
    /// | `RUNCELL_IMAGE` | `runcell-sandbox:latest` |
    /// | `RUNCELL_BUILD_CONTEXT` | `.` |
    /// | `RUNCELL_CONTAINER_WORKDIR` | `/workspace` |
    /// | `RUNCELL_DOCKER_BIN` | `docker` |
    /// | `RUNCELL_TEMP_PREFIX` | `runcell-` |
    ///
    /// Unparseable numeric values fall back to the default.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            timeout: std::env::var("RUNCELL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.timeout),
            stop_timeout: std::env::var("RUNCELL_STOP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.stop_timeout),
            image: std::env::var("RUNCELL_IMAGE").unwrap_or(default.image),
            build_context: std::env::var("RUNCELL_BUILD_CONTEXT")
                .map(PathBuf::from)
                .unwrap_or(default.build_context),
            container_workdir: std::env::var("RUNCELL_CONTAINER_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or(default.container_workdir),
            docker_bin: std::env::var("RUNCELL_DOCKER_BIN")
                .map(PathBuf::from)
                .unwrap_or(default.docker_bin),
            temp_prefix: std::env::var("RUNCELL_TEMP_PREFIX").unwrap_or(default.temp_prefix),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), EnvError> {
        if self.timeout.is_zero() {
            return Err(EnvError::Configuration("timeout must be > 0".into()));
        }
        if self.stop_timeout.is_zero() {
            return Err(EnvError::Configuration("stop_timeout must be > 0".into()));
        }
        if self.image.trim().is_empty() {
            return Err(EnvError::Configuration("image is required".into()));
        }
        if !self.container_workdir.is_absolute() {
            return Err(EnvError::Configuration(format!(
                "container_workdir must be absolute, got {}",
                self.container_workdir.display()
            )));
        }
        if self.docker_bin.as_os_str().is_empty() {
            return Err(EnvError::Configuration("docker_bin is required".into()));
        }
        if self.temp_prefix.contains(std::path::is_separator) {
            return Err(EnvError::Configuration(format!(
                "temp_prefix must not contain path separators, got `{}`",
                self.temp_prefix
            )));
        }
        Ok(())
    }

    /// Command a user should run to build the configured image.
    pub fn build_hint(&self) -> String {
        format!(
            "docker build -t {} {}",
            self.image,
            self.build_context.display()
        )
    }
}

/// Builder for EnvConfig.
#[derive(Debug, Default)]
pub struct EnvConfigBuilder {
    config: EnvConfig,
}

impl EnvConfigBuilder {
    /// Set the per-command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the container stop timeout.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    /// Set the container image tag.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Set the build context used in the missing-image hint.
    pub fn build_context(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.build_context = path.into();
        self
    }

    /// Set the in-container working directory.
    pub fn container_workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.container_workdir = path.into();
        self
    }

    /// Set the docker CLI binary.
    pub fn docker_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.docker_bin = path.into();
        self
    }

    /// Set the temp directory and container name prefix.
    pub fn temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.temp_prefix = prefix.into();
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<EnvConfig, EnvError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
