//! Container execution backend driven through the docker CLI.
//!
//! A single long-lived container is started lazily on the first `run()`.
//! The working directory on the host is bind-mounted into it, so uploads and
//! downloads go straight to the host directory and commands inside the
//! container see the same files without any copy step.

use crate::config::EnvConfig;
use crate::env::ExecutionEnv;
use crate::error::{EnvError, Result};
use crate::exec::{run_streamed, ExecResult, StreamOptions};
use crate::files::Files;
use crate::store::FileStore;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Budget for `docker run -d` and `docker start`.
const START_TIMEOUT: Duration = Duration::from_secs(60);

/// Seconds `docker stop` waits before escalating to SIGKILL.
const STOP_GRACE_SECS: u64 = 2;

/// Fragments of `docker run` errors that mean the image is not available.
const IMAGE_NOT_FOUND_MARKERS: &[&str] = &[
    "No such image",
    "Unable to find image",
    "pull access denied",
    "manifest unknown",
];

/// Prefixes of stderr written by `docker exec` itself when it could not
/// run the command at all.
const EXEC_FAILURE_MARKERS: &[&str] = &[
    "Error response from daemon:",
    "OCI runtime exec failed",
    "docker: ",
];

/// Lifecycle of the backing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    /// No container yet (or it was removed).
    Absent,
    /// Container is up and accepts `exec`.
    Running(String),
    /// Container exists but was stopped after a timeout or exec failure.
    Stopped(String),
}

impl ContainerState {
    /// Container ID, if one exists.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Absent => None,
            Self::Running(id) | Self::Stopped(id) => Some(id),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Running(_) => write!(f, "running"),
            Self::Stopped(_) => write!(f, "stopped"),
        }
    }
}

/// Subset of `docker inspect --format '{{json .State}}'`.
#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Status", default)]
    status: String,
}

/// Runs commands inside a Docker container.
///
/// Commands never touch host state beyond the bind-mounted working
/// directory. On timeout the exec client is killed and the container is
/// stopped as well, since killing only the client would leave the command
/// running inside; the next `run()` restarts it.
///
/// Call [`cleanup`](Self::cleanup) when done. Dropping the environment
/// without it force-removes the container in the background as a last
/// resort.
pub struct DockerExecutionEnv {
    store: FileStore,
    config: EnvConfig,
    name: String,
    container: Mutex<ContainerState>,
}

impl DockerExecutionEnv {
    /// Create an environment over `dir`, or over a fresh temp directory.
    ///
    /// No container is started until the first [`run`](ExecutionEnv::run).
    pub async fn new(dir: Option<PathBuf>, config: EnvConfig) -> Result<Self> {
        config.validate()?;
        let store = FileStore::open(dir, &config.temp_prefix).await?;
        let name = format!("{}{}", config.temp_prefix, Uuid::new_v4().simple());
        tracing::debug!(
            container_name = %name,
            image = %config.image,
            host_dir = %store.root().display(),
            "Docker execution environment ready"
        );

        Ok(Self {
            store,
            config,
            name,
            container: Mutex::new(ContainerState::Absent),
        })
    }

    /// Host directory that is bind-mounted into the container.
    pub fn host_dir(&self) -> &Path {
        self.store.root()
    }

    /// Name given to the container.
    pub fn container_name(&self) -> &str {
        &self.name
    }

    /// Get the configuration.
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Current container state.
    pub async fn state(&self) -> ContainerState {
        self.container.lock().await.clone()
    }

    /// Start the container if it is not running yet and return its ID.
    ///
    /// # Errors
    ///
    /// - [`EnvError::ImageNotFound`] if the image is not available locally;
    ///   the message says how to build it.
    /// - [`EnvError::Configuration`] if the docker binary is missing.
    /// - [`EnvError::ResourceCreation`] for any other launch failure.
    pub async fn start_container(&self) -> Result<String> {
        let mut state = self.container.lock().await;
        self.ensure_running(&mut state).await
    }

    /// Ask the daemon whether the container is running.
    pub async fn container_running(&self) -> Result<bool> {
        let Some(id) = self.container.lock().await.id().map(str::to_string) else {
            return Ok(false);
        };

        let output = self
            .docker_output(
                &["inspect", "--format", "{{json .State}}", &id],
                self.config.stop_timeout,
            )
            .await?;
        if !output.status.success() {
            return Ok(false);
        }
        let state: InspectState = serde_json::from_slice(&output.stdout)?;
        tracing::trace!(container_id = %short_id(&id), status = %state.status, "Inspected container");
        Ok(state.running)
    }

    /// Stop and remove the container, then remove the host directory if
    /// this environment allocated it.
    ///
    /// Never fails: errors are logged and swallowed. Calling it again, or
    /// before any container exists, is a no-op.
    pub async fn cleanup(&self) {
        let previous = {
            let mut state = self.container.lock().await;
            std::mem::replace(&mut *state, ContainerState::Absent)
        };

        if let Some(id) = previous.id() {
            tracing::info!(container_id = %short_id(id), state = %previous, "Cleaning up container");
            if matches!(previous, ContainerState::Running(_)) {
                self.stop_container(id).await;
            }
            self.remove_container(id).await;
        }

        self.store.cleanup().await;
    }

    /// Make sure a running container exists, starting or restarting it.
    async fn ensure_running(&self, state: &mut ContainerState) -> Result<String> {
        match state.clone() {
            ContainerState::Running(id) => return Ok(id),
            ContainerState::Stopped(id) => {
                if self.restart_container(&id).await {
                    *state = ContainerState::Running(id.clone());
                    return Ok(id);
                }
                self.remove_container(&id).await;
                *state = ContainerState::Absent;
            }
            ContainerState::Absent => {}
        }

        let id = self.launch().await?;
        *state = ContainerState::Running(id.clone());
        Ok(id)
    }

    /// `docker run` a fresh keep-alive container.
    async fn launch(&self) -> Result<String> {
        let start = std::time::Instant::now();
        tracing::info!(
            container_name = %self.name,
            image = %self.config.image,
            host_dir = %self.store.root().display(),
            "Starting container"
        );

        let args = self.run_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.docker_output(&args, START_TIMEOUT).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(image = %self.config.image, error = %stderr.trim(), "Container launch failed");
            return Err(classify_launch_failure(&self.config, &stderr));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(EnvError::ResourceCreation(
                "docker run printed no container id".into(),
            ));
        }

        tracing::info!(
            container_id = %short_id(&id),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Container started"
        );
        Ok(id)
    }

    /// Arguments for `docker run`.
    ///
    /// The container runs as the host user so everything it writes into the
    /// bind mount stays removable and overwritable from the host.
    fn run_args(&self) -> Vec<String> {
        let workdir = self.config.container_workdir.display().to_string();
        let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--init".into()];
        if let Some(user) = host_user() {
            args.extend(["--user".into(), user]);
        }
        args.extend([
            "--pull".into(),
            "never".into(),
            "--name".into(),
            self.name.clone(),
            "-v".into(),
            format!("{}:{}", self.store.root().display(), workdir),
            "-w".into(),
            workdir,
            "--entrypoint".into(),
            "sleep".into(),
            self.config.image.clone(),
            "infinity".into(),
        ]);
        args
    }

    /// `docker start` a stopped container. Returns true on success.
    async fn restart_container(&self, id: &str) -> bool {
        tracing::info!(container_id = %short_id(id), "Restarting stopped container");
        match self.docker_output(&["start", id], START_TIMEOUT).await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                tracing::warn!(
                    container_id = %short_id(id),
                    error = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Failed to restart container"
                );
                false
            }
            Err(e) => {
                tracing::warn!(container_id = %short_id(id), error = %e, "Failed to restart container");
                false
            }
        }
    }

    /// Best-effort `docker stop`, bounded by the stop timeout.
    async fn stop_container(&self, id: &str) {
        let grace = STOP_GRACE_SECS.to_string();
        match self
            .docker_output(&["stop", "-t", &grace, id], self.config.stop_timeout)
            .await
        {
            Ok(output) if output.status.success() => {
                tracing::info!(container_id = %short_id(id), "Container stopped")
            }
            Ok(output) => tracing::warn!(
                container_id = %short_id(id),
                error = %String::from_utf8_lossy(&output.stderr).trim(),
                "Failed to stop container"
            ),
            Err(e) => tracing::warn!(container_id = %short_id(id), error = %e, "Failed to stop container"),
        }
    }

    /// Best-effort `docker rm -f`.
    async fn remove_container(&self, id: &str) {
        match self
            .docker_output(&["rm", "-f", id], self.config.stop_timeout)
            .await
        {
            Ok(output) if output.status.success() => {
                tracing::info!(container_id = %short_id(id), "Container removed")
            }
            Ok(output) => tracing::warn!(
                container_id = %short_id(id),
                error = %String::from_utf8_lossy(&output.stderr).trim(),
                "Failed to remove container"
            ),
            Err(e) => tracing::warn!(container_id = %short_id(id), error = %e, "Failed to remove container"),
        }
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a short docker CLI call to completion within `budget`.
    async fn docker_output(&self, args: &[&str], budget: Duration) -> Result<Output> {
        let mut cmd = self.docker();
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        tracing::trace!(args = ?args, "docker");

        let output = match tokio::time::timeout(budget, cmd.output()).await {
            Ok(output) => output,
            Err(_) => {
                return Err(EnvError::Exec(format!(
                    "`docker {}` did not finish within {:?}",
                    args.first().copied().unwrap_or_default(),
                    budget
                )))
            }
        };
        output.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EnvError::Configuration(format!(
                    "docker binary `{}` not found",
                    self.config.docker_bin.display()
                ))
            } else {
                EnvError::Exec(format!("failed to run docker: {e}"))
            }
        })
    }
}

#[async_trait]
impl ExecutionEnv for DockerExecutionEnv {
    async fn run(&self, command: &str, silent: bool) -> Result<ExecResult> {
        // Held for the whole run: one exec session per container at a time.
        let mut state = self.container.lock().await;
        let id = self.ensure_running(&mut state).await?;
        tracing::debug!(container_id = %short_id(&id), cmd = %command, "Running in container");

        let mut cmd = self.docker();
        cmd.arg("exec")
            .arg("-w")
            .arg(&self.config.container_workdir)
            .arg(&id)
            .args(["sh", "-c", command]);

        let result = run_streamed(
            cmd,
            command,
            StreamOptions {
                timeout: self.config.timeout,
                silent,
            },
        )
        .await?;

        if result.timed_out {
            tracing::warn!(container_id = %short_id(&id), "Stopping container after timeout");
            self.stop_container(&id).await;
            *state = ContainerState::Stopped(id);
            return Ok(result);
        }

        if is_exec_failure(&result) {
            tracing::error!(container_id = %short_id(&id), error = %result.stderr.trim(), "docker exec failed");
            *state = ContainerState::Stopped(id);
            return Err(EnvError::Exec(result.stderr.trim().to_string()));
        }

        Ok(result)
    }

    async fn upload(&self, files: &Files) -> Result<()> {
        self.store.upload(files).await
    }

    async fn download(&self) -> Result<Files> {
        self.store.download().await
    }
}

impl Drop for DockerExecutionEnv {
    fn drop(&mut self) {
        let state = std::mem::replace(self.container.get_mut(), ContainerState::Absent);
        let Some(id) = state.id() else {
            return;
        };

        tracing::warn!(container_id = %short_id(id), "Environment dropped without cleanup, removing container");
        let spawned = std::process::Command::new(&self.config.docker_bin)
            .args(["rm", "-f", id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            tracing::warn!(container_id = %short_id(id), error = %e, "Failed to remove container");
        }
    }
}

impl fmt::Debug for DockerExecutionEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerExecutionEnv")
            .field("name", &self.name)
            .field("image", &self.config.image)
            .field("host_dir", &self.store.root())
            .finish_non_exhaustive()
    }
}

/// Map a failed `docker run` to the error the caller should see.
fn classify_launch_failure(config: &EnvConfig, stderr: &str) -> EnvError {
    if IMAGE_NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) {
        EnvError::ImageNotFound {
            image: config.image.clone(),
            build_hint: config.build_hint(),
        }
    } else {
        EnvError::ResourceCreation(stderr.trim().to_string())
    }
}

/// True if the docker client or the container runtime failed rather than
/// the command.
fn is_exec_failure(result: &ExecResult) -> bool {
    let stderr = result.stderr.trim_start();
    result.exit_code != 0 && EXEC_FAILURE_MARKERS.iter().any(|m| stderr.starts_with(m))
}

/// `uid:gid` of this process.
#[cfg(unix)]
fn host_user() -> Option<String> {
    // SAFETY: getuid/getgid cannot fail and have no side effects.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(format!("{uid}:{gid}"))
}

#[cfg(not(unix))]
fn host_user() -> Option<String> {
    None
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::TIMEOUT_EXIT_CODE;

    const FAKE_ID: &str = "0123456789abcdef0123";

    async fn env(config: EnvConfig) -> DockerExecutionEnv {
        DockerExecutionEnv::new(None, config).await.unwrap()
    }

    /// Stand-in for the docker CLI. Logs every call and runs `exec`
    /// commands on the host.
    #[cfg(unix)]
    struct FakeDocker {
        dir: tempfile::TempDir,
    }

    #[cfg(unix)]
    impl FakeDocker {
        fn new() -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = tempfile::tempdir().unwrap();
            let script = format!(
                r#"#!/bin/sh
echo "$*" >> '{log}'
case "$1" in
  run)
    case "$*" in
      *missing-image*) echo "docker: Error response from daemon: No such image: missing-image:1" >&2; exit 125 ;;
    esac
    echo {id} ;;
  exec)
    shift 4
    if [ "$3" = nosh ]; then
      echo 'OCI runtime exec failed: exec failed: unable to start container process: exec: "sh": executable file not found in $PATH: unknown' >&2
      exit 126
    fi
    exec "$@" ;;
  inspect) echo '{{"Running":true,"Status":"running"}}' ;;
esac
"#,
                log = dir.path().join("calls.log").display(),
                id = FAKE_ID,
            );
            let bin = dir.path().join("docker");
            std::fs::write(&bin, script).unwrap();
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self { dir }
        }

        fn config(&self, timeout: Duration) -> EnvConfig {
            EnvConfig::builder()
                .docker_bin(self.dir.path().join("docker"))
                .timeout(timeout)
                .stop_timeout(Duration::from_secs(5))
                .build()
                .unwrap()
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_classify_missing_image() {
        let config = EnvConfig::builder()
            .image("eval-env:dev")
            .build_context("docker/")
            .build()
            .unwrap();
        for stderr in [
            "Error response from daemon: No such image: eval-env:dev",
            "Unable to find image 'eval-env:dev' locally\n",
            "docker: Error response from daemon: pull access denied for eval-env",
        ] {
            let err = classify_launch_failure(&config, stderr);
            assert!(matches!(err, EnvError::ImageNotFound { .. }), "{stderr}");
            assert!(err.to_string().contains("docker build -t eval-env:dev docker/"));
        }
    }

    #[test]
    fn test_classify_other_failure_keeps_raw_text() {
        let config = EnvConfig::default();
        let err = classify_launch_failure(
            &config,
            "docker: Error response from daemon: Conflict. The container name is already in use.\n",
        );
        match err {
            EnvError::ResourceCreation(msg) => assert!(msg.ends_with("already in use.")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_exec_failure_detection() {
        let mut result = ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Error response from daemon: container abc is not running\n".into(),
            timed_out: false,
            duration_ms: 3,
        };
        assert!(is_exec_failure(&result));
        result.exit_code = 126;
        result.stderr = "OCI runtime exec failed: exec failed: unable to start container process: exec: \"sh\": executable file not found in $PATH: unknown\n".into();
        assert!(is_exec_failure(&result));
        result.stderr = "docker: 'exec' requires at least 2 arguments.\n".into();
        assert!(is_exec_failure(&result));
        result.exit_code = 1;
        result.stderr = "python: can't open file 'x.py'\n".into();
        assert!(!is_exec_failure(&result));
        result.exit_code = 0;
        result.stderr = "Error response from daemon: printed by the command\n".into();
        assert!(!is_exec_failure(&result));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[tokio::test]
    async fn test_run_args_bind_mount() {
        let env = env(EnvConfig::builder().image("img:1").build().unwrap()).await;
        let args = env.run_args();
        let mount = format!("{}:/workspace", env.host_dir().display());

        assert_eq!(args[0], "run");
        assert!(args.contains(&"-d".to_string()));
        assert!(args.contains(&mount));
        assert!(args.contains(&env.container_name().to_string()));
        assert_eq!(&args[args.len() - 2..], ["img:1", "infinity"]);
        #[cfg(unix)]
        {
            let user = args.iter().position(|a| a == "--user").unwrap();
            assert_eq!(Some(&args[user + 1]), host_user().as_ref());
        }
        env.cleanup().await;
    }

    #[tokio::test]
    async fn test_missing_docker_binary() {
        let env = env(
            EnvConfig::builder()
                .docker_bin("runcell-no-such-docker")
                .build()
                .unwrap(),
        )
        .await;
        let err = env.run("true", true).await.unwrap_err();
        assert!(matches!(err, EnvError::Configuration(_)));
        assert_eq!(env.state().await, ContainerState::Absent);
        env.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_without_container_is_noop() {
        let env = env(EnvConfig::default()).await;
        let host_dir = env.host_dir().to_path_buf();
        assert!(!env.container_running().await.unwrap());

        env.cleanup().await;
        env.cleanup().await;
        assert!(!host_dir.exists());
    }

    #[tokio::test]
    async fn test_upload_download_without_container() {
        let env = env(EnvConfig::default()).await;
        let mut files = Files::new();
        files.insert("a.txt".into(), "1".into());
        env.upload(&files).await.unwrap();
        assert_eq!(env.download().await.unwrap(), files);

        let mut escaping = Files::new();
        escaping.insert("../x".into(), "x".into());
        assert!(env.upload(&escaping).await.is_err());
        env.cleanup().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_stops_container_and_next_run_restarts_it() {
        let docker = FakeDocker::new();
        let env = env(docker.config(Duration::from_millis(300))).await;

        let result = env.run("sleep 60", true).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(env.state().await, ContainerState::Stopped(FAKE_ID.into()));

        let calls = docker.calls();
        assert!(calls[0].starts_with("run -d --init --user "));
        assert_eq!(calls[1], format!("exec -w /workspace {FAKE_ID} sh -c sleep 60"));
        assert_eq!(calls[2], format!("stop -t 2 {FAKE_ID}"));

        let result = env.run("echo back", true).await.unwrap();
        assert_eq!(result.stdout, "back\n");
        assert_eq!(env.state().await, ContainerState::Running(FAKE_ID.into()));
        assert!(env.container_running().await.unwrap());

        let calls = docker.calls();
        assert_eq!(calls[3], format!("start {FAKE_ID}"));
        assert_eq!(calls[4], format!("exec -w /workspace {FAKE_ID} sh -c echo back"));

        env.cleanup().await;
        let calls = docker.calls();
        assert_eq!(
            &calls[calls.len() - 2..],
            [format!("stop -t 2 {FAKE_ID}"), format!("rm -f {FAKE_ID}")]
        );
        assert_eq!(env.state().await, ContainerState::Absent);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cleanup_after_timeout_removes_container_and_host_dir() {
        let docker = FakeDocker::new();
        let env = env(docker.config(Duration::from_millis(300))).await;
        let host_dir = env.host_dir().to_path_buf();

        let mut files = Files::new();
        files.insert("main.py".into(), "print(1)".into());
        env.upload(&files).await.unwrap();

        let result = env.run("sleep 60", true).await.unwrap();
        assert!(result.timed_out);

        env.cleanup().await;
        let calls = docker.calls();
        assert!(calls[0].contains(&format!("--user {}", host_user().unwrap())));
        assert_eq!(calls.last().unwrap(), &format!("rm -f {FAKE_ID}"));
        assert!(!host_dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runtime_exec_failure_is_an_error() {
        let docker = FakeDocker::new();
        let env = env(docker.config(Duration::from_secs(10))).await;

        let err = env.run("nosh", true).await.unwrap_err();
        assert!(matches!(err, EnvError::Exec(ref msg) if msg.starts_with("OCI runtime exec failed")));
        assert_eq!(env.state().await, ContainerState::Stopped(FAKE_ID.into()));

        env.run("true", true).await.unwrap();
        assert!(docker.calls().contains(&format!("start {FAKE_ID}")));
        env.cleanup().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_image_reported_with_build_hint() {
        let docker = FakeDocker::new();
        let config = EnvConfig::builder()
            .docker_bin(docker.dir.path().join("docker"))
            .image("missing-image:1")
            .build_context("images/sandbox")
            .build()
            .unwrap();
        let env = env(config).await;

        let err = env.start_container().await.unwrap_err();
        assert!(matches!(err, EnvError::ImageNotFound { .. }));
        assert!(err
            .to_string()
            .contains("docker build -t missing-image:1 images/sandbox"));
        assert_eq!(env.state().await, ContainerState::Absent);

        env.cleanup().await;
        assert_eq!(docker.calls().len(), 1);
    }
}
