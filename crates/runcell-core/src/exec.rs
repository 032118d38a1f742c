//! Streamed process execution under a wall-clock deadline.
//!
//! Each run spawns exactly one child (a shell on the host, or the
//! `docker exec` client) in its own process group. Two reader tasks drain
//! stdout and stderr into channels; the caller's loop collects both into
//! separate buffers while waiting for the child and the deadline.

use crate::error::{EnvError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Exit code reported when a command is killed for exceeding its timeout.
///
/// Matches the convention of coreutils `timeout(1)`. Always paired with
/// [`ExecResult::timed_out`] set to true.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Size of a single pipe read.
const READ_CHUNK: usize = 8 * 1024;

/// Result from command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code; `128 + n` when killed by signal `n`,
    /// [`TIMEOUT_EXIT_CODE`] on timeout.
    pub exit_code: i32,
    /// Standard output (lossy UTF-8).
    pub stdout: String,
    /// Standard error (lossy UTF-8).
    pub stderr: String,
    /// True if the command was killed at the deadline.
    pub timed_out: bool,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
}

impl ExecResult {
    /// Check if the command succeeded (exit code 0, no timeout).
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Per-run knobs for [`run_streamed`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamOptions {
    pub timeout: Duration,
    pub silent: bool,
}

/// In-flight record of one command.
#[derive(Debug)]
struct CommandExecution {
    command: String,
    started_at: DateTime<Utc>,
    start: Instant,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    timed_out: bool,
}

impl CommandExecution {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            started_at: Utc::now(),
            start: Instant::now(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            timed_out: false,
        }
    }

    fn finish(self) -> ExecResult {
        let exit_code = if self.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            self.exit_code.unwrap_or(-1)
        };
        let result = ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            timed_out: self.timed_out,
            duration_ms: self.start.elapsed().as_millis() as u64,
        };
        tracing::debug!(
            cmd = %self.command,
            started_at = %self.started_at,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            elapsed_ms = result.duration_ms,
            "Command finished"
        );
        tracing::trace!(stdout = %result.stdout, stderr = %result.stderr, "Command output");
        result
    }
}

/// Run `cmd` to completion or until `opts.timeout` elapses.
///
/// `label` is the user-facing command line, used for logging only. On
/// timeout the child's whole process group is killed, output captured so
/// far is kept and the result carries [`TIMEOUT_EXIT_CODE`].
///
/// # Errors
///
/// [`EnvError::Configuration`] if the program does not exist,
/// [`EnvError::Exec`] for any other spawn failure.
pub(crate) async fn run_streamed(
    mut cmd: Command,
    label: &str,
    opts: StreamOptions,
) -> Result<ExecResult> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    tracing::debug!(cmd = %label, program = %program, timeout_ms = opts.timeout.as_millis() as u64, "Spawning command");
    let mut child = cmd.spawn().map_err(|e| spawn_error(&program, e))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EnvError::Exec("stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EnvError::Exec("stderr was not captured".into()))?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let out_reader = tokio::spawn(pump(stdout, out_tx));
    let err_reader = tokio::spawn(pump(stderr, err_tx));

    let mut exec = CommandExecution::new(label);
    let deadline = exec.start + opts.timeout;
    let mut status: Option<ExitStatus> = None;
    let mut out_open = true;
    let mut err_open = true;

    while status.is_none() || out_open || err_open {
        tokio::select! {
            chunk = out_rx.recv(), if out_open => match chunk {
                Some(chunk) => {
                    if !opts.silent {
                        let _ = tokio::io::stdout().write_all(&chunk).await;
                    }
                    exec.stdout.extend_from_slice(&chunk);
                }
                None => out_open = false,
            },
            chunk = err_rx.recv(), if err_open => match chunk {
                Some(chunk) => {
                    if !opts.silent {
                        let _ = tokio::io::stderr().write_all(&chunk).await;
                    }
                    exec.stderr.extend_from_slice(&chunk);
                }
                None => err_open = false,
            },
            waited = child.wait(), if status.is_none() => {
                let waited = waited?;
                exec.exit_code = Some(exit_code(waited));
                status = Some(waited);
            },
            _ = tokio::time::sleep_until(deadline) => {
                exec.timed_out = true;
                break;
            }
        }
    }

    if exec.timed_out {
        tracing::warn!(
            cmd = %label,
            timeout_ms = opts.timeout.as_millis() as u64,
            "Command timed out, killing process group"
        );
        // Background members may still hold the pipes even if the leader exited.
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        if status.is_none() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Failed to kill timed out child");
            }
        }
        out_reader.abort();
        err_reader.abort();
        while let Ok(chunk) = out_rx.try_recv() {
            exec.stdout.extend_from_slice(&chunk);
        }
        while let Ok(chunk) = err_rx.try_recv() {
            exec.stderr.extend_from_slice(&chunk);
        }
    }

    Ok(exec.finish())
}

/// Forward everything read from `reader` to `tx` until EOF.
async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Pipe read failed");
                break;
            }
        }
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> EnvError {
    if e.kind() == std::io::ErrorKind::NotFound {
        EnvError::Configuration(format!("`{program}` not found on PATH"))
    } else {
        EnvError::Exec(format!("failed to spawn `{program}`: {e}"))
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: killpg only sends a signal. The group was created for this
    // child by `process_group(0)`, and a group id is not reused while the
    // group still has members.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}
