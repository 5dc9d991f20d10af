//! Subprocess execution with timeouts and cancellation.
//!
//! Children run in their own process group so a timeout or cancellation
//! kills everything they spawned.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Lines of log shown when a command fails.
pub const TAIL_LINES: usize = 20;

/// Bounds applied to every subprocess.
#[derive(Debug, Clone, Default)]
pub struct RunLimits {
    /// Wall-clock limit; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Kills the child when triggered.
    pub cancel: CancellationToken,
}

impl RunLimits {
    /// Same cancellation, different timeout.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            cancel: self.cancel.clone(),
        }
    }
}

/// Errors running a subprocess.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started.
    #[error("failed to run `{program}`")]
    Spawn {
        /// Command line.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The program exited unsuccessfully.
    #[error("`{program}` exited with {}{}", code.map_or("a signal".to_string(), |c| format!("status {c}")), tail_suffix(tail))]
    Failed {
        /// Command line.
        program: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Last lines of the log.
        tail: String,
    },
    /// The timeout elapsed and the process group was killed.
    #[error("`{program}` timed out after {}s", after.as_secs())]
    TimedOut {
        /// Command line.
        program: String,
        /// Limit that elapsed.
        after: Duration,
    },
    /// Cancellation was requested and the process group was killed.
    #[error("`{program}` was cancelled")]
    Cancelled {
        /// Command line.
        program: String,
    },
}

fn tail_suffix(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n{tail}")
    }
}

enum Exit {
    Done(io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

fn describe(cmd: &std::process::Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

async fn deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(after) => {
            tokio::time::sleep(after).await;
            after
        }
        None => std::future::pending().await,
    }
}

#[allow(unsafe_code)]
async fn kill_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: killpg(2) takes plain integers; the child leads its own
        // group since it was spawned with process_group(0).
        if unsafe { libc::killpg(pid, libc::SIGKILL) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid, error = %err, "failed to kill process group");
            }
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "child already exited");
    }
}

fn spawn(
    mut cmd: std::process::Command,
    program: &str,
) -> Result<tokio::process::Child, ProcessError> {
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    let mut cmd = tokio::process::Command::from(cmd);
    cmd.kill_on_drop(true).spawn().map_err(|source| ProcessError::Spawn {
        program: program.to_string(),
        source,
    })
}

async fn supervise(
    child: &mut tokio::process::Child,
    program: &str,
    limits: &RunLimits,
) -> Result<ExitStatus, ProcessError> {
    let exit = tokio::select! {
        status = child.wait() => Exit::Done(status),
        () = limits.cancel.cancelled() => Exit::Cancelled,
        after = deadline(limits.timeout) => Exit::TimedOut(after),
    };
    match exit {
        Exit::Done(status) => status.map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        }),
        Exit::TimedOut(after) => {
            kill_group(child).await;
            tracing::warn!(program, secs = after.as_secs(), "killed timed-out process group");
            Err(ProcessError::TimedOut {
                program: program.to_string(),
                after,
            })
        }
        Exit::Cancelled => {
            kill_group(child).await;
            Err(ProcessError::Cancelled {
                program: program.to_string(),
            })
        }
    }
}

/// Run `cmd` to completion, appending its output to `log` when given.
///
/// # Errors
///
/// Returns [`ProcessError`] on spawn failure, non-zero exit, timeout or
/// cancellation. A failure carries the log tail.
pub async fn run(
    mut cmd: std::process::Command,
    log: Option<&Path>,
    limits: &RunLimits,
) -> Result<(), ProcessError> {
    let program = describe(&cmd);
    let spawn_err = |source| ProcessError::Spawn {
        program: program.clone(),
        source,
    };
    cmd.stdin(Stdio::null());
    match log {
        Some(path) => {
            let out = OpenOptions::new().create(true).append(true).open(path).map_err(spawn_err)?;
            let err = out.try_clone().map_err(spawn_err)?;
            cmd.stdout(out).stderr(err);
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    tracing::debug!(%program, "running");
    let mut child = spawn(cmd, &program)?;
    let status = supervise(&mut child, &program, limits).await?;
    if status.success() {
        return Ok(());
    }
    let tail = log
        .and_then(|p| read_last_lines(p, TAIL_LINES).ok())
        .unwrap_or_default();
    Err(ProcessError::Failed {
        program,
        code: status.code(),
        tail,
    })
}

/// Run `cmd` and return its standard output.
///
/// # Errors
///
/// Same as [`run`]; the tail of a failure is the captured stderr.
pub async fn capture(mut cmd: std::process::Command, limits: &RunLimits) -> Result<String, ProcessError> {
    let program = describe(&cmd);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = spawn(cmd, &program)?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let out_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(s) = stdout.as_mut() {
            let _ = s.read_to_end(&mut buf).await;
        }
        buf
    });
    let err_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(s) = stderr.as_mut() {
            let _ = s.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = supervise(&mut child, &program, limits).await?;
    let out = out_task.await.unwrap_or_default();
    let err = err_task.await.unwrap_or_default();
    if status.success() {
        Ok(String::from_utf8_lossy(&out).into_owned())
    } else {
        let err = String::from_utf8_lossy(&err);
        let lines: Vec<&str> = err.lines().collect();
        let start = lines.len().saturating_sub(TAIL_LINES);
        Err(ProcessError::Failed {
            program,
            code: status.code(),
            tail: lines[start..].join("\n"),
        })
    }
}

/// Read the last `n` lines from a file.
///
/// Seeks to near the end instead of loading the whole file, so very large
/// build logs stay cheap.
pub fn read_last_lines(path: &Path, n: usize) -> io::Result<String> {
    // Read at most 16KB from the end (enough for ~400 lines at 40 chars each)
    const TAIL_SIZE: u64 = 16 * 1024;

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let seek_pos = file_len.saturating_sub(TAIL_SIZE);
    file.seek(SeekFrom::Start(seek_pos))?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let buffer = String::from_utf8_lossy(&bytes);

    // Seeked mid-file: drop the partial first line
    let content = if seek_pos > 0 {
        buffer.find('\n').map_or(&*buffer, |idx| &buffer[idx + 1..])
    } else {
        &*buffer
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].join("\n"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn failure_carries_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out.txt");
        let err = run(sh("echo one; echo two >&2; exit 3"), Some(&log), &RunLimits::default())
            .await
            .unwrap_err();
        match err {
            ProcessError::Failed { code, tail, .. } => {
                assert_eq!(code, Some(3));
                assert!(tail.contains("one"));
                assert!(tail.contains("two"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let script = format!("(sleep 2; touch {}) & sleep 5", marker.display());
        let limits = RunLimits {
            timeout: Some(Duration::from_millis(200)),
            ..RunLimits::default()
        };
        let err = run(sh(&script), None, &limits).await.unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "grandchild survived the timeout");
    }

    #[tokio::test]
    async fn cancellation() {
        let limits = RunLimits::default();
        let token = limits.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let err = run(sh("sleep 10"), None, &limits).await.unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn capture_stdout() {
        let out = capture(sh("printf 'git version 2.43.0'"), &RunLimits::default())
            .await
            .unwrap();
        assert_eq!(out, "git version 2.43.0");
    }

    #[test]
    fn tail_of_long_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("big.txt");
        let body: String = (0..5000).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&log, body).unwrap();
        let tail = read_last_lines(&log, 3).unwrap();
        assert_eq!(tail, "line 4997\nline 4998\nline 4999");
    }
}
