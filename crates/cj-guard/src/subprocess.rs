use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::events::{SecurityEventKind, SecurityLog};
use crate::paths::{PathError, PathValidator};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("program not found: {0}")]
    NotFound(String),
    #[error("invalid working directory: {0}")]
    InvalidCwd(#[from] PathError),
    #[error("spawn failed for `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error reading child streams: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// CommandSpec / CommandOutput
// ---------------------------------------------------------------------------

/// One tool invocation: argv array (never a shell string), validated cwd,
/// allowlisted environment, hard timeout.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Extra env pairs layered over the allowlisted inherited set.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            timeout: Duration::from_secs(60),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of a finished (or killed) tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

// ---------------------------------------------------------------------------
// SubprocessExecutor
// ---------------------------------------------------------------------------

/// Environment keys passed through to child processes. Everything else is
/// stripped so tool behavior does not depend on ambient operator state.
const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "VIRTUAL_ENV",
    "PYTHONPATH",
    "UV_CACHE_DIR",
    "XDG_CACHE_HOME",
];

/// Grace period between SIGTERM and SIGKILL when a timeout fires.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Maximum bytes retained per captured stream; pathological tools are
/// truncated rather than ballooning memory.
const MAX_STREAM_BYTES: usize = 8 * 1024 * 1024;

/// Launches external tools with a sanitized environment, validated cwd, and
/// per-invocation timeout. Timeouts SIGTERM the process group, then SIGKILL
/// after a grace period.
pub struct SubprocessExecutor {
    validator: PathValidator,
    log: Arc<SecurityLog>,
}

impl SubprocessExecutor {
    pub fn new(validator: PathValidator, log: Arc<SecurityLog>) -> Self {
        Self { validator, log }
    }

    pub fn validator(&self) -> &PathValidator {
        &self.validator
    }

    /// Run a command to completion, enforcing the invocation timeout.
    pub async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, SubprocessError> {
        let cwd = match self.validator.validate_cwd(&spec.cwd) {
            Ok(cwd) => cwd,
            Err(e) => {
                self.log.record(
                    SecurityEventKind::SubprocessRejected,
                    format!("{}: {}", spec.program, e),
                );
                return Err(SubprocessError::InvalidCwd(e));
            }
        };

        debug!(
            program = %spec.program,
            args = ?spec.args,
            cwd = %cwd.display(),
            timeout_secs = spec.timeout.as_secs(),
            "spawning tool"
        );

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&cwd)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        #[cfg(unix)]
        command.process_group(0);

        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SubprocessError::NotFound(spec.program.clone())
            } else {
                SubprocessError::Spawn {
                    program: spec.program.clone(),
                    source: e,
                }
            }
        })?;

        let pid = child.id();
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = read_bounded(&mut stdout_pipe, &mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = read_bounded(&mut stderr_pipe, &mut buf).await;
            buf
        });

        let timed_out = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                return Ok(CommandOutput {
                    exit_code: status.code(),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    duration: start.elapsed(),
                    timed_out: false,
                });
            }
            Err(_) => true,
        };

        warn!(
            program = %spec.program,
            timeout_secs = spec.timeout.as_secs(),
            "tool timed out, terminating process group"
        );
        terminate_group(pid, &mut child).await;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(CommandOutput {
            exit_code: None,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: start.elapsed(),
            timed_out,
        })
    }
}

// ---------------------------------------------------------------------------
// Streaming interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// One line read from a child stream. `seq` is monotonic across both
/// streams, so a consumer merging them preserves arrival order.
#[derive(Debug, Clone)]
pub struct StreamLine {
    pub source: StreamSource,
    pub seq: u64,
    pub text: String,
}

/// A running child whose output is delivered line-by-line over a channel.
pub struct ChildStream {
    pub lines: flume::Receiver<StreamLine>,
    child: tokio::process::Child,
    pid: Option<u32>,
}

impl ChildStream {
    /// Wait for exit with a timeout. On expiry the process group is
    /// terminated and `None` is returned.
    pub async fn wait_with_timeout(mut self, timeout: Duration) -> Option<i32> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(_)) => None,
            Err(_) => {
                terminate_group(self.pid, &mut self.child).await;
                None
            }
        }
    }

    /// Wait for exit with a timeout and an optional cancellation signal.
    /// Either trigger terminates the process group (SIGTERM, grace,
    /// SIGKILL) and returns `None`.
    pub async fn wait_or_cancel(
        mut self,
        timeout: Duration,
        mut cancel: Option<tokio::sync::watch::Receiver<bool>>,
    ) -> Option<i32> {
        let cancelled = async move {
            match cancel.as_mut() {
                Some(rx) => {
                    // An already-set flag counts; otherwise wait for the
                    // change. A closed channel means no one can cancel.
                    loop {
                        if *rx.borrow() {
                            return;
                        }
                        if rx.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancelled);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let exited = {
            let wait = self.child.wait();
            tokio::pin!(wait);
            tokio::select! {
                status = &mut wait => Some(status.ok().and_then(|s| s.code())),
                _ = &mut deadline => None,
                _ = &mut cancelled => None,
            }
        };
        match exited {
            Some(code) => code,
            None => {
                terminate_group(self.pid, &mut self.child).await;
                None
            }
        }
    }

    /// Terminate the process group immediately.
    pub async fn kill(mut self) {
        terminate_group(self.pid, &mut self.child).await;
    }
}

impl SubprocessExecutor {
    /// Spawn a command and stream its output line-by-line. Used by the test
    /// executor, which needs progress before the process exits. The same
    /// cwd/env sanitization as `run` applies; the caller owns lifecycle via
    /// the returned handle.
    pub async fn spawn_lines(&self, spec: CommandSpec) -> Result<ChildStream, SubprocessError> {
        let cwd = self.validator.validate_cwd(&spec.cwd).map_err(|e| {
            self.log.record(
                SecurityEventKind::SubprocessRejected,
                format!("{}: {}", spec.program, e),
            );
            SubprocessError::InvalidCwd(e)
        })?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&cwd)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SubprocessError::NotFound(spec.program.clone())
            } else {
                SubprocessError::Spawn {
                    program: spec.program.clone(),
                    source: e,
                }
            }
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let (tx, rx) = flume::bounded(1024);
        let seq = Arc::new(std::sync::atomic::AtomicU64::new(0));

        spawn_line_reader(stdout, StreamSource::Stdout, tx.clone(), Arc::clone(&seq));
        spawn_line_reader(stderr, StreamSource::Stderr, tx, seq);

        Ok(ChildStream {
            lines: rx,
            child,
            pid,
        })
    }
}

fn spawn_line_reader<R>(
    reader: R,
    source: StreamSource,
    tx: flume::Sender<StreamLine>,
    seq: Arc<std::sync::atomic::AtomicU64>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncBufReadExt;
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            let line = StreamLine {
                source,
                seq: seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
                text,
            };
            if tx.send_async(line).await.is_err() {
                break;
            }
        }
    });
}

/// Read a child stream into `buf`, dropping bytes past the retention cap.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        if buf.len() < MAX_STREAM_BYTES {
            let take = n.min(MAX_STREAM_BYTES - buf.len());
            buf.extend_from_slice(&chunk[..take]);
        }
    }
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
async fn terminate_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_executor(root: &std::path::Path) -> SubprocessExecutor {
        SubprocessExecutor::new(
            PathValidator::new(root).unwrap(),
            Arc::new(SecurityLog::default()),
        )
    }

    #[tokio::test]
    async fn runs_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let exec = make_executor(dir.path());

        let spec = CommandSpec::new("echo", dir.path()).arg("hello");
        let out = exec.run(spec).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn captures_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exec = make_executor(dir.path());

        let spec = CommandSpec::new("sh", dir.path()).args(["-c", "echo oops >&2; exit 3"]);
        let out = exec.run(spec).await.unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let exec = make_executor(dir.path());

        let spec = CommandSpec::new("definitely-not-a-real-tool-xyz", dir.path());
        let err = exec.run(spec).await.unwrap_err();
        assert!(matches!(err, SubprocessError::NotFound(_)));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let exec = make_executor(dir.path());

        let spec = CommandSpec::new("sleep", dir.path())
            .arg("30")
            .timeout(Duration::from_millis(200));
        let start = Instant::now();
        let out = exec.run(spec).await.unwrap();
        assert!(out.timed_out);
        assert!(out.exit_code.is_none());
        // SIGTERM path should finish well before the sleep would.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn invalid_cwd_is_rejected_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(SecurityLog::default());
        let exec = SubprocessExecutor::new(
            PathValidator::new(dir.path()).unwrap(),
            Arc::clone(&log),
        );

        let spec = CommandSpec::new("echo", "/");
        let err = exec.run(spec).await.unwrap_err();
        assert!(matches!(err, SubprocessError::InvalidCwd(_)));
        assert_eq!(log.count(SecurityEventKind::SubprocessRejected), 1);
    }

    #[tokio::test]
    async fn spawn_lines_streams_both_sources_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let exec = make_executor(dir.path());

        let spec = CommandSpec::new("sh", dir.path())
            .args(["-c", "echo one; echo two >&2; echo three"]);
        let stream = exec.spawn_lines(spec).await.unwrap();
        let rx = stream.lines.clone();
        let code = stream.wait_with_timeout(Duration::from_secs(5)).await;
        assert_eq!(code, Some(0));

        let mut lines: Vec<StreamLine> = Vec::new();
        while let Ok(line) = rx.recv() {
            lines.push(line);
        }
        assert_eq!(lines.len(), 3);
        // Sequence numbers are unique and monotonic per arrival.
        let mut seqs: Vec<u64> = lines.iter().map(|l| l.seq).collect();
        seqs.sort();
        seqs.dedup();
        assert_eq!(seqs.len(), 3);
        assert!(lines.iter().any(|l| l.source == StreamSource::Stderr));
    }

    #[tokio::test]
    async fn spawn_lines_timeout_kills() {
        let dir = tempfile::tempdir().unwrap();
        let exec = make_executor(dir.path());

        let spec = CommandSpec::new("sleep", dir.path()).arg("30");
        let stream = exec.spawn_lines(spec).await.unwrap();
        let start = Instant::now();
        let code = stream.wait_with_timeout(Duration::from_millis(200)).await;
        assert!(code.is_none());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn env_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let exec = make_executor(dir.path());

        std::env::set_var("CRACKERJACK_TEST_LEAK", "leaked");
        let spec = CommandSpec::new("sh", dir.path())
            .args(["-c", "echo ${CRACKERJACK_TEST_LEAK:-clean}"]);
        let out = exec.run(spec).await.unwrap();
        std::env::remove_var("CRACKERJACK_TEST_LEAK");
        assert_eq!(out.stdout.trim(), "clean");
    }

    #[tokio::test]
    async fn explicit_env_pairs_are_passed() {
        let dir = tempfile::tempdir().unwrap();
        let exec = make_executor(dir.path());

        let spec = CommandSpec::new("sh", dir.path())
            .args(["-c", "echo $CJ_FLAG"])
            .env("CJ_FLAG", "on");
        let out = exec.run(spec).await.unwrap();
        assert_eq!(out.stdout.trim(), "on");
    }
}
