//! Session child-process supervision.
//!
//! Every forwarder is the cloud CLI running `ssm start-session`, which in turn
//! spawns the session-manager helper that actually holds the local port. The
//! CLI is started as a process group leader (`setpgid(0, 0)`) so teardown can
//! deliver `SIGKILL` to `-pgid` and take the helper down with it.
//!
//! Children are deliberately *not* `kill_on_drop`: a forwarder outlives the
//! console process and is re-adopted by PID on the next start.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TunnelError;

/// How long `wait` keeps draining pipes after the child exits. The helper
/// process may hold the write ends open a little longer than its parent.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Bounded in-memory capture of one output stream.
///
/// Bytes beyond the limit are drained from the pipe (so the child never
/// blocks on a full pipe) but discarded.
#[derive(Clone)]
struct Captured {
    buf: Arc<Mutex<Vec<u8>>>,
    limit: usize,
}

impl Captured {
    fn new(limit: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    fn push(&self, data: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        if buf.len() < self.limit {
            let take = data.len().min(self.limit - buf.len());
            buf.extend_from_slice(&data[..take]);
        }
    }

    fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn spawn_reader(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    sink: Captured,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tmp = [0u8; 4096];
        loop {
            match reader.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.push(&tmp[..n]),
            }
        }
    })
}

/// A running session child with captured stdout/stderr.
pub struct SessionProcess {
    pid: u32,
    child: Child,
    stdout: Captured,
    stderr: Captured,
    readers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Cheap, cloneable control over a [`SessionProcess`] that lives in a
/// registry entry while the process itself is owned by its monitor task.
#[derive(Clone, Debug)]
pub struct ProcessControl {
    pid: u32,
    cancel: CancellationToken,
}

/// Outcome of [`SessionProcess::wait`].
#[derive(Debug)]
pub struct ExitReport {
    /// Exit status, or the `wait()` error string.
    pub status: Result<ExitStatus, String>,
    pub stdout: String,
    pub stderr: String,
    /// Whether the exit followed a cancellation of the process scope.
    pub cancelled: bool,
}

impl SessionProcess {
    /// Launch `program args...` in its own process group.
    ///
    /// `cancel` is the manager-owned scope for this child; it is never derived
    /// from a caller's context, so a caller giving up on a start does not kill
    /// the tunnel.
    pub fn spawn(
        program: &str,
        args: &[String],
        output_limit: usize,
        cancel: CancellationToken,
    ) -> Result<Self, TunnelError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| TunnelError::SpawnFailed(format!("{program}: {e}")))?;
        let pid = child.id().unwrap_or(0);

        let stdout = Captured::new(output_limit);
        let stderr = Captured::new(output_limit);
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, stderr.clone()));
        }

        info!(pid, program, "session process started");
        Ok(Self {
            pid,
            child,
            stdout,
            stderr,
            readers,
            cancel,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn control(&self) -> ProcessControl {
        ProcessControl {
            pid: self.pid,
            cancel: self.cancel.clone(),
        }
    }

    /// Non-blocking check whether the child has already exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Stderr and stdout captured so far, stderr first, trimmed.
    pub fn output_so_far(&self) -> String {
        combine(&self.stderr.contents(), &self.stdout.contents())
    }

    /// Block until the child exits, then return its status and output.
    ///
    /// Cancelling the scope kills the whole group and then reaps the child.
    pub async fn wait(mut self) -> ExitReport {
        let mut cancelled = false;
        let status = tokio::select! {
            status = self.child.wait() => status,
            () = self.cancel.cancelled() => {
                cancelled = true;
                kill_group(self.pid);
                self.child.wait().await
            }
        };
        // stop() kills the group right after cancelling, so the plain wait
        // branch can win the race.
        cancelled |= self.cancel.is_cancelled();

        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                debug!(pid = self.pid, "output pipe still open after exit, abandoning");
                reader.abort();
            }
        }

        ExitReport {
            status: status.map_err(|e| e.to_string()),
            stdout: self.stdout.contents(),
            stderr: self.stderr.contents(),
            cancelled,
        }
    }
}

impl ProcessControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Cancel the scope, then `SIGKILL` the process group (falling back to
    /// the single process).
    pub fn stop(&self) {
        self.cancel.cancel();
        kill_group(self.pid);
    }
}

impl ExitReport {
    /// `true` for a zero exit code.
    pub fn is_success(&self) -> bool {
        matches!(&self.status, Ok(s) if s.success())
    }

    /// OS-level description of a failed exit (`exit status 1`,
    /// `signal: 9`), or `None` on success.
    pub fn os_error(&self) -> Option<String> {
        match &self.status {
            Ok(s) if s.success() => None,
            Ok(s) => Some(match (s.code(), s.signal()) {
                (Some(code), _) => format!("exit status {code}"),
                (None, Some(sig)) => format!("signal: {sig}"),
                (None, None) => s.to_string(),
            }),
            Err(e) => Some(e.clone()),
        }
    }

    /// Error text for a failed exit: trimmed stderr when non-empty, else the
    /// OS error string. `None` on success.
    pub fn stderr_or_os_error(&self) -> Option<String> {
        let os = self.os_error()?;
        let stderr = self.stderr.trim();
        Some(if stderr.is_empty() {
            os
        } else {
            stderr.to_string()
        })
    }

    /// Error text preferring everything the child printed (stderr then
    /// stdout), else the OS error string. `None` on success.
    pub fn output_or_os_error(&self) -> Option<String> {
        let os = self.os_error()?;
        let combined = combine(&self.stderr, &self.stdout);
        Some(if combined.is_empty() { os } else { combined })
    }
}

fn combine(stderr: &str, stdout: &str) -> String {
    let stderr = stderr.trim();
    let stdout = stdout.trim();
    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stderr.to_string(),
        (true, false) => stdout.to_string(),
        (false, false) => format!("{stderr}\n{stdout}"),
    }
}

/// Send `SIGKILL` to the process group led by `pid`, falling back to the
/// single process if the group signal fails. Returns whether either signal
/// was delivered.
pub fn kill_group(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // kill(-pgid, sig) reaches every process in the group
    if unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
        return true;
    }
    let delivered = unsafe { libc::kill(pid, libc::SIGKILL) } == 0;
    if !delivered {
        warn!(
            pid,
            "SIGKILL failed: {}",
            std::io::Error::last_os_error()
        );
    }
    delivered
}

/// Whether `signal 0` to `pid` succeeds, i.e. the process exists and is
/// signalable by us.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}
