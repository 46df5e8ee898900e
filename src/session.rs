use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

/// Append-only output log with a read cursor.
///
/// The producer (pipe reader tasks) appends chunks in arrival order; the
/// consumer (`get_new_output`) takes the delta past the cursor and advances
/// it. The surrounding mutex serializes both sides, so bytes are delivered
/// exactly once and never overlap across concurrent reads.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: String,
    cursor: usize,
}

impl OutputBuffer {
    pub fn append(&mut self, chunk: &str) {
        self.data.push_str(chunk);
    }

    /// Everything buffered so far, without moving the cursor.
    pub fn snapshot(&self) -> String {
        self.data.clone()
    }

    /// The unread delta. Advances the cursor to the current end.
    pub fn take_new(&mut self) -> String {
        debug_assert!(self.cursor <= self.data.len());
        let delta = self.data[self.cursor..].to_string();
        self.cursor = self.data.len();
        delta
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// How a process ended: a normal exit code, or the signal that killed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(sig)) => write!(f, "terminated by signal {sig}"),
            (None, None) => write!(f, "exited"),
        }
    }
}

/// One spawned OS process and its captured output.
///
/// Cheaply cloneable: all mutable state lives behind `Arc`s so the registry,
/// the supervisor task, and API handlers can share one session. The PID is
/// the sole external handle.
#[derive(Clone)]
pub struct Session {
    pub pid: u32,
    /// The original requested command text.
    pub command: String,
    /// Which interpreter launched it (e.g. `/bin/bash`).
    pub shell: String,
    pub started_at: Instant,
    pub buffer: Arc<Mutex<OutputBuffer>>,
    /// Set once the initial wait window elapses before the process finished.
    /// One-way: never cleared by elapsing time.
    pub is_blocked: Arc<AtomicBool>,
    /// Set exactly once by the supervisor when the process terminates.
    /// Readers are joined first, so the buffer is frozen from that point on.
    pub exit_info: Arc<RwLock<Option<ExitInfo>>>,
    /// Set once a force-terminate signal has been sent.
    pub termination_requested: Arc<AtomicBool>,
    /// Completion signal: flips to `true` when `exit_info` has been set.
    /// `execute_command` races this against its timeout.
    pub exited: watch::Receiver<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(pid: u32, command: String, shell: String, exited: watch::Receiver<bool>) -> Self {
        Self {
            pid,
            command,
            shell,
            started_at: Instant::now(),
            buffer: Arc::new(Mutex::new(OutputBuffer::default())),
            is_blocked: Arc::new(AtomicBool::new(false)),
            exit_info: Arc::new(RwLock::new(None)),
            termination_requested: Arc::new(AtomicBool::new(false)),
            exited,
        }
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_info.read()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info.read().is_some()
    }

    pub fn runtime_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    /// Send SIGTERM to the child's process group.
    ///
    /// The child is spawned as a process group leader, so the negative PID
    /// reaches the shell and everything it forked. Checks `exit_info` first
    /// to avoid signaling a potentially-recycled PID.
    pub fn send_term(&self) {
        self.signal(libc::SIGTERM);
    }

    /// Send SIGKILL to the child's process group. Escalation path when the
    /// child ignores SIGTERM within the grace period.
    pub fn send_kill(&self) {
        self.signal(libc::SIGKILL);
    }

    #[cfg(unix)]
    fn signal(&self, sig: i32) {
        if self.pid == 0 || self.pid > i32::MAX as u32 {
            tracing::warn!(pid = self.pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        if self.has_exited() {
            tracing::debug!(pid = self.pid, sig, "child already exited, skipping signal");
            return;
        }
        unsafe {
            libc::kill(-(self.pid as i32), sig);
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _sig: i32) {}
}
