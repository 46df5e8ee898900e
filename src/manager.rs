//! Process lifecycle: spawn, capture, poll, terminate, reap.
//!
//! The manager owns the registry of live sessions keyed by PID. Each spawned
//! command gets two pipe reader tasks feeding its output buffer and one
//! supervisor task that waits for exit, freezes the buffer, and eventually
//! removes the session from the registry after a grace window so late
//! pollers can still collect the tail.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::config::LimitsConfig;
use crate::session::{ExitInfo, Session};

/// Hard ceiling on the initial wait window, regardless of what the caller
/// asks for. Long-running commands are meant to be polled, not awaited.
pub const MAX_WAIT_CEILING_MS: u64 = 300_000;

const READ_CHUNK_SIZE: usize = 8192;

/// Outcome of `execute_command`. A negative `pid` means the process never
/// started and `output` carries the error text.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub pid: i32,
    pub output: String,
    pub is_blocked: bool,
}

impl ExecResult {
    fn spawn_error(message: String) -> Self {
        Self {
            pid: -1,
            output: message,
            is_blocked: false,
        }
    }
}

/// One row of `list_active_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSession {
    pub pid: u32,
    pub is_blocked: bool,
    pub runtime_ms: u64,
}

#[derive(Debug)]
pub struct TerminalManager {
    sessions: Arc<RwLock<HashMap<u32, Session>>>,
    limits: LimitsConfig,
}

impl TerminalManager {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            limits,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Spawn `shell -c command` and wait up to `timeout_ms` for it to finish.
    ///
    /// If the process exits within the window the result carries its complete
    /// output and `is_blocked = false`. Otherwise the result carries whatever
    /// arrived so far, `is_blocked = true`, and the process keeps running in
    /// the background for later polling. Neither path consumes the output:
    /// `get_new_output` still starts from the beginning of the stream.
    pub async fn execute_command(&self, command: &str, timeout_ms: u64, shell: &str) -> ExecResult {
        {
            let sessions = self.sessions.read();
            if sessions.len() >= self.limits.max_sessions {
                tracing::warn!(
                    active = sessions.len(),
                    max = self.limits.max_sessions,
                    "session limit reached, refusing to spawn"
                );
                return ExecResult::spawn_error(format!(
                    "Session limit reached ({} active)",
                    sessions.len()
                ));
            }
        }

        let mut cmd = tokio::process::Command::new(shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        // Run as a process group leader so termination signals reach the
        // whole tree the shell forks, not just the shell itself.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(shell, error = %e, "failed to spawn command");
                return ExecResult::spawn_error(format!("Failed to start command: {e}"));
            }
        };

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                // Reaped before we could observe the PID; nothing to track.
                return ExecResult::spawn_error(
                    "Failed to start command: process exited before it could be tracked".into(),
                );
            }
        };

        let (exited_tx, exited_rx) = watch::channel(false);
        let session = Session::new(pid, command.to_string(), shell.to_string(), exited_rx);
        self.sessions.write().insert(pid, session.clone());
        tracing::info!(pid, shell, command, "spawned command");

        let stdout_task = child.stdout.take().map(|pipe| {
            tokio::spawn(pump_pipe(pipe, Arc::clone(&session.buffer)))
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(pump_pipe(pipe, Arc::clone(&session.buffer)))
        });

        tokio::spawn(supervise(
            child,
            session.clone(),
            exited_tx,
            stdout_task,
            stderr_task,
            Arc::clone(&self.sessions),
            Duration::from_millis(self.limits.reap_grace_ms),
        ));

        let wait = Duration::from_millis(timeout_ms.min(MAX_WAIT_CEILING_MS));
        let mut exited = session.exited.clone();
        let finished = tokio::time::timeout(wait, exited.wait_for(|done| *done))
            .await
            .is_ok();

        if !finished {
            session.is_blocked.store(true, Ordering::Release);
        }
        let output = session.buffer.lock().snapshot();
        ExecResult {
            pid: pid as i32,
            output,
            is_blocked: !finished,
        }
    }

    /// Output accumulated since the last read. `None` for an unknown PID,
    /// `Some("")` when the session exists but nothing new has arrived.
    pub fn get_new_output(&self, pid: u32) -> Option<String> {
        let session = self.sessions.read().get(&pid).cloned()?;
        let new_output = session.buffer.lock().take_new();
        Some(new_output)
    }

    /// Exit status of a tracked session, once it has one.
    pub fn exit_info(&self, pid: u32) -> Option<ExitInfo> {
        self.sessions.read().get(&pid).cloned()?.exit_info()
    }

    /// Begin terminating a session: SIGTERM its process group now, escalate
    /// to SIGKILL if it is still alive after the grace period. Returns
    /// whether termination was initiated; `false` only for an unknown PID.
    /// Idempotent, and a no-op for a session that already exited.
    pub fn force_terminate(&self, pid: u32) -> bool {
        let session = match self.sessions.read().get(&pid).cloned() {
            Some(session) => session,
            None => return false,
        };

        session.termination_requested.store(true, Ordering::Release);
        session.send_term();
        tracing::info!(pid, "sent SIGTERM to session process group");

        let grace = Duration::from_millis(self.limits.term_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !session.has_exited() {
                tracing::warn!(pid = session.pid, "still alive after SIGTERM, escalating to SIGKILL");
                session.send_kill();
            }
        });
        true
    }

    /// Snapshot of all tracked sessions, oldest first. Includes sessions
    /// that exited within the reap grace window.
    pub fn list_active_sessions(&self) -> Vec<ActiveSession> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
            .into_iter()
            .map(|s| ActiveSession {
                pid: s.pid,
                is_blocked: s.is_blocked.load(Ordering::Acquire),
                runtime_ms: s.runtime_ms() as u64,
            })
            .collect()
    }
}

/// Drain one pipe into the shared buffer until EOF. Stdout and stderr chunks
/// interleave in arrival order; invalid UTF-8 is replaced rather than lost.
async fn pump_pipe<R: AsyncRead + Unpin>(
    mut pipe: R,
    buffer: Arc<parking_lot::Mutex<crate::session::OutputBuffer>>,
) {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                buffer.lock().append(&text);
            }
            Err(e) => {
                tracing::debug!(error = %e, "pipe read failed, stopping reader");
                break;
            }
        }
    }
}

/// Wait for the child, freeze the buffer, publish the exit, then reap the
/// registry entry after the grace window.
async fn supervise(
    mut child: tokio::process::Child,
    session: Session,
    exited_tx: watch::Sender<bool>,
    stdout_task: Option<tokio::task::JoinHandle<()>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    sessions: Arc<RwLock<HashMap<u32, Session>>>,
    reap_grace: Duration,
) {
    let exit_info = match child.wait().await {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            tracing::error!(pid = session.pid, error = %e, "wait on child failed");
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };

    // Join the readers before publishing the exit so the buffer is complete
    // and frozen by the time anyone observes `exit_info`.
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    *session.exit_info.write() = Some(exit_info);
    let _ = exited_tx.send(true);
    tracing::info!(pid = session.pid, status = %exit_info, "command finished");

    tokio::time::sleep(reap_grace).await;
    sessions.write().remove(&session.pid);
    tracing::debug!(pid = session.pid, "session reaped");
}
