//! Backend process supervision.
//!
//! The supervisor is the only owner of the backend child process and of its
//! [`BackendProcessState`]. Every transition happens while holding a single
//! mutex, so at most one backend instance exists at a time. Requests that
//! find the backend unhealthy coalesce on one re-probe: a caller that waited
//! on the lock while another caller's probe completed reuses that outcome.
//!
//! ## States
//!
//! ```text
//! NotStarted → Starting → Ready ⇄ Degraded
//!                  │                  │
//!                  └──────────────────┴──→ Terminated
//! ```
//!
//! - **Ready → Degraded**: forward failures reach the configured threshold,
//!   or a probe fails.
//! - **Degraded → Ready**: a later probe succeeds.
//! - **→ Terminated**: explicit shutdown, spawn failure at startup, or the
//!   respawn budget is exhausted.
//!
//! The child is spawned with `kill_on_drop`, so dropping the supervisor on
//! any exit path never leaves the backend running.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::error::BackendError;

/// Lifecycle of the supervised backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendProcessState {
    /// No process spawned yet
    NotStarted,
    /// Process spawned, readiness not yet confirmed
    Starting,
    /// Accepting connections
    Ready,
    /// Spawned but failing probes or forwards
    Degraded,
    /// Stopped for good; no further respawns
    Terminated,
}

impl fmt::Display for BackendProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Identity of a spawned backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// OS process id, `None` once the process has been reaped
    pub pid: Option<u32>,
    /// Program name (first element of the command)
    pub program: String,
    /// `host:port` the backend was told to bind
    pub authority: String,
}

/// Expand `{host}` and `{port}` placeholders in a backend command.
pub fn expand_command(command: &[String], host: &str, port: u16) -> Vec<String> {
    let port = port.to_string();
    command
        .iter()
        .map(|arg| arg.replace("{host}", host).replace("{port}", &port))
        .collect()
}

/// Spawn the backend bound to `host:port`.
///
/// The bind address is passed through argument placeholders and through the
/// `AUTHGATE_BACKEND_HOST` / `AUTHGATE_BACKEND_PORT` environment variables.
pub fn spawn_backend(command: &[String], host: &str, port: u16) -> Result<Child, BackendError> {
    let argv = expand_command(command, host, port);
    let (program, args) = argv.split_first().ok_or_else(|| BackendError::SpawnFailed {
        program: String::new(),
        reason: "empty command".to_string(),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("AUTHGATE_BACKEND_HOST", host)
        .env("AUTHGATE_BACKEND_PORT", port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // Own process group so shutdown signals reach the backend's children too.
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    cmd.spawn().map_err(|e| BackendError::SpawnFailed {
        program: program.clone(),
        reason: e.to_string(),
    })
}

struct SupervisorInner {
    child: Option<Child>,
    spawned_at: Option<Instant>,
    /// Respawns performed over the supervisor's lifetime
    respawns: u32,
    /// Consecutive forward failures since the last success
    forward_failures: u32,
    /// Consecutive failed re-probes of a live process
    failed_reprobes: u32,
    /// When the last readiness probe finished
    last_probe_at: Option<Instant>,
}

/// Owns the backend process and its state.
pub struct ProcessSupervisor {
    config: BackendConfig,
    inner: Mutex<SupervisorInner>,
    state_tx: watch::Sender<BackendProcessState>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("authority", &self.config.authority())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(config: BackendConfig) -> Self {
        let (state_tx, _) = watch::channel(BackendProcessState::NotStarted);
        Self {
            config,
            inner: Mutex::new(SupervisorInner {
                child: None,
                spawned_at: None,
                respawns: 0,
                forward_failures: 0,
                failed_reprobes: 0,
                last_probe_at: None,
            }),
            state_tx,
        }
    }

    /// Current state. Lock-free snapshot; may be stale by the time it is used.
    pub fn state(&self) -> BackendProcessState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<BackendProcessState> {
        self.state_tx.subscribe()
    }

    /// Backend settings this supervisor was created with.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// OS process id of the current backend, if one is running.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.child.as_ref().and_then(Child::id)
    }

    /// Spawn the backend.
    ///
    /// Calling `start` while a process is already owned returns its handle
    /// instead of spawning a second instance. A spawn failure moves the
    /// supervisor to `Terminated`.
    pub async fn start(&self) -> Result<ProcessHandle, BackendError> {
        let mut inner = self.inner.lock().await;

        if let Some(child) = inner.child.as_ref() {
            return Ok(self.handle(child));
        }
        if self.state() == BackendProcessState::Terminated {
            return Err(BackendError::NotReady);
        }

        match self.spawn_locked(&mut inner) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.transition(BackendProcessState::Terminated);
                Err(e)
            }
        }
    }

    /// Poll the backend's port until it accepts a connection.
    ///
    /// Returns `true` on the first successful connection and `false` once
    /// `timeout` elapses or the process exits. Success moves the state to
    /// `Ready`; failure moves a starting or ready backend to `Degraded`.
    pub async fn probe_ready(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        match self.state() {
            BackendProcessState::NotStarted | BackendProcessState::Terminated => false,
            _ => self.probe_locked(&mut inner, timeout).await,
        }
    }

    /// Make sure the backend can take a forwarded request.
    ///
    /// `Ready` returns immediately. A starting or degraded backend gets one
    /// bounded re-probe, preceded by a respawn if the process has exited and
    /// the respawn budget allows it. A live process that keeps failing
    /// re-probes past its startup window is restarted under the same budget.
    pub async fn ensure_ready(&self) -> Result<(), BackendError> {
        if self.state() == BackendProcessState::Ready {
            return Ok(());
        }

        let requested_at = Instant::now();
        let mut inner = self.inner.lock().await;
        match self.state() {
            BackendProcessState::Ready => return Ok(()),
            BackendProcessState::NotStarted | BackendProcessState::Terminated => {
                return Err(BackendError::NotReady);
            }
            BackendProcessState::Starting | BackendProcessState::Degraded => {}
        }

        // Another caller probed while this one waited for the lock and the
        // backend is still not ready.
        if inner.last_probe_at.is_some_and(|t| t >= requested_at) {
            return Err(BackendError::NotReady);
        }

        if let Some(status) = exit_status(&mut inner) {
            warn!(status = %status, "Backend process has exited");
            self.respawn_locked(&mut inner).await?;
        }

        if self.probe_locked(&mut inner, self.config.reprobe_timeout).await {
            return Ok(());
        }

        let past_startup = inner
            .spawned_at
            .is_some_and(|t| t.elapsed() >= self.config.startup_timeout);
        if past_startup && exit_status(&mut inner).is_none() {
            inner.failed_reprobes += 1;
            if inner.failed_reprobes >= self.config.unresponsive_budget {
                warn!(
                    failed_reprobes = inner.failed_reprobes,
                    "Backend unresponsive beyond retry budget, restarting"
                );
                self.stop_locked(&mut inner).await;
                // The new process is probed by the next request.
                if let Err(e) = self.respawn_locked(&mut inner).await {
                    debug!(error = %e, "Restart of unresponsive backend not possible");
                }
            }
        }

        Err(BackendError::NotReady)
    }

    /// Record a failed forward. Degrades a ready backend once the
    /// consecutive failure count reaches the threshold.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.forward_failures = inner.forward_failures.saturating_add(1);
        if self.state() == BackendProcessState::Ready
            && inner.forward_failures >= self.config.failure_threshold
        {
            warn!(
                consecutive_failures = inner.forward_failures,
                "Backend marked degraded after forward failures"
            );
            self.transition(BackendProcessState::Degraded);
        }
    }

    /// Record a successful forward.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.forward_failures = 0;
    }

    /// Stop the backend for good.
    ///
    /// Sends SIGTERM to the backend's process group, waits `stop_grace`, then
    /// kills it. The child is always reaped. Idempotent.
    pub async fn terminate(&self) {
        let mut inner = self.inner.lock().await;
        if self.state() == BackendProcessState::Terminated && inner.child.is_none() {
            return;
        }
        self.stop_locked(&mut inner).await;
        self.transition(BackendProcessState::Terminated);
    }

    fn handle(&self, child: &Child) -> ProcessHandle {
        ProcessHandle {
            pid: child.id(),
            program: self.config.command.first().cloned().unwrap_or_default(),
            authority: self.config.authority(),
        }
    }

    fn transition(&self, to: BackendProcessState) {
        let from = self.state_tx.send_replace(to);
        if from != to {
            info!(from = %from, to = %to, "Backend state transition");
        }
    }

    fn spawn_locked(&self, inner: &mut SupervisorInner) -> Result<ProcessHandle, BackendError> {
        self.transition(BackendProcessState::Starting);
        let child = spawn_backend(&self.config.command, &self.config.host, self.config.port)?;
        let handle = self.handle(&child);
        info!(
            pid = ?handle.pid,
            program = %handle.program,
            authority = %handle.authority,
            "Backend process spawned"
        );
        inner.child = Some(child);
        inner.spawned_at = Some(Instant::now());
        inner.forward_failures = 0;
        inner.failed_reprobes = 0;
        Ok(handle)
    }

    async fn respawn_locked(&self, inner: &mut SupervisorInner) -> Result<(), BackendError> {
        inner.child = None;
        if inner.respawns >= self.config.max_respawns {
            error!(
                max_respawns = self.config.max_respawns,
                "Backend respawn budget exhausted"
            );
            self.transition(BackendProcessState::Terminated);
            return Err(BackendError::NotReady);
        }
        inner.respawns += 1;
        info!(
            attempt = inner.respawns,
            max_respawns = self.config.max_respawns,
            "Respawning backend"
        );
        match self.spawn_locked(inner) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(error = %e, "Backend respawn failed");
                self.transition(BackendProcessState::Degraded);
                Err(BackendError::NotReady)
            }
        }
    }

    async fn probe_locked(&self, inner: &mut SupervisorInner, limit: Duration) -> bool {
        let authority = self.config.authority();
        let deadline = Instant::now() + limit;
        let mut attempts = 0u32;

        let ready = loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt_timeout = remaining.min(self.config.probe_interval).max(Duration::from_millis(1));
            if let Ok(Ok(_)) = timeout(attempt_timeout, TcpStream::connect(&authority)).await {
                break true;
            }
            if let Some(status) = exit_status(inner) {
                debug!(status = %status, "Backend exited during probe");
                break false;
            }
            if Instant::now() >= deadline {
                break false;
            }
            sleep(self.config.probe_interval.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        };
        inner.last_probe_at = Some(Instant::now());

        if ready {
            debug!(attempts, authority = %authority, "Backend readiness probe succeeded");
            inner.forward_failures = 0;
            inner.failed_reprobes = 0;
            self.transition(BackendProcessState::Ready);
        } else {
            warn!(attempts, timeout = ?limit, "Backend readiness probe failed");
            if matches!(
                self.state(),
                BackendProcessState::Starting | BackendProcessState::Ready
            ) {
                self.transition(BackendProcessState::Degraded);
            }
        }
        ready
    }

    async fn stop_locked(&self, inner: &mut SupervisorInner) {
        let Some(mut child) = inner.child.take() else {
            return;
        };
        inner.spawned_at = None;

        if let Ok(Some(status)) = child.try_wait() {
            info!(status = %status, "Backend already exited");
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                info!(pid, "Sending SIGTERM to backend process group");
                if let Err(e) = signal_group(pid, nix::sys::signal::Signal::SIGTERM) {
                    warn!(pid, error = ?e, "killpg SIGTERM failed");
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to signal backend");
            }
        }

        match timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(status = %status, "Backend exited after SIGTERM");
                return;
            }
            Ok(Err(e)) => error!(error = %e, "Waiting for backend failed"),
            Err(_) => warn!(grace = ?self.config.stop_grace, "Backend ignored SIGTERM, killing"),
        }

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let _ = signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
        if let Err(e) = child.kill().await {
            error!(error = %e, "Failed to kill backend");
        }
        match child.wait().await {
            Ok(status) => info!(status = %status, "Backend killed"),
            Err(e) => error!(error = %e, "Failed to reap backend"),
        }
    }
}

/// Signal the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| nix::errno::Errno::ESRCH)?;
    nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid), signal)
}

/// Exit status of the owned child, if it has exited.
fn exit_status(inner: &mut SupervisorInner) -> Option<ExitStatus> {
    match inner.child.as_mut()?.try_wait() {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "Failed to query backend status");
            None
        }
    }
}
