//! Process lifecycle: start, attach, stop, force-stop.
//!
//! One logical endpoint - one serving process. The lock record is the source
//! of truth for who owns a port; health probes decide whether an already
//! running server can be attached to instead of spawning a new one. Stops
//! are cooperative first (HTTP shutdown with a short bound) and only
//! escalate to process termination when the peer does not drain, or when the
//! caller explicitly asks for a forced stop.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::logsink::LogSink;
use crate::platform::{is_process_alive, terminate_process};
use crate::portlock::{LockRecord, PortLocker};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};

/// Per-endpoint lifecycle state machine.
///
/// `Stopped` is equivalent to `NotRunning` for any future transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    NotRunning,
    Starting,
    Running,
    StoppingGraceful,
    StoppingForced,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::NotRunning => "not-running",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::StoppingGraceful => "stopping-graceful",
            LifecycleState::StoppingForced => "stopping-forced",
            LifecycleState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Result of `start_or_attach`.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub port: u16,
    /// True when an already-running healthy server was reused.
    pub attached: bool,
    pub message: String,
}

/// Result of `stop_by_lock` / `force_stop_by_port`.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub stopped: bool,
    /// Forced stops are always reported distinctly from graceful ones.
    pub forced: bool,
    pub message: String,
}

/// Reachability plus lock-record readout for one port.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub port: u16,
    pub reachable: bool,
    pub lock: Option<LockRecord>,
}

/// Starts, attaches to, and stops serving processes for one logical endpoint.
pub struct LifecycleManager {
    locker: PortLocker,
    server_binary: PathBuf,
    client: reqwest::Client,
    state: Mutex<LifecycleState>,
    log: Option<Arc<LogSink>>,
}

impl LifecycleManager {
    pub fn new(locker: PortLocker, server_binary: impl Into<PathBuf>) -> Self {
        Self {
            locker,
            server_binary: server_binary.into(),
            client: reqwest::Client::new(),
            state: Mutex::new(LifecycleState::NotRunning),
            log: None,
        }
    }

    /// Record lifecycle transitions in a per-port log as well as tracing.
    pub fn with_log_sink(mut self, sink: Arc<LogSink>) -> Self {
        self.log = Some(sink);
        self
    }

    /// Default server binary location: `maquette-rpc` next to the current
    /// executable.
    pub fn default_server_binary() -> PathBuf {
        let name = if cfg!(windows) {
            "maquette-rpc.exe"
        } else {
            "maquette-rpc"
        };
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure a healthy server is running, reusing one when possible.
    ///
    /// `owner_pid` is recorded as the controller identity so later stop
    /// requests can be authorized. Spawn or claim failures come back
    /// verbatim; there is no silent retry loop here.
    pub async fn start_or_attach(&self, owner_pid: u32, preferred_port: u16) -> Result<StartOutcome> {
        let removed = self.locker.cleanup_stale_locks();
        if removed > 0 {
            debug!("Removed {} stale lock record(s) before start", removed);
        }

        // Attach path: a healthy responder keeps the state machine in
        // Running via the self-loop, no new process.
        if let Some(port) = self.find_healthy_server(preferred_port).await {
            self.transition(LifecycleState::Running);
            let message = format!("attached to running server on port {}", port);
            info!("{}", message);
            return Ok(StartOutcome {
                port,
                attached: true,
                message,
            });
        }

        self.transition(LifecycleState::Starting);
        match self.spawn_server(owner_pid, preferred_port).await {
            Ok(outcome) => {
                self.transition(LifecycleState::Running);
                info!("{}", outcome.message);
                Ok(outcome)
            }
            Err(err) => {
                self.transition(LifecycleState::NotRunning);
                warn!("Server start failed: {}", err);
                Err(err)
            }
        }
    }

    /// Stop the server on `port` if - and only if - `caller_pid` matches the
    /// recorded owner.
    ///
    /// A missing record is reported (not an error) so the caller can fall
    /// back to a cooperative HTTP shutdown of whatever is listening; an
    /// owner mismatch is `NotOwner` and nothing is touched.
    pub async fn stop_by_lock(&self, caller_pid: u32, port: u16) -> Result<StopOutcome> {
        let Some(record) = self.locker.read_lock_record(port) else {
            return Ok(StopOutcome {
                stopped: false,
                forced: false,
                message: format!(
                    "skip stop: no lock record for port {}; a cooperative shutdown request may still reach it",
                    port
                ),
            });
        };

        if record.owner_pid != caller_pid {
            return Err(BridgeError::NotOwner {
                port,
                owner_pid: record.owner_pid,
                caller_pid,
            });
        }

        self.transition(LifecycleState::StoppingGraceful);
        self.request_shutdown(port).await;

        if !self.wait_for_exit(record.server_pid, BridgeConfig::STOP_WAIT_TIMEOUT).await {
            debug!(
                "Server pid {} ignored the shutdown request, terminating",
                record.server_pid
            );
            terminate_process(record.server_pid, BridgeConfig::TERMINATE_TIMEOUT_MS)?;
        }

        self.locker.release(port);
        self.transition(LifecycleState::Stopped);
        Ok(StopOutcome {
            stopped: true,
            forced: false,
            message: format!(
                "stopped server pid {} on port {} gracefully",
                record.server_pid, port
            ),
        })
    }

    /// Terminate whatever the lock record for `port` names, regardless of
    /// ownership. Last resort; the caller must have confirmed this
    /// separately, which is why it is a distinct entry point with distinct
    /// messaging.
    pub async fn force_stop_by_port(&self, port: u16) -> Result<StopOutcome> {
        let Some(record) = self.locker.read_lock_record(port) else {
            return Ok(StopOutcome {
                stopped: false,
                forced: true,
                message: format!("skip force-stop: no lock record for port {}", port),
            });
        };

        self.transition(LifecycleState::StoppingForced);
        terminate_process(record.server_pid, BridgeConfig::TERMINATE_TIMEOUT_MS)?;
        self.locker.release(port);
        self.transition(LifecycleState::Stopped);
        Ok(StopOutcome {
            stopped: true,
            forced: true,
            message: format!(
                "force-stopped server pid {} on port {}",
                record.server_pid, port
            ),
        })
    }

    /// Health probe plus lock-record readout, for status surfaces.
    pub async fn status(&self, port: u16) -> BridgeStatus {
        BridgeStatus {
            port,
            reachable: self.probe_health(port).await,
            lock: self.locker.read_lock_record(port),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Preferred port first, then every live lock record's port.
    async fn find_healthy_server(&self, preferred_port: u16) -> Option<u16> {
        if preferred_port > 0 && self.probe_health(preferred_port).await {
            return Some(preferred_port);
        }
        for record in self.locker.lock_records() {
            if record.port == preferred_port || !is_process_alive(record.server_pid) {
                continue;
            }
            if self.probe_health(record.port).await {
                return Some(record.port);
            }
        }
        None
    }

    async fn spawn_server(&self, owner_pid: u32, preferred_port: u16) -> Result<StartOutcome> {
        let mut child = tokio::process::Command::new(&self.server_binary)
            .arg("--port")
            .arg(preferred_port.to_string())
            .arg("--owner-pid")
            .arg(owner_pid.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                BridgeError::Other(format!(
                    "Failed to spawn {}: {}",
                    self.server_binary.display(),
                    e
                ))
            })?;

        let server_pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::Other("Failed to capture server stdout".into())
        })?;
        let mut lines = tokio::io::BufReader::new(stdout).lines();

        // The server prints RPC_PORT=<port> once its claim is held; that is
        // the only parent/child handshake there is.
        let port = tokio::time::timeout(BridgeConfig::SERVER_START_TIMEOUT, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    if let Ok(port) = value.trim().parse::<u16>() {
                        return Some(port);
                    }
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        // Keep draining stdout so the server never blocks on a full pipe,
        // and reap the child when it exits.
        tokio::spawn(async move {
            while let Ok(Some(_)) = lines.next_line().await {}
            let _ = child.wait().await;
        });

        let Some(port) = port else {
            return Err(BridgeError::Other(format!(
                "Server process {} did not report a port claim within {:?}",
                server_pid,
                BridgeConfig::SERVER_START_TIMEOUT
            )));
        };

        if !self
            .wait_for_health(port, BridgeConfig::SERVER_START_TIMEOUT)
            .await
        {
            return Err(BridgeError::Timeout(BridgeConfig::SERVER_START_TIMEOUT));
        }

        Ok(StartOutcome {
            port,
            attached: false,
            message: format!("started server pid {} on port {}", server_pid, port),
        })
    }

    async fn probe_health(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/health", port);
        match self
            .client
            .get(&url)
            .timeout(BridgeConfig::HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => match response.json::<serde_json::Value>().await {
                Ok(body) => body.get("ok").and_then(|v| v.as_bool()) == Some(true),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    async fn wait_for_health(&self, port: u16, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.probe_health(port).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    /// Best-effort cooperative shutdown request; a dead or wedged peer just
    /// means the short timeout elapses.
    async fn request_shutdown(&self, port: u16) {
        let url = format!("http://127.0.0.1:{}/shutdown", port);
        let _ = self
            .client
            .post(&url)
            .timeout(BridgeConfig::SHUTDOWN_REQUEST_TIMEOUT)
            .send()
            .await;
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !is_process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        !is_process_alive(pid)
    }

    fn transition(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!("Lifecycle transition {} -> {}", state, next);
            if let Some(sink) = &self.log {
                sink.append(&format!("lifecycle {} -> {}", state, next));
            }
            *state = next;
        }
    }
}
