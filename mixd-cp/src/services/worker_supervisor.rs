//! Extraction worker supervisor
//!
//! Child-process lifecycle for a colocated worker: spawn with stdin closed
//! and stdout/stderr appended to a log file under header markers, poll the
//! health endpoint until ready, restart on abnormal exit with a windowed
//! rate limit, SIGTERM on stop with a SIGKILL fallback.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use mixd_common::{EventBus, MixdEvent};

const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WorkerSupervisorConfig {
    pub executable: String,
    pub working_dir: Option<PathBuf>,
    pub args: Vec<String>,
    /// Worker health endpoint polled for readiness and liveness
    pub health_url: String,
    pub log_path: PathBuf,
    pub startup_timeout: Duration,
    pub autorestart: bool,
    pub max_restarts: u32,
    /// A quiet run of this length resets the restart counter
    pub restart_window: Duration,
    pub monitor_interval: Duration,
    /// SIGTERM grace before SIGKILL
    pub stop_grace: Duration,
}

impl WorkerSupervisorConfig {
    pub fn from_control_plane(config: &crate::config::ControlPlaneConfig) -> Option<Self> {
        let executable = config.worker_executable.clone()?;
        Some(Self {
            executable,
            working_dir: config.worker_working_dir.clone(),
            args: Vec::new(),
            health_url: format!(
                "{}/health",
                config.worker_server_url.trim_end_matches('/')
            ),
            log_path: config
                .worker_log_path
                .clone()
                .unwrap_or_else(|| mixd_common::config::default_data_dir().join("worker.log")),
            startup_timeout: Duration::from_millis(config.worker_startup_timeout_ms),
            autorestart: config.worker_autorestart,
            max_restarts: config.worker_max_restarts,
            restart_window: Duration::from_millis(config.worker_restart_window_ms),
            monitor_interval: Duration::from_millis(config.worker_monitor_interval_ms),
            stop_grace: Duration::from_secs(5),
        })
    }
}

/// Supervisor view of the worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running { pid: u32 },
    /// Crash-looped past the restart cap, or failed to spawn
    Failed { reason: String },
}

struct Inner {
    status: WorkerStatus,
    pid: Option<u32>,
    /// True between start() and stop(); an exit while true is a crash
    expected_running: bool,
    restarts: u32,
    window_start: Option<Instant>,
    stop_token: Option<CancellationToken>,
}

/// Supervises the colocated extraction worker subprocess.
///
/// Cheap to clone; clones share the same process state.
#[derive(Clone)]
pub struct WorkerSupervisor {
    config: Arc<WorkerSupervisorConfig>,
    http: reqwest::Client,
    events: EventBus,
    inner: Arc<RwLock<Inner>>,
}

impl WorkerSupervisor {
    pub fn new(config: WorkerSupervisorConfig, events: EventBus) -> Self {
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
            events,
            inner: Arc::new(RwLock::new(Inner {
                status: WorkerStatus::Stopped,
                pid: None,
                expected_running: false,
                restarts: 0,
                window_start: None,
                stop_token: None,
            })),
        }
    }

    pub async fn status(&self) -> WorkerStatus {
        self.inner.read().await.status.clone()
    }

    /// Spawn the worker and wait for its health endpoint to come up
    pub async fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.expected_running {
                anyhow::bail!("worker already running");
            }
            inner.expected_running = true;
            inner.status = WorkerStatus::Starting;
            inner.restarts = 0;
            inner.window_start = None;
        }

        if let Err(e) = self.spawn_child().await {
            let mut inner = self.inner.write().await;
            inner.expected_running = false;
            inner.status = WorkerStatus::Failed {
                reason: e.to_string(),
            };
            return Err(e);
        }

        if !self.wait_ready().await {
            tracing::warn!(
                timeout_ms = self.config.startup_timeout.as_millis() as u64,
                "Worker did not become ready within the startup timeout"
            );
        }
        Ok(())
    }

    /// SIGTERM the worker; SIGKILL after the grace period
    pub async fn stop(&self) {
        let token = {
            let mut inner = self.inner.write().await;
            inner.expected_running = false;
            inner.stop_token.take()
        };
        let Some(token) = token else {
            return;
        };
        token.cancel();

        // The watch task owns the child; wait for it to report the exit.
        let deadline = Instant::now() + self.config.stop_grace + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.inner.read().await.pid.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::warn!("Worker did not confirm exit in time");
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    /// Long-interval liveness monitor. A dead process where one is expected
    /// goes through the same crash-restart path as a caught exit.
    pub fn spawn_monitor(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }

                let (expected, pid) = {
                    let inner = supervisor.inner.read().await;
                    (inner.expected_running, inner.pid)
                };
                if !expected {
                    continue;
                }

                if pid.is_none() {
                    tracing::warn!("Health monitor found a dead worker where one was expected");
                    supervisor.crash_restart("found dead by health monitor").await;
                } else if !supervisor.probe_health().await {
                    tracing::debug!("Worker health probe failed (process still alive)");
                }
            }
        })
    }

    async fn probe_health(&self) -> bool {
        match self
            .http
            .get(&self.config.health_url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn wait_ready(&self) -> bool {
        let deadline = Instant::now() + self.config.startup_timeout;
        while Instant::now() < deadline {
            if self.probe_health().await {
                tracing::info!("Worker ready");
                return true;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        false
    }

    fn spawn_child(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.spawn_child_inner())
    }

    async fn spawn_child_inner(&self) -> Result<()> {
        if let Some(parent) = self.config.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.log_path)
            .await
            .with_context(|| format!("opening worker log {}", self.config.log_path.display()))?;
        log.write_all(
            format!(
                "\n===== worker start {} =====\n",
                mixd_common::time::format_sqlite(&mixd_common::time::now())
            )
            .as_bytes(),
        )
        .await?;
        log.flush().await?;
        let log = log.into_std().await;
        let stderr_log = log.try_clone()?;

        let mut command = tokio::process::Command::new(&self.config.executable);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log));
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawning worker {:?}", self.config.executable))?;
        let pid = child.id().unwrap_or(0);

        let stop_token = CancellationToken::new();
        {
            let mut inner = self.inner.write().await;
            inner.pid = Some(pid);
            inner.status = WorkerStatus::Running { pid };
            inner.stop_token = Some(stop_token.clone());
        }

        self.events.emit_lossy(MixdEvent::WorkerStarted {
            pid,
            timestamp: mixd_common::time::now(),
        });
        tracing::info!(pid, executable = %self.config.executable, "Worker spawned");

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.watch(child, stop_token).await;
        });
        Ok(())
    }

    /// Owns the child until it exits or a stop is requested
    async fn watch(self, mut child: tokio::process::Child, stop_token: CancellationToken) {
        tokio::select! {
            status = child.wait() => {
                self.handle_exit(status).await;
            }
            _ = stop_token.cancelled() => {
                self.terminate(child).await;
            }
        }
    }

    async fn terminate(&self, mut child: tokio::process::Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SIGTERM first; SIGKILL only if the grace period runs out
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(status) => {
                tracing::info!(status = ?status.ok(), "Worker exited after SIGTERM");
            }
            Err(_) => {
                tracing::warn!("Worker ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }

        let mut inner = self.inner.write().await;
        inner.pid = None;
        inner.status = WorkerStatus::Stopped;
        inner.stop_token = None;
    }

    async fn handle_exit(&self, status: std::io::Result<std::process::ExitStatus>) {
        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        let clean_exit = exit_code == Some(0);

        let expected = {
            let mut inner = self.inner.write().await;
            inner.pid = None;
            inner.stop_token = None;
            let expected = inner.expected_running;
            if !expected || clean_exit {
                inner.status = WorkerStatus::Stopped;
                inner.expected_running = false;
            }
            expected
        };

        let will_restart = expected && !clean_exit && self.config.autorestart;
        self.events.emit_lossy(MixdEvent::WorkerExited {
            exit_code,
            will_restart,
            timestamp: mixd_common::time::now(),
        });

        if !expected || clean_exit {
            tracing::info!(exit_code, "Worker exited");
            return;
        }
        if !self.config.autorestart {
            tracing::error!(exit_code, "Worker crashed; autorestart disabled");
            let mut inner = self.inner.write().await;
            inner.expected_running = false;
            inner.status = WorkerStatus::Failed {
                reason: format!("crashed with exit code {:?}", exit_code),
            };
            return;
        }

        tracing::error!(exit_code, "Worker crashed");
        self.crash_restart(&format!("exit code {:?}", exit_code)).await;
    }

    /// Windowed crash-restart: the counter resets after a quiet window and
    /// is hard-capped to keep a broken worker from tight-looping.
    async fn crash_restart(&self, reason: &str) {
        let attempt = {
            let mut inner = self.inner.write().await;
            if !inner.expected_running {
                return;
            }
            let now = Instant::now();
            let window_expired = inner
                .window_start
                .map_or(true, |start| now.duration_since(start) > self.config.restart_window);
            if window_expired {
                inner.window_start = Some(now);
                inner.restarts = 0;
            }
            inner.restarts += 1;

            if inner.restarts > self.config.max_restarts {
                tracing::error!(
                    restarts = inner.restarts - 1,
                    "Worker restart cap reached; giving up"
                );
                inner.expected_running = false;
                inner.status = WorkerStatus::Failed {
                    reason: format!("restart cap reached ({})", reason),
                };
                return;
            }
            inner.status = WorkerStatus::Starting;
            inner.restarts
        };

        let backoff = (RESTART_BACKOFF_BASE * 2_u32.pow(attempt.saturating_sub(1).min(8)))
            .min(RESTART_BACKOFF_CAP);
        tracing::info!(
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            reason,
            "Restarting worker after back-off"
        );
        tokio::time::sleep(backoff).await;

        if !self.inner.read().await.expected_running {
            return;
        }
        if let Err(e) = self.spawn_child().await {
            tracing::error!(error = %e, "Worker respawn failed");
            let mut inner = self.inner.write().await;
            inner.expected_running = false;
            inner.status = WorkerStatus::Failed {
                reason: e.to_string(),
            };
        } else {
            self.wait_ready().await;
        }
    }
}
