//! Auxiliary workload supervision.
//!
//! Agents can declare long-running side processes (dev servers, MCP
//! servers, tunnels). The supervisor starts them, captures their
//! output to log files, restarts them when they die, and gives up
//! cleanly when they keep dying.

use dashmap::DashMap;
use log::{info, warn};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    #[error("service '{0}' is not known")]
    NotFound(String),

    #[error("install step for '{name}' failed with {status}")]
    InstallFailed { name: String, status: String },

    #[error("failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of one supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    /// Stopped on request; will not restart.
    Stopped,
    /// Gave up: the process crashed immediately or exhausted its
    /// restart budget.
    Crashed,
}

/// Declaration of a supervised process.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique name, also used for the log file.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// One-shot setup command run before the first start, e.g.
    /// `npm install`. Its output goes to the same log file.
    pub install: Option<(String, Vec<String>)>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            install: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory for per-service log files.
    pub log_dir: PathBuf,
    /// A process exiting within this window after start is treated as
    /// crashed outright, with no restart attempts.
    pub settle: Duration,
    /// Sliding window for counting restarts.
    pub restart_window: Duration,
    /// Restarts allowed within the window before giving up.
    pub max_restarts: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir().join("aviary-services"),
            settle: Duration::from_secs(2),
            restart_window: Duration::from_secs(300),
            max_restarts: 3,
        }
    }
}

struct ServiceHandle {
    state_rx: watch::Receiver<ServiceState>,
    stop_tx: watch::Sender<bool>,
    monitor: JoinHandle<()>,
}

/// Starts, restarts, and stops declared services.
pub struct ServiceSupervisor {
    config: SupervisorConfig,
    services: DashMap<String, ServiceHandle>,
}

impl ServiceSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            services: DashMap::new(),
        }
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.config.log_dir.join(format!("{name}.log"))
    }

    /// Current state, if the service was ever started.
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).map(|h| *h.state_rx.borrow())
    }

    /// Watch state transitions for a service.
    pub fn watch(&self, name: &str) -> Option<watch::Receiver<ServiceState>> {
        self.services.get(name).map(|h| h.state_rx.clone())
    }

    /// Run the install step and launch the monitor loop.
    pub async fn start(&self, spec: ServiceSpec) -> Result<(), SupervisorError> {
        if let Some(handle) = self.services.get(&spec.name) {
            let state = *handle.state_rx.borrow();
            if matches!(state, ServiceState::Starting | ServiceState::Running) {
                return Err(SupervisorError::AlreadyRunning(spec.name.clone()));
            }
        }

        std::fs::create_dir_all(&self.config.log_dir)?;
        let log_path = self.log_path(&spec.name);

        if let Some((ref install_cmd, ref install_args)) = spec.install {
            self.run_install(&spec, install_cmd, install_args, &log_path)
                .await?;
        }

        let (state_tx, state_rx) = watch::channel(ServiceState::Starting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = tokio::spawn(monitor_loop(
            spec.clone(),
            self.config.clone(),
            log_path,
            state_tx,
            stop_rx,
        ));

        // A restarted service replaces its dead handle.
        if let Some(old) = self.services.insert(
            spec.name.clone(),
            ServiceHandle {
                state_rx,
                stop_tx,
                monitor,
            },
        ) {
            old.monitor.abort();
        }
        Ok(())
    }

    async fn run_install(
        &self,
        spec: &ServiceSpec,
        command: &str,
        args: &[String],
        log_path: &PathBuf,
    ) -> Result<(), SupervisorError> {
        info!("service {}: running install step '{command}'", spec.name);
        let log = open_log(log_path)?;
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(&spec.env)
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }
        let status = cmd
            .status()
            .await
            .map_err(|source| SupervisorError::Spawn {
                name: spec.name.clone(),
                source,
            })?;
        if !status.success() {
            return Err(SupervisorError::InstallFailed {
                name: spec.name.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    /// Request a service to stop and wait for its monitor to finish.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let monitor = {
            let handle = self
                .services
                .get(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            let _ = handle.stop_tx.send(true);
            drop(handle);
            self.services.remove(name)
        };
        if let Some((_, handle)) = monitor {
            let _ = handle.monitor.await;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(err) = self.stop(&name).await {
                warn!("stopping service {name}: {err}");
            }
        }
    }
}

fn open_log(path: &PathBuf) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

async fn monitor_loop(
    spec: ServiceSpec,
    config: SupervisorConfig,
    log_path: PathBuf,
    state_tx: watch::Sender<ServiceState>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    loop {
        let log = match open_log(&log_path).and_then(|f| Ok((f.try_clone()?, f))) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("service {}: cannot open log: {err}", spec.name);
                let _ = state_tx.send(ServiceState::Crashed);
                return;
            }
        };

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.0))
            .stderr(Stdio::from(log.1))
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!("service {}: spawn failed: {err}", spec.name);
                let _ = state_tx.send(ServiceState::Crashed);
                return;
            }
        };
        let started_at = Instant::now();
        let _ = state_tx.send(ServiceState::Running);
        info!("service {} started (pid {:?})", spec.name, child.id());

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop_rx.changed() => None,
        };

        let Some(status) = exited else {
            // Stop requested.
            let _ = child.kill().await;
            let _ = child.wait().await;
            let _ = state_tx.send(ServiceState::Stopped);
            info!("service {} stopped", spec.name);
            return;
        };

        let lived = started_at.elapsed();
        let clean_exit = match status {
            Ok(status) if status.success() => {
                info!("service {} finished after {lived:?}", spec.name);
                true
            }
            Ok(status) => {
                warn!(
                    "service {} exited with {status} after {lived:?}",
                    spec.name
                );
                false
            }
            Err(ref err) => {
                warn!("service {}: wait failed: {err}", spec.name);
                false
            }
        };

        // A zero exit is the service finishing on its own terms, not
        // a crash; only failures are restarted.
        if clean_exit {
            let _ = state_tx.send(ServiceState::Stopped);
            return;
        }

        // Failing before the settle window means the command is
        // broken; restarting would just loop.
        if lived < config.settle {
            let _ = state_tx.send(ServiceState::Crashed);
            return;
        }

        let now = Instant::now();
        restarts.push_back(now);
        while let Some(&front) = restarts.front() {
            if now.duration_since(front) > config.restart_window {
                restarts.pop_front();
            } else {
                break;
            }
        }
        if restarts.len() > config.max_restarts {
            warn!(
                "service {}: {} restarts within {:?}, giving up",
                spec.name,
                restarts.len(),
                config.restart_window
            );
            let _ = state_tx.send(ServiceState::Crashed);
            return;
        }
        info!("service {}: restarting", spec.name);
    }
}
