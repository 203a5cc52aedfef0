//! Agent subprocess lifecycle.
//!
//! [`AgentProcess`] wraps one spawned agent CLI: piped stdio, a stdout
//! reader task that parses each line into an
//! [`AgentEvent`](aviary_protocol::AgentEvent) and broadcasts it, and a
//! stderr reader that forwards diagnostics to the log. A malformed
//! stdout line is logged and dropped; it never kills the stream.
//!
//! The first `system/init` event carries the canonical session id the
//! agent assigned; [`AgentProcess::spawn`] hands the caller a oneshot
//! receiver that resolves with it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, oneshot};

use aviary_protocol::{AgentEvent, AgentInput};

/// Burst capacity for the per-process event channel. Subscribers that
/// fall behind see `Lagged(n)` and must resync from the event log.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("agent process exited during startup (status {status})")]
    EarlyExit { status: i32 },

    #[error("agent process is not running")]
    NotRunning,

    #[error("failed to write to agent stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("failed to serialize input line: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How to spawn one agent process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Path to the agent CLI binary.
    pub binary: PathBuf,
    /// Working directory for the process.
    pub cwd: PathBuf,
    /// Extra environment passed to the process.
    pub env: HashMap<String, String>,
    /// Canonical session id to resume (`--resume`). Mutually exclusive
    /// with `session_id`.
    pub resume: Option<String>,
    /// Session id for a brand-new session (`--session-id`).
    pub session_id: Option<String>,
    /// How long after spawn an early exit still counts as a startup
    /// failure.
    pub readiness_window: Duration,
    /// Grace period between the polite stop signal and a hard kill.
    pub stop_grace: Duration,
}

impl ProcessConfig {
    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--verbose".into(),
            "--input-format".into(),
            "stream-json".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--include-partial-messages".into(),
        ];
        if let Some(ref id) = self.resume {
            args.push("--resume".into());
            args.push(id.clone());
        } else if let Some(ref id) = self.session_id {
            args.push("--session-id".into());
            args.push(id.clone());
        }
        args
    }
}

/// Answers "does this session still have a live process" out of band,
/// used to disambiguate a `connection_closed` event (transport hiccup
/// vs. process death).
#[async_trait::async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn is_alive(&self, session_id: &str) -> bool;
}

/// One running agent CLI process.
pub struct AgentProcess {
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    event_tx: broadcast::Sender<AgentEvent>,
    stop_grace: Duration,
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl AgentProcess {
    /// Spawn the agent and start the reader tasks.
    ///
    /// Returns the process plus a oneshot receiver resolving with the
    /// canonical session id from the first `system/init` event. Fails
    /// if the spawn fails or the child exits within the readiness
    /// window.
    pub async fn spawn(
        config: ProcessConfig,
    ) -> Result<(Arc<Self>, oneshot::Receiver<String>), ProcessError> {
        let mut cmd = Command::new(&config.binary);
        cmd.args(config.args());
        cmd.current_dir(&config.cwd);
        cmd.envs(&config.env);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
        let pid = child.id().unwrap_or(0);
        debug!("spawned agent process pid={pid} args={:?}", config.args());

        // An agent that dies this quickly never produced a usable
        // stream; surface it as a startup failure instead of an EOF.
        tokio::time::sleep(config.readiness_window).await;
        if let Some(status) = child.try_wait()? {
            let code = status.code().unwrap_or(-1);
            warn!("agent process pid={pid} exited during startup with status {code}");
            return Err(ProcessError::EarlyExit { status: code });
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::Spawn(std::io::Error::other("stdin not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::Spawn(std::io::Error::other("stdout not piped")))?;
        let stderr = child.stderr.take();

        let (event_tx, _) = broadcast::channel::<AgentEvent>(EVENT_CHANNEL_CAPACITY);
        let (init_tx, init_rx) = oneshot::channel::<String>();

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!("agent[{pid}] stderr: {line}");
                    }
                }
            });
        }

        let reader_handle = {
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                Self::stdout_reader_task(pid, stdout, event_tx, init_tx).await;
            })
        };

        let process = Arc::new(Self {
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            event_tx,
            stop_grace: config.stop_grace,
            _reader_handle: reader_handle,
        });

        info!("agent process pid={pid} ready");
        Ok((process, init_rx))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Subscribe to the parsed event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the child is still running.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// Write one input line to the agent's stdin.
    pub async fn send(&self, input: &AgentInput) -> Result<(), ProcessError> {
        if !self.is_alive().await {
            return Err(ProcessError::NotRunning);
        }
        let mut line = serde_json::to_string(input)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(ProcessError::Stdin)?;
        stdin.flush().await.map_err(ProcessError::Stdin)?;
        Ok(())
    }

    /// Ask the agent to abort the current turn.
    pub async fn interrupt(&self) -> Result<(), ProcessError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.send(&AgentInput::interrupt(request_id)).await
    }

    /// Graceful stop: polite signal first, hard kill after the grace
    /// period.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(status) => {
                debug!("agent process pid={} exited: {:?}", self.pid, status?);
            }
            Err(_) => {
                warn!(
                    "agent process pid={} did not exit within {:?}, killing",
                    self.pid, self.stop_grace
                );
                child.kill().await?;
            }
        }
        Ok(())
    }

    async fn stdout_reader_task(
        pid: u32,
        stdout: tokio::process::ChildStdout,
        event_tx: broadcast::Sender<AgentEvent>,
        init_tx: oneshot::Sender<String>,
    ) {
        let mut init_tx = Some(init_tx);
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let event: AgentEvent = match serde_json::from_str(line) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("agent[{pid}] unparseable line ({e}): {line}");
                            continue;
                        }
                    };
                    if let Some(id) = event.init_session_id()
                        && let Some(tx) = init_tx.take()
                    {
                        let _ = tx.send(id.to_string());
                    }
                    // No receivers is fine; events are also persisted
                    // downstream by the reconciler.
                    let _ = event_tx.send(event);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("agent[{pid}] stdout read error: {e}");
                    break;
                }
            }
        }

        debug!("agent[{pid}] stdout closed");
        let _ = event_tx.send(AgentEvent::ConnectionClosed);
    }
}
