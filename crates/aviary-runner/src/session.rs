//! Session engine.
//!
//! [`SessionManager`] owns every live agent process in the container:
//! creation with canonical-id handshake, resume from persisted
//! metadata, message routing, interrupts, and shutdown. Each live
//! session gets its own [`StreamRouter`] task consuming the process
//! event stream.
//!
//! Invariant: at most one live process per session id. A second
//! create for an id that is live fails; a resume for an id that is
//! live is just a send.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};

use aviary_protocol::events::{EnvUpdate, SessionEvent};
use aviary_protocol::input::PendingInputNotice;
use aviary_protocol::stream::{AgentEvent, AgentInput, UserContent, UserMessage};

use crate::input::InputBroker;
use crate::process::{AgentProcess, ProcessConfig, ProcessProbe};
use crate::store::{SessionMeta, SessionStore};
use crate::stream::{ClosedDisposition, ControlSignal, StreamRouter};

/// Capacity of the per-session application event channel.
const SESSION_EVENT_CAPACITY: usize = 1024;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct SessionEngineConfig {
    /// Path to the agent CLI binary.
    pub agent_binary: PathBuf,
    /// Default working directory for new sessions.
    pub default_cwd: PathBuf,
    /// How long to wait for the agent to report its canonical session
    /// id before giving up on a new session.
    pub canonical_id_timeout: Duration,
    /// Early-exit window treated as a startup failure.
    pub readiness_window: Duration,
    /// Grace period before a stop escalates to a kill.
    pub stop_grace: Duration,
    /// How long a pending human-input request may wait before it is
    /// auto-rejected.
    pub input_timeout: Duration,
    /// Sweep interval for stale pending requests.
    pub input_sweep_interval: Duration,
    /// Context window assumed until the agent reports a real one.
    pub default_context_window: u64,
}

impl Default for SessionEngineConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            agent_binary: PathBuf::from("claude"),
            default_cwd: PathBuf::from(home).join("workspace"),
            canonical_id_timeout: Duration::from_secs(30),
            readiness_window: Duration::from_millis(500),
            stop_grace: Duration::from_secs(5),
            input_timeout: Duration::from_secs(300),
            input_sweep_interval: Duration::from_secs(30),
            default_context_window: 200_000,
        }
    }
}

/// Per-session creation options.
#[derive(Debug, Clone, Default)]
pub struct NewSessionConfig {
    pub cwd: Option<PathBuf>,
    pub name: Option<String>,
    pub env: HashMap<String, String>,
}

struct LiveSession {
    process: Arc<AgentProcess>,
    events_tx: broadcast::Sender<SessionEvent>,
    interrupted: Arc<AtomicBool>,
    _router_handle: tokio::task::JoinHandle<()>,
}

/// Manager for live agent sessions inside one container.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, LiveSession>>,
    /// Ids with a spawn in flight but not yet in `sessions`. Guards
    /// the window where two concurrent resumes would both pass the
    /// liveness check and spawn twice.
    creating: Mutex<HashSet<String>>,
    store: Arc<dyn SessionStore>,
    broker: Arc<InputBroker>,
    control_tx: mpsc::Sender<ControlSignal>,
    config: SessionEngineConfig,
    _sweeper_handle: tokio::task::JoinHandle<()>,
}

impl SessionManager {
    pub fn new(
        config: SessionEngineConfig,
        store: Arc<dyn SessionStore>,
        control_tx: mpsc::Sender<ControlSignal>,
    ) -> Arc<Self> {
        let broker = InputBroker::new(config.input_timeout);
        let sweeper_handle = broker.spawn_sweeper(config.input_sweep_interval);
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashSet::new()),
            store,
            broker,
            control_tx,
            config,
            _sweeper_handle: sweeper_handle,
        })
    }

    pub fn broker(&self) -> &Arc<InputBroker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Create a brand-new session and send its first message.
    ///
    /// The session is spawned under a provisional id; the id the agent
    /// reports in its `system/init` event is canonical and becomes the
    /// key everything is stored and routed under.
    pub async fn create_session(
        self: &Arc<Self>,
        initial_message: &str,
        session_config: NewSessionConfig,
    ) -> Result<String> {
        let provisional_id = uuid::Uuid::new_v4().to_string();
        let cwd = session_config
            .cwd
            .clone()
            .unwrap_or_else(|| self.config.default_cwd.clone());
        info!("creating session (provisional id '{provisional_id}') in {cwd:?}");

        let (process, init_rx) = AgentProcess::spawn(ProcessConfig {
            binary: self.config.agent_binary.clone(),
            cwd: cwd.clone(),
            env: session_config.env.clone(),
            resume: None,
            session_id: Some(provisional_id.clone()),
            readiness_window: self.config.readiness_window,
            stop_grace: self.config.stop_grace,
        })
        .await
        .context("failed to start agent process")?;

        // Subscribe before the first write so the router task sees the
        // whole stream from the beginning.
        let event_rx = process.subscribe();

        if let Err(e) = process
            .send(&AgentInput::user_text(&provisional_id, initial_message))
            .await
        {
            let _ = process.stop().await;
            return Err(e).context("failed to send initial message");
        }

        let canonical_id =
            match tokio::time::timeout(self.config.canonical_id_timeout, init_rx).await {
                Ok(Ok(id)) => id,
                Ok(Err(_)) => {
                    let _ = process.stop().await;
                    bail!("agent exited before reporting a session id");
                }
                Err(_) => {
                    let _ = process.stop().await;
                    bail!(
                        "agent did not report a session id within {:?}",
                        self.config.canonical_id_timeout
                    );
                }
            };
        if canonical_id != provisional_id {
            debug!("agent assigned canonical id '{canonical_id}' (provisional '{provisional_id}')");
        }

        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(&canonical_id) {
                let _ = process.stop().await;
                bail!("session '{canonical_id}' already has a live process");
            }
        }

        let mut meta = SessionMeta::new(&canonical_id, cwd);
        meta.name = session_config.name;
        self.store
            .save_meta(&meta)
            .context("failed to persist session metadata")?;
        self.record_user_message(&canonical_id, initial_message, None)?;

        let live = self.start_router(&canonical_id, process, event_rx);
        self.sessions
            .write()
            .await
            .insert(canonical_id.clone(), live);

        info!("session '{canonical_id}' created");
        Ok(canonical_id)
    }

    /// Send a message to a session, resuming it from persisted
    /// metadata when no process is live.
    pub async fn send_message(self: &Arc<Self>, session_id: &str, text: &str) -> Result<()> {
        // Fast path: live process.
        {
            let sessions = self.sessions.read().await;
            if let Some(live) = sessions.get(session_id) {
                self.record_user_message(session_id, text, Some(&live.events_tx))?;
                live.process
                    .send(&AgentInput::user_text(session_id, text))
                    .await
                    .context("failed to write message to agent")?;
                return Ok(());
            }
        }

        // Resume path, guarded against concurrent spawns for the same id.
        {
            let mut creating = self.creating.lock().await;
            if creating.contains(session_id) {
                bail!("session '{session_id}' is already being resumed");
            }
            creating.insert(session_id.to_string());
        }
        let result = self.resume_and_send(session_id, text).await;
        self.creating.lock().await.remove(session_id);
        result
    }

    async fn resume_and_send(self: &Arc<Self>, session_id: &str, text: &str) -> Result<()> {
        let mut meta = self
            .store
            .load_meta(session_id)
            .context("failed to read session metadata")?
            .with_context(|| format!("session '{session_id}' not found"))?;

        info!("resuming session '{session_id}' in {:?}", meta.cwd);
        let env = self.store.read_env(session_id).unwrap_or_default();
        let (process, init_rx) = AgentProcess::spawn(ProcessConfig {
            binary: self.config.agent_binary.clone(),
            cwd: meta.cwd.clone(),
            env,
            resume: Some(session_id.to_string()),
            session_id: None,
            readiness_window: self.config.readiness_window,
            stop_grace: self.config.stop_grace,
        })
        .await
        .context("failed to start agent process for resume")?;

        let event_rx = process.subscribe();
        self.record_user_message(session_id, text, None)?;
        if let Err(e) = process
            .send(&AgentInput::user_text(session_id, text))
            .await
        {
            let _ = process.stop().await;
            return Err(e).context("failed to send message to resumed agent");
        }

        match tokio::time::timeout(self.config.canonical_id_timeout, init_rx).await {
            Ok(Ok(reported)) => {
                if reported != session_id {
                    warn!(
                        "resumed session '{session_id}' reported unexpected id '{reported}'"
                    );
                }
            }
            Ok(Err(_)) => {
                let _ = process.stop().await;
                bail!("agent exited while resuming session '{session_id}'");
            }
            Err(_) => {
                let _ = process.stop().await;
                bail!(
                    "resumed agent did not acknowledge session '{session_id}' within {:?}",
                    self.config.canonical_id_timeout
                );
            }
        }

        meta.last_active_at = chrono::Utc::now();
        self.store.save_meta(&meta)?;

        let live = self.start_router(session_id, process, event_rx);
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), live);
        Ok(())
    }

    /// Subscribe to a session's application events.
    pub async fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|live| live.events_tx.subscribe())
    }

    /// Interrupt the current turn. Returns `false` when no process is
    /// live for the session.
    pub async fn interrupt(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        let Some(live) = sessions.get(session_id) else {
            return false;
        };
        // Flag first: the router must start dropping in-flight events
        // before the agent even sees the abort.
        live.interrupted.store(true, Ordering::SeqCst);
        if let Err(e) = live.process.interrupt().await {
            warn!("failed to interrupt session '{session_id}': {e}");
        }
        true
    }

    /// Stop one session's process.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let live = self.sessions.write().await.remove(session_id);
        let Some(live) = live else {
            bail!("session '{session_id}' not found");
        };
        live.process.stop().await?;
        info!("session '{session_id}' stopped");
        Ok(())
    }

    /// Best-effort concurrent stop of every live session.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, LiveSession)> =
            self.sessions.write().await.drain().collect();
        info!("stopping {} live session(s)", drained.len());
        let stops = drained.into_iter().map(|(id, live)| async move {
            if let Err(e) = live.process.stop().await {
                warn!("failed to stop session '{id}': {e}");
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Pending input requests for a session, excluding ones the
    /// conversation has moved past.
    pub async fn active_pending(&self, session_id: &str) -> Vec<PendingInputNotice> {
        self.broker
            .pending_for(session_id)
            .into_iter()
            .filter(|notice| {
                !self
                    .store
                    .user_message_follows(session_id, &notice.tool_use_id)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Answer a pending request with an arbitrary value.
    pub async fn resolve_input(
        &self,
        session_id: &str,
        tool_use_id: &str,
        value: serde_json::Value,
    ) -> bool {
        let resolved = self.broker.resolve(tool_use_id, value);
        if resolved {
            self.publish(session_id, SessionEvent::InputResolved {
                tool_use_id: tool_use_id.to_string(),
            })
            .await;
        }
        resolved
    }

    /// Decline a pending request.
    pub async fn reject_input(
        &self,
        session_id: &str,
        tool_use_id: &str,
        reason: Option<String>,
    ) -> bool {
        let rejected = self.broker.reject(tool_use_id, reason);
        if rejected {
            self.publish(session_id, SessionEvent::InputResolved {
                tool_use_id: tool_use_id.to_string(),
            })
            .await;
        }
        rejected
    }

    /// Persist a typed configuration update into the session's env
    /// store. Tools read the store at invocation time, so the value is
    /// visible as soon as this returns.
    pub async fn apply_env_update(&self, session_id: &str, update: &EnvUpdate) -> Result<()> {
        update.validate().map_err(|e| anyhow::anyhow!(e))?;
        self.store
            .set_env(session_id, &update.key, &update.value)
            .context("failed to persist env update")?;
        info!("session '{session_id}': env key '{}' updated", update.key);
        Ok(())
    }

    /// Deliver a secret for a pending `request_secret`: the value is
    /// written durably first, then the request resolves.
    pub async fn resolve_secret(
        &self,
        session_id: &str,
        tool_use_id: &str,
        update: &EnvUpdate,
    ) -> Result<bool> {
        self.apply_env_update(session_id, update).await?;
        Ok(self
            .resolve_input(session_id, tool_use_id, json!({ "key": update.key }))
            .await)
    }

    /// Sessions known to the store, most recently active first.
    pub fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        Ok(self.store.list_sessions()?)
    }

    pub async fn live_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn start_router(
        self: &Arc<Self>,
        session_id: &str,
        process: Arc<AgentProcess>,
        event_rx: broadcast::Receiver<AgentEvent>,
    ) -> LiveSession {
        let (events_tx, _) = broadcast::channel::<SessionEvent>(SESSION_EVENT_CAPACITY);
        let interrupted = Arc::new(AtomicBool::new(false));

        let router = StreamRouter::new(
            session_id,
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            events_tx.clone(),
            self.control_tx.clone(),
            Arc::clone(&interrupted),
            self.config.default_context_window,
        );

        let probe: std::sync::Weak<SessionManager> = Arc::downgrade(self);
        let router_handle = tokio::spawn(Self::router_task(
            session_id.to_string(),
            router,
            Arc::clone(&process),
            event_rx,
            probe,
        ));

        LiveSession {
            process,
            events_tx,
            interrupted,
            _router_handle: router_handle,
        }
    }

    async fn router_task(
        session_id: String,
        mut router: StreamRouter,
        process: Arc<AgentProcess>,
        mut event_rx: broadcast::Receiver<AgentEvent>,
        probe: std::sync::Weak<SessionManager>,
    ) {
        loop {
            match event_rx.recv().await {
                Ok(AgentEvent::ConnectionClosed) => {
                    let alive = match probe.upgrade() {
                        Some(manager) => ProcessProbe::is_alive(&*manager, &session_id).await,
                        None => false,
                    };
                    match router.handle_connection_closed(alive) {
                        ClosedDisposition::Resubscribe => {
                            event_rx = process.subscribe();
                        }
                        ClosedDisposition::ProcessGone => break,
                    }
                }
                Ok(event) => router.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("session '{session_id}': router lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("session '{session_id}': router task finished");
    }

    fn record_user_message(
        &self,
        session_id: &str,
        text: &str,
        events_tx: Option<&broadcast::Sender<SessionEvent>>,
    ) -> Result<()> {
        let event = AgentEvent::User {
            message: UserMessage {
                role: "user".to_string(),
                content: UserContent::Text(text.to_string()),
            },
            session_id: Some(session_id.to_string()),
        };
        self.store
            .append_event(session_id, &event)
            .context("failed to persist user message")?;
        if let Some(tx) = events_tx {
            let _ = tx.send(SessionEvent::MessagesChanged);
        }
        Ok(())
    }

    async fn publish(&self, session_id: &str, event: SessionEvent) {
        let sessions = self.sessions.read().await;
        if let Some(live) = sessions.get(session_id) {
            let _ = live.events_tx.send(event);
        }
    }
}

#[async_trait::async_trait]
impl ProcessProbe for SessionManager {
    async fn is_alive(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(live) => live.process.is_alive().await,
            None => false,
        }
    }
}
