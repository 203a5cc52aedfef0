//! Agent container lifecycle manager.
//!
//! One container per agent slug, named `aviary-agent-<slug>`. The
//! manager keeps a cached record per agent (status + learned host
//! port) and reconciles it against the runtime on demand and on a
//! periodic sync.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use aviary_protocol::events::{AgentStatusEvent, ContainerStatus};

use super::config::{ContainerConfig, ContainerStats, PortMapping};
use super::error::{ContainerError, ContainerResult};
use super::{ContainerRuntimeApi, ContainerState};

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Image to run for every agent container.
    pub image: String,
    /// Port the in-container API listens on.
    pub container_port: u16,
    /// Grace period passed to `stop -t`.
    pub stop_grace_secs: u32,
    /// Host directory whose `<slug>` subdirectory is mounted as the
    /// agent workspace. No mount when unset.
    pub agents_dir: Option<String>,
    /// Environment given to every agent container, under the
    /// per-agent env. Runner tuning knobs travel this way.
    pub base_env: HashMap<String, String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            image: "aviary/agent:latest".to_string(),
            container_port: 8787,
            stop_grace_secs: 10,
            agents_dir: None,
            base_env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct ContainerRecord {
    status: ContainerStatus,
    port: Option<u16>,
    last_synced_at: DateTime<Utc>,
}

/// Manages one container per agent and publishes status transitions.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: ManagerConfig,
    records: DashMap<String, ContainerRecord>,
    // Per-agent locks serialize ensure/stop against each other while
    // leaving unrelated agents concurrent.
    locks: DashMap<String, Arc<Mutex<()>>>,
    status_tx: broadcast::Sender<AgentStatusEvent>,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: ManagerConfig) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Arc::new(Self {
            runtime,
            config,
            records: DashMap::new(),
            locks: DashMap::new(),
            status_tx,
        })
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<AgentStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn container_name(slug: &str) -> String {
        format!("aviary-agent-{slug}")
    }

    fn lock_for(&self, slug: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Cached status for an agent, if the manager has seen it.
    pub fn status(&self, slug: &str) -> Option<ContainerStatus> {
        self.records.get(slug).map(|r| r.status)
    }

    /// Cached host port for an agent's running container.
    pub fn port(&self, slug: &str) -> Option<u16> {
        self.records.get(slug).and_then(|r| r.port)
    }

    /// Ensure the agent's container is running and return the host
    /// port its API is reachable on.
    pub async fn ensure_running(
        &self,
        slug: &str,
        env: HashMap<String, String>,
    ) -> ContainerResult<u16> {
        // Optimistic fast path: a cached running record with a port
        // skips the runtime round trip entirely.
        if let Some(record) = self.records.get(slug)
            && record.status == ContainerStatus::Running
            && let Some(port) = record.port
        {
            return Ok(port);
        }

        let lock = self.lock_for(slug);
        let _guard = lock.lock().await;

        // Re-check under the lock; a concurrent caller may have won.
        if let Some(record) = self.records.get(slug)
            && record.status == ContainerStatus::Running
            && let Some(port) = record.port
        {
            return Ok(port);
        }

        let name = Self::container_name(slug);
        match self.runtime.state(&name).await {
            Ok(state) if state.is_running() => {
                debug!("container {name} already running");
            }
            Ok(_) => {
                // Stale stopped container. Remove rather than start:
                // env and image may have changed since it was created.
                info!("removing stale container {name}");
                self.runtime.remove(&name).await?;
                self.create_container(slug, &name, env).await?;
            }
            Err(ContainerError::ContainerNotFound(_)) => {
                self.create_container(slug, &name, env).await?;
            }
            Err(err) => return Err(err),
        }

        // One authoritative inspect to learn the ephemeral host port.
        let port = self
            .runtime
            .host_port(&name, self.config.container_port)
            .await?
            .ok_or_else(|| {
                ContainerError::ParseError(format!(
                    "container {name} has no mapping for port {}",
                    self.config.container_port
                ))
            })?;

        self.record_transition(slug, ContainerStatus::Running, Some(port));
        Ok(port)
    }

    async fn create_container(
        &self,
        slug: &str,
        name: &str,
        env: HashMap<String, String>,
    ) -> ContainerResult<()> {
        let mut config = ContainerConfig::new(self.config.image.clone())
            .name(name)
            .port(PortMapping::ephemeral(self.config.container_port))
            .env("AGENT_SLUG", slug)
            .envs(self.config.base_env.clone())
            .envs(env)
            .label("aviary.agent", slug);
        if let Some(ref agents_dir) = self.config.agents_dir {
            config = config.volume(format!("{agents_dir}/{slug}"), "/workspace");
        }
        let id = self.runtime.run(&config).await?;
        info!("created container {name} ({})", &id[..id.len().min(12)]);
        Ok(())
    }

    /// Stop the agent's container with the configured grace period.
    pub async fn stop_agent(&self, slug: &str) -> ContainerResult<()> {
        let lock = self.lock_for(slug);
        let _guard = lock.lock().await;

        let name = Self::container_name(slug);
        match self.runtime.stop(&name, self.config.stop_grace_secs).await {
            Ok(()) => {}
            Err(ContainerError::CommandFailed { message, .. })
                if message.contains("no such") || message.contains("No such") =>
            {
                debug!("stop: container {name} already gone");
            }
            Err(err) => return Err(err),
        }
        self.record_transition(slug, ContainerStatus::Stopped, None);
        Ok(())
    }

    /// Remove the agent's container entirely and forget its record.
    pub async fn remove_agent(&self, slug: &str) -> ContainerResult<()> {
        let lock = self.lock_for(slug);
        let _guard = lock.lock().await;

        let name = Self::container_name(slug);
        self.runtime.remove(&name).await?;
        self.records.remove(slug);
        let _ = self.status_tx.send(AgentStatusEvent {
            agent_slug: slug.to_string(),
            status: ContainerStatus::Stopped,
            port: None,
        });
        Ok(())
    }

    /// Resource stats for the agent's container.
    pub async fn stats(&self, slug: &str) -> ContainerResult<ContainerStats> {
        self.runtime.stats(&Self::container_name(slug)).await
    }

    /// Agents the manager currently tracks.
    pub fn tracked_agents(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    /// Reconcile cached records against the runtime. Containers that
    /// died outside the manager's control are detected here.
    pub async fn sync(&self) {
        let slugs = self.tracked_agents();
        for slug in slugs {
            let before = match self.records.get(&slug) {
                Some(record) => record.clone(),
                None => continue,
            };
            let name = Self::container_name(&slug);
            let observed = match self.runtime.state(&name).await {
                Ok(state) if state.is_running() => ContainerStatus::Running,
                Ok(_) | Err(ContainerError::ContainerNotFound(_)) => ContainerStatus::Stopped,
                Err(err) => {
                    warn!("sync: inspect {name} failed: {err}");
                    continue;
                }
            };
            // Guard against clobbering a transition that happened
            // while the inspect was in flight.
            if let Some(current) = self.records.get(&slug)
                && current.last_synced_at > before.last_synced_at
            {
                continue;
            }
            let port = if observed == ContainerStatus::Running {
                before.port
            } else {
                None
            };
            self.record_transition(&slug, observed, port);
        }
    }

    /// Periodic [`sync`](Self::sync) loop. Holds only a weak
    /// reference so dropping the manager stops it.
    pub fn spawn_sync_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sync().await;
            }
        })
    }

    /// Update the record and publish only when the status actually
    /// changed.
    fn record_transition(&self, slug: &str, status: ContainerStatus, port: Option<u16>) {
        let mut changed = true;
        match self.records.entry(slug.to_string()) {
            dashmap::Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                changed = record.status != status || record.port != port;
                record.status = status;
                record.port = port;
                record.last_synced_at = Utc::now();
            }
            dashmap::Entry::Vacant(entry) => {
                entry.insert(ContainerRecord {
                    status,
                    port,
                    last_synced_at: Utc::now(),
                });
            }
        }
        if changed {
            info!("agent {slug} container is now {status:?} (port {port:?})");
            let _ = self.status_tx.send(AgentStatusEvent {
                agent_slug: slug.to_string(),
                status,
                port,
            });
        }
    }
}
