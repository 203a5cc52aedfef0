//! Central event fan-out.
//!
//! Subsystems (lifecycle manager, readiness, health, per-session
//! streams proxied from containers) each publish on their own
//! channel. The hub owns one broadcast sender per concern so UI
//! subscribers have a single place to attach, regardless of which
//! subsystem produced an event.

use dashmap::DashMap;
use log::warn;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use aviary_protocol::events::{
    AgentStatusEvent, ContainerStatus, HealthEvent, ReadinessEvent, SessionEvent,
};

const HOST_CHANNEL_CAPACITY: usize = 256;
const SESSION_CHANNEL_CAPACITY: usize = 1024;

/// Aggregated event streams for the whole host.
pub struct EventHub {
    status_tx: broadcast::Sender<AgentStatusEvent>,
    readiness_tx: broadcast::Sender<ReadinessEvent>,
    health_tx: broadcast::Sender<HealthEvent>,
    sessions: DashMap<String, broadcast::Sender<SessionEvent>>,
    // Which sessions live in which agent's container, so a container
    // stopping can retire them.
    agent_sessions: DashMap<String, Vec<String>>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(HOST_CHANNEL_CAPACITY);
        let (readiness_tx, _) = broadcast::channel(HOST_CHANNEL_CAPACITY);
        let (health_tx, _) = broadcast::channel(HOST_CHANNEL_CAPACITY);
        Arc::new(Self {
            status_tx,
            readiness_tx,
            health_tx,
            sessions: DashMap::new(),
            agent_sessions: DashMap::new(),
        })
    }

    // ------------------------------------------------------------------
    // Host-level streams
    // ------------------------------------------------------------------

    pub fn subscribe_status(&self) -> broadcast::Receiver<AgentStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn publish_status(&self, event: AgentStatusEvent) {
        let _ = self.status_tx.send(event);
    }

    pub fn subscribe_readiness(&self) -> broadcast::Receiver<ReadinessEvent> {
        self.readiness_tx.subscribe()
    }

    pub fn publish_readiness(&self, event: ReadinessEvent) {
        let _ = self.readiness_tx.send(event);
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health_tx.subscribe()
    }

    pub fn publish_health(&self, event: HealthEvent) {
        let _ = self.health_tx.send(event);
    }

    // ------------------------------------------------------------------
    // Per-session streams
    // ------------------------------------------------------------------

    /// Subscribe to one session's events, creating its channel on
    /// first use.
    pub fn subscribe_session(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.session_sender(session_id).subscribe()
    }

    pub fn publish_session(&self, session_id: &str, event: SessionEvent) {
        let _ = self.session_sender(session_id).send(event);
    }

    /// Associate a session with the agent whose container hosts it.
    pub fn register_session(&self, agent_slug: &str, session_id: &str) {
        let mut list = self
            .agent_sessions
            .entry(agent_slug.to_string())
            .or_default();
        if !list.iter().any(|s| s == session_id) {
            list.push(session_id.to_string());
        }
    }

    /// Session ids registered for an agent.
    pub fn sessions_for(&self, agent_slug: &str) -> Vec<String> {
        self.agent_sessions
            .get(agent_slug)
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Publish [`SessionEvent::Idle`] to every session registered for
    /// the agent. Registrations survive, so sessions resume on the
    /// same channels when the container comes back.
    pub fn mark_agent_inactive(&self, agent_slug: &str) {
        for session_id in self.sessions_for(agent_slug) {
            self.publish_session(&session_id, SessionEvent::Idle);
        }
    }

    /// Forget a session's channel; existing receivers see the stream
    /// end.
    pub fn drop_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        for mut entry in self.agent_sessions.iter_mut() {
            entry.value_mut().retain(|s| s != session_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session_sender(&self, session_id: &str) -> broadcast::Sender<SessionEvent> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(SESSION_CHANNEL_CAPACITY).0)
            .clone()
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    /// Relay a subsystem's status stream into the hub. A stop
    /// transition also retires the agent's registered sessions,
    /// whether the stop was requested or detected by sync.
    pub fn forward_status(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<AgentStatusEvent>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.status == ContainerStatus::Stopped {
                            hub.mark_agent_inactive(&event.agent_slug);
                        }
                        hub.publish_status(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("status forwarder lagged, dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Relay a readiness stream into the hub.
    pub fn forward_readiness(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<ReadinessEvent>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => hub.publish_readiness(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("readiness forwarder lagged, dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Relay a health stream into the hub.
    pub fn forward_health(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<HealthEvent>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => hub.publish_health(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("health forwarder lagged, dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_fans_out_to_all_subscribers() {
        let hub = EventHub::new();
        let mut a = hub.subscribe_status();
        let mut b = hub.subscribe_status();

        hub.publish_status(AgentStatusEvent {
            agent_slug: "research".to_string(),
            status: ContainerStatus::Running,
            port: Some(32768),
        });

        assert_eq!(a.recv().await.unwrap().agent_slug, "research");
        assert_eq!(b.recv().await.unwrap().port, Some(32768));
    }

    #[tokio::test]
    async fn session_channels_are_isolated() {
        let hub = EventHub::new();
        let mut one = hub.subscribe_session("s1");
        let mut two = hub.subscribe_session("s2");

        hub.publish_session("s1", SessionEvent::Idle);
        assert!(matches!(one.recv().await.unwrap(), SessionEvent::Idle));
        assert!(two.try_recv().is_err());

        assert_eq!(hub.session_count(), 2);
        hub.drop_session("s1");
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn stop_transition_retires_registered_sessions() {
        let hub = EventHub::new();
        hub.register_session("research", "s1");
        hub.register_session("research", "s2");
        hub.register_session("writer", "s3");
        let mut s1 = hub.subscribe_session("s1");
        let mut s2 = hub.subscribe_session("s2");
        let mut s3 = hub.subscribe_session("s3");

        let (tx, rx) = broadcast::channel(8);
        hub.forward_status(rx);
        let mut status = hub.subscribe_status();
        tx.send(AgentStatusEvent {
            agent_slug: "research".to_string(),
            status: ContainerStatus::Stopped,
            port: None,
        })
        .unwrap();

        status.recv().await.unwrap();
        assert!(matches!(s1.recv().await.unwrap(), SessionEvent::Idle));
        assert!(matches!(s2.recv().await.unwrap(), SessionEvent::Idle));
        // Another agent's sessions are untouched.
        assert!(s3.try_recv().is_err());

        // A dropped session no longer belongs to the agent.
        hub.drop_session("s1");
        assert_eq!(hub.sessions_for("research"), vec!["s2".to_string()]);
    }

    #[tokio::test]
    async fn forwarder_relays_until_source_closes() {
        let hub = EventHub::new();
        let (tx, rx) = broadcast::channel(8);
        let handle = hub.forward_status(rx);
        let mut out = hub.subscribe_status();

        tx.send(AgentStatusEvent {
            agent_slug: "a".to_string(),
            status: ContainerStatus::Stopped,
            port: None,
        })
        .unwrap();
        assert_eq!(out.recv().await.unwrap().agent_slug, "a");

        drop(tx);
        handle.await.unwrap();
    }
}
