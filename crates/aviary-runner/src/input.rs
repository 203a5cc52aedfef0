//! Human-input bridge.
//!
//! When the agent calls a blocking tool, the reconciler registers the
//! request here keyed by its tool-use id. Whoever executes the tool
//! attaches a waiter and parks on it; a human answer arrives through
//! [`InputBroker::resolve`] or [`InputBroker::reject`], each of which
//! fires at most once per request. A sweep task retires requests
//! nobody answered within the timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use aviary_protocol::input::PendingInputNotice;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("request was declined{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Declined { reason: Option<String> },

    #[error("request timed out waiting for a human")]
    TimedOut,
}

struct PendingEntry {
    session_id: String,
    notice: PendingInputNotice,
    waiter: Option<oneshot::Sender<Result<Value, InputError>>>,
}

/// Broker for pending human-input requests.
pub struct InputBroker {
    pending: DashMap<String, PendingEntry>,
    timeout: Duration,
}

impl InputBroker {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            timeout,
        })
    }

    /// Register a new pending request. Returns `false` (and leaves the
    /// existing entry alone) when the tool-use id is already pending.
    pub fn register(&self, session_id: &str, notice: PendingInputNotice) -> bool {
        let id = notice.tool_use_id.clone();
        match self.pending.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(
                    "registered pending input '{}' ({:?}) for session '{session_id}'",
                    notice.tool_use_id, notice.kind
                );
                slot.insert(PendingEntry {
                    session_id: session_id.to_string(),
                    notice,
                    waiter: None,
                });
                true
            }
        }
    }

    /// Attach a waiter to a pending request. The returned receiver
    /// resolves exactly once with the answer or the rejection. Returns
    /// `None` when the id is unknown or a waiter is already attached.
    pub fn await_resolution(
        &self,
        tool_use_id: &str,
    ) -> Option<oneshot::Receiver<Result<Value, InputError>>> {
        let mut entry = self.pending.get_mut(tool_use_id)?;
        if entry.waiter.is_some() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        entry.waiter = Some(tx);
        Some(rx)
    }

    /// Answer a pending request. Returns `false` when nothing with
    /// that id is pending (already resolved, rejected, or swept).
    pub fn resolve(&self, tool_use_id: &str, value: Value) -> bool {
        let Some((_, entry)) = self.pending.remove(tool_use_id) else {
            return false;
        };
        info!("resolved pending input '{tool_use_id}'");
        if let Some(waiter) = entry.waiter {
            let _ = waiter.send(Ok(value));
        }
        true
    }

    /// Decline a pending request.
    pub fn reject(&self, tool_use_id: &str, reason: Option<String>) -> bool {
        let Some((_, entry)) = self.pending.remove(tool_use_id) else {
            return false;
        };
        info!("rejected pending input '{tool_use_id}'");
        if let Some(waiter) = entry.waiter {
            let _ = waiter.send(Err(InputError::Declined { reason }));
        }
        true
    }

    /// Snapshot of everything currently pending, oldest first.
    pub fn pending(&self) -> Vec<PendingInputNotice> {
        let mut notices: Vec<PendingInputNotice> = self
            .pending
            .iter()
            .map(|entry| entry.notice.clone())
            .collect();
        notices.sort_by_key(|n| n.created_at);
        notices
    }

    /// Pending requests raised by one session, oldest first.
    pub fn pending_for(&self, session_id: &str) -> Vec<PendingInputNotice> {
        let mut notices: Vec<PendingInputNotice> = self
            .pending
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.notice.clone())
            .collect();
        notices.sort_by_key(|n| n.created_at);
        notices
    }

    pub fn contains(&self, tool_use_id: &str) -> bool {
        self.pending.contains_key(tool_use_id)
    }

    /// Reject every entry older than the timeout. Returns how many
    /// were swept.
    pub fn sweep_stale(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::zero());
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.notice.created_at < cutoff)
            .map(|entry| entry.notice.tool_use_id.clone())
            .collect();

        let mut swept = 0;
        for id in stale {
            if let Some((_, entry)) = self.pending.remove(&id) {
                warn!("pending input '{id}' timed out after {:?}", self.timeout);
                if let Some(waiter) = entry.waiter {
                    let _ = waiter.send(Err(InputError::TimedOut));
                }
                swept += 1;
            }
        }
        swept
    }

    /// Run the staleness sweep on an interval until the broker is
    /// dropped by everyone else.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let broker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                broker.sweep_stale();
            }
        })
    }
}
