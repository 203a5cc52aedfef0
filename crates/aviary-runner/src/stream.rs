//! Stream reconciliation.
//!
//! [`StreamRouter`] consumes the raw agent event stream for one
//! session and turns it into application-level [`SessionEvent`]s:
//! finalized messages are persisted and announced, streaming deltas
//! are accumulated and forwarded as increments, completed blocking
//! tool calls become pending input requests, and the `result` event
//! closes the turn.
//!
//! One raw event may produce zero, one, or several session events.
//! The router is the only writer of the session's event log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use aviary_protocol::events::{ContextUsage, SessionEvent};
use aviary_protocol::input::{InputRequestArgs, InputRequestKind, PendingInputNotice};
use aviary_protocol::stream::{AgentEvent, BlockDelta, ContentBlock, StreamDelta, TurnResult};
use aviary_protocol::{SUBTYPE_COMPACT_BOUNDARY, SUBTYPE_INIT};

use crate::input::InputBroker;
use crate::store::SessionStore;

/// Requests from the reconciler to the composition root.
#[derive(Debug, Clone)]
pub enum ControlSignal {
    /// A fatal agent error: the session's container should stop.
    StopContainer { session_id: String, reason: String },
}

/// What to do after the event transport dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedDisposition {
    /// Process still alive; the drop was a transport hiccup.
    Resubscribe,
    /// Process is gone; the session went idle.
    ProcessGone,
}

#[derive(Debug, Default)]
struct PartialToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Mutable per-session streaming state.
#[derive(Default)]
struct StreamingState {
    partial_text: HashMap<usize, String>,
    partial_tools: HashMap<usize, PartialToolUse>,
    is_active: bool,
    /// Set between a compaction boundary and the summary user message
    /// that follows it.
    awaiting_compaction_summary: bool,
    /// Learned from `result` usage metadata; configured default until
    /// then.
    context_window: Option<u64>,
    last_context_tokens: Option<u64>,
}

pub struct StreamRouter {
    session_id: String,
    store: Arc<dyn SessionStore>,
    broker: Arc<InputBroker>,
    events_tx: broadcast::Sender<SessionEvent>,
    control_tx: mpsc::Sender<ControlSignal>,
    interrupted: Arc<AtomicBool>,
    default_context_window: u64,
    state: StreamingState,
}

impl StreamRouter {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        broker: Arc<InputBroker>,
        events_tx: broadcast::Sender<SessionEvent>,
        control_tx: mpsc::Sender<ControlSignal>,
        interrupted: Arc<AtomicBool>,
        default_context_window: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            broker,
            events_tx,
            control_tx,
            interrupted,
            default_context_window,
            state: StreamingState::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active
    }

    /// Context window currently in effect for this session.
    pub fn context_window(&self) -> u64 {
        self.state.context_window.unwrap_or(self.default_context_window)
    }

    /// Pending input requests that the conversation has not moved past.
    ///
    /// A request is retired once a newer (non-tool-result) user message
    /// exists in the log, even though that can occasionally hide a
    /// request that is still genuinely waiting.
    pub fn active_pending(&self) -> Vec<PendingInputNotice> {
        self.broker
            .pending_for(&self.session_id)
            .into_iter()
            .filter(|notice| {
                match self
                    .store
                    .user_message_follows(&self.session_id, &notice.tool_use_id)
                {
                    Ok(superseded) => !superseded,
                    Err(e) => {
                        warn!(
                            "failed to check supersession for '{}': {e}",
                            notice.tool_use_id
                        );
                        true
                    }
                }
            })
            .collect()
    }

    /// Apply one raw agent event.
    pub async fn handle_event(&mut self, event: AgentEvent) {
        // After an interrupt everything in flight is stale except the
        // result that closes the turn.
        if self.interrupted.load(Ordering::SeqCst) && !matches!(event, AgentEvent::Result(_)) {
            debug!("session '{}': dropping event during interrupt drain", self.session_id);
            return;
        }

        match event {
            AgentEvent::System { subtype, .. } => self.on_system(&subtype),
            AgentEvent::User { .. } => self.on_user(event),
            AgentEvent::Assistant { .. } => self.on_assistant(event),
            AgentEvent::Result(result) => self.on_result(result).await,
            AgentEvent::StreamEvent { event, .. } => self.on_delta(event),
            AgentEvent::ConnectionClosed => {
                // Disambiguated by the caller via process liveness.
            }
            AgentEvent::Unknown => {
                debug!("session '{}': ignoring unknown event", self.session_id);
            }
        }
    }

    /// Decide what a transport drop means given process liveness.
    pub fn handle_connection_closed(&mut self, process_alive: bool) -> ClosedDisposition {
        if process_alive {
            debug!(
                "session '{}': event transport dropped but process alive, resubscribing",
                self.session_id
            );
            return ClosedDisposition::Resubscribe;
        }
        self.state.is_active = false;
        self.publish(SessionEvent::Idle);
        ClosedDisposition::ProcessGone
    }

    fn on_system(&mut self, subtype: &str) {
        match subtype {
            SUBTYPE_INIT => {
                self.state.is_active = true;
                self.publish(SessionEvent::StreamStarted {
                    session_id: self.session_id.clone(),
                });
            }
            SUBTYPE_COMPACT_BOUNDARY => {
                self.state.awaiting_compaction_summary = true;
                self.publish(SessionEvent::CompactionStarted);
            }
            other => debug!("session '{}': system/{other} ignored", self.session_id),
        }
    }

    fn on_user(&mut self, event: AgentEvent) {
        let AgentEvent::User { ref message, .. } = event else {
            return;
        };

        let tool_results: Vec<(String, bool)> = message
            .content
            .tool_results()
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    is_error,
                    ..
                } => Some((tool_use_id.clone(), *is_error)),
                _ => None,
            })
            .collect();

        if let Err(e) = self.store.append_event(&self.session_id, &event) {
            warn!("session '{}': failed to persist user event: {e}", self.session_id);
        }

        if self.state.awaiting_compaction_summary && tool_results.is_empty() {
            // First user message after the boundary is the summary.
            self.state.awaiting_compaction_summary = false;
            self.publish(SessionEvent::MessagesChanged);
            return;
        }

        if tool_results.is_empty() {
            self.publish(SessionEvent::MessagesChanged);
        } else {
            for (tool_use_id, is_error) in tool_results {
                self.publish(SessionEvent::ToolResult {
                    tool_use_id,
                    is_error,
                });
            }
        }
    }

    fn on_assistant(&mut self, event: AgentEvent) {
        let AgentEvent::Assistant { ref message, .. } = event else {
            return;
        };
        let usage = message.usage;

        if let Err(e) = self.store.append_event(&self.session_id, &event) {
            warn!(
                "session '{}': failed to persist assistant event: {e}",
                self.session_id
            );
        }

        // The finalized message supersedes every partial block.
        self.state.partial_text.clear();
        self.publish(SessionEvent::MessagesChanged);

        if let Some(usage) = usage {
            self.state.last_context_tokens = Some(usage.context_tokens());
            self.publish_usage();
        }
    }

    async fn on_result(&mut self, result: TurnResult) {
        self.state.is_active = false;
        self.state.partial_text.clear();
        self.state.partial_tools.clear();
        self.interrupted.store(false, Ordering::SeqCst);

        if let Some(window) = result.max_context_window() {
            self.state.context_window = Some(window);
        }
        if let Some(usage) = result.usage {
            self.state.last_context_tokens = Some(usage.context_tokens());
        }
        self.publish_usage();
        self.update_meta();

        if result.is_error {
            let message = result
                .result
                .clone()
                .unwrap_or_else(|| result.subtype.clone());
            warn!(
                "session '{}': turn failed ({}){}",
                self.session_id,
                result.subtype,
                if result.fatal { " [fatal]" } else { "" }
            );
            self.publish(SessionEvent::Error {
                message: message.clone(),
                fatal: result.fatal,
            });
            if result.fatal {
                let signal = ControlSignal::StopContainer {
                    session_id: self.session_id.clone(),
                    reason: message,
                };
                if let Err(e) = self.control_tx.send(signal).await {
                    warn!("session '{}': control channel closed: {e}", self.session_id);
                }
            }
        } else {
            self.publish(SessionEvent::Idle);
        }
    }

    fn on_delta(&mut self, delta: StreamDelta) {
        match delta {
            StreamDelta::MessageStart { .. } => {
                self.state.partial_text.clear();
                self.state.partial_tools.clear();
            }
            StreamDelta::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    self.publish(SessionEvent::ToolUseStarted {
                        tool_use_id: id.clone(),
                        name: name.clone(),
                    });
                    self.state.partial_tools.insert(
                        index,
                        PartialToolUse {
                            id,
                            name,
                            input_json: String::new(),
                        },
                    );
                }
                ContentBlock::Text { text } => {
                    self.state.partial_text.insert(index, text);
                }
                _ => {}
            },
            StreamDelta::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    self.state
                        .partial_text
                        .entry(index)
                        .or_default()
                        .push_str(&text);
                    self.publish(SessionEvent::TextDelta { index, delta: text });
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    self.publish(SessionEvent::ThinkingDelta {
                        index,
                        delta: thinking,
                    });
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = self.state.partial_tools.get_mut(&index) {
                        tool.input_json.push_str(&partial_json);
                    }
                }
                BlockDelta::Unknown => {}
            },
            StreamDelta::ContentBlockStop { index } => {
                self.state.partial_text.remove(&index);
                if let Some(tool) = self.state.partial_tools.remove(&index) {
                    self.on_tool_use_complete(tool);
                }
            }
            StreamDelta::MessageStop | StreamDelta::Unknown => {}
        }
    }

    fn on_tool_use_complete(&mut self, tool: PartialToolUse) {
        let Some(kind) = InputRequestKind::from_tool_name(&tool.name) else {
            return;
        };

        let raw = if tool.input_json.trim().is_empty() {
            "{}"
        } else {
            tool.input_json.as_str()
        };
        let input: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "session '{}': malformed input for blocking tool '{}' ({e}), skipping",
                    self.session_id, tool.name
                );
                return;
            }
        };
        let args = match InputRequestArgs::parse(kind, &input) {
            Ok(args) => args,
            Err(e) => {
                warn!(
                    "session '{}': invalid arguments for '{}' ({e}), skipping",
                    self.session_id, tool.name
                );
                return;
            }
        };

        let notice = PendingInputNotice {
            tool_use_id: tool.id,
            kind,
            args,
            created_at: Utc::now(),
        };
        if self.broker.register(&self.session_id, notice.clone()) {
            self.publish(SessionEvent::PendingInput { notice });
        }
    }

    fn publish_usage(&self) {
        let Some(tokens_used) = self.state.last_context_tokens else {
            return;
        };
        self.publish(SessionEvent::UsageUpdated {
            usage: ContextUsage {
                tokens_used,
                context_window: self.context_window(),
            },
        });
    }

    fn update_meta(&self) {
        let usage = self.state.last_context_tokens.map(|tokens_used| ContextUsage {
            tokens_used,
            context_window: self.context_window(),
        });
        match self.store.load_meta(&self.session_id) {
            Ok(Some(mut meta)) => {
                meta.last_active_at = Utc::now();
                if usage.is_some() {
                    meta.last_usage = usage;
                }
                if let Err(e) = self.store.save_meta(&meta) {
                    warn!("session '{}': failed to save meta: {e}", self.session_id);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("session '{}': failed to load meta: {e}", self.session_id),
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is normal (e.g. headless sessions).
        let _ = self.events_tx.send(event);
    }
}
