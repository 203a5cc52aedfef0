//! Application-level events.
//!
//! Where [`crate::stream`] models what the agent CLI says on the wire,
//! these are the events the platform republishes to subscribers after
//! reconciliation: per-session conversation notifications, host-side
//! container status, image readiness, and health results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::input::PendingInputNotice;

// ============================================================================
// Session events
// ============================================================================

/// Per-session notifications produced by the stream reconciler,
/// tagged by `event` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The agent acknowledged the session and is streaming.
    StreamStarted { session_id: String },

    /// The persisted transcript changed; subscribers should refetch.
    MessagesChanged,

    /// Incremental assistant text.
    TextDelta { index: usize, delta: String },

    /// Incremental thinking text.
    ThinkingDelta { index: usize, delta: String },

    /// A tool call started assembling.
    ToolUseStarted { tool_use_id: String, name: String },

    /// A tool finished and its result was delivered to the agent.
    ToolResult { tool_use_id: String, is_error: bool },

    /// A blocking tool is waiting on a human.
    PendingInput { notice: PendingInputNotice },

    /// A previously pending request was answered or declined.
    InputResolved { tool_use_id: String },

    /// Context usage after a finalized message or turn.
    UsageUpdated { usage: ContextUsage },

    /// The agent began compacting its context.
    CompactionStarted,

    /// Turn finished; the agent is waiting for input.
    Idle,

    /// The turn failed. When `fatal`, the process will not accept
    /// further input and its container is being stopped.
    Error { message: String, fatal: bool },
}

/// Tokens in context versus the model's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub tokens_used: u64,
    pub context_window: u64,
}

impl ContextUsage {
    pub fn percent_used(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        (self.tokens_used as f64 / self.context_window as f64) * 100.0
    }
}

// ============================================================================
// Host events
// ============================================================================

/// Observed container state, deliberately coarse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

/// Published when an agent's container transitions state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusEvent {
    pub agent_slug: String,
    pub status: ContainerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Stage of the image readiness pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Checking,
    RuntimeUnavailable,
    PullingImage,
    Ready,
    Error,
}

/// Progress report from the readiness pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessEvent {
    pub state: ReadinessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Coarse pull progress, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_progress: Option<u8>,
}

/// Severity of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Warning,
    Critical,
}

/// One health check outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Stable check identifier, e.g. `memory`.
    pub check: String,
    pub status: HealthStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Health snapshot for one agent's container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub agent_slug: String,
    pub checks: Vec<HealthCheckResult>,
    pub checked_at: DateTime<Utc>,
}

// ============================================================================
// Control messages
// ============================================================================

/// Typed configuration update delivered to a runner, replacing ad-hoc
/// environment injection into a live process. The runner persists the
/// pair into the session's config store so tools read the fresh value
/// at invocation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvUpdate {
    pub key: String,
    pub value: String,
}

impl EnvUpdate {
    /// Keys must look like environment variable names.
    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("env key must not be empty".to_string());
        }
        let mut chars = self.key.chars();
        let first = chars.next().unwrap_or('0');
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(format!("env key '{}' must start with a letter or '_'", self.key));
        }
        if !self
            .key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(format!(
                "env key '{}' may only contain letters, digits, and '_'",
                self.key
            ));
        }
        Ok(())
    }
}
