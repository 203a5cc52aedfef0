//! Session persistence.
//!
//! Conversation history is an append-only JSONL event log; session
//! metadata is a small JSON file next to it; per-session environment
//! (secrets delivered mid-conversation) is a third file that tools
//! read at invocation time. All three live under
//! `<data_dir>/sessions/<session_id>/`.
//!
//! Storage sits behind the [`SessionStore`] trait so the reconciler
//! and session engine never touch paths directly.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use aviary_protocol::events::ContextUsage;
use aviary_protocol::stream::AgentEvent;

const META_FILE: &str = "meta.json";
const EVENTS_FILE: &str = "events.jsonl";
const ENV_FILE: &str = "env.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session '{0}' not found")]
    NotFound(String),
}

/// Durable per-session metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Canonical session id assigned by the agent.
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Canonical id this session was resumed from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    /// Most recent context usage snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_usage: Option<ContextUsage>,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>, cwd: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            name: None,
            cwd,
            created_at: now,
            last_active_at: now,
            resumed_from: None,
            last_usage: None,
        }
    }
}

/// Persistence seam for session history, metadata, and environment.
pub trait SessionStore: Send + Sync {
    /// Append one event to the session's conversation log.
    fn append_event(&self, session_id: &str, event: &AgentEvent) -> Result<(), StoreError>;

    /// Read the full event log in order. Unparseable lines are skipped
    /// with a warning.
    fn read_events(&self, session_id: &str) -> Result<Vec<AgentEvent>, StoreError>;

    fn save_meta(&self, meta: &SessionMeta) -> Result<(), StoreError>;

    fn load_meta(&self, session_id: &str) -> Result<Option<SessionMeta>, StoreError>;

    fn list_sessions(&self) -> Result<Vec<SessionMeta>, StoreError>;

    /// Set one environment key for the session. Written durably before
    /// any pending request that delivered it is resolved.
    fn set_env(&self, session_id: &str, key: &str, value: &str) -> Result<(), StoreError>;

    fn read_env(&self, session_id: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Whether a user message was logged after the message containing
    /// `tool_use_id`. Used to retire pending input requests the
    /// conversation has moved past.
    fn user_message_follows(&self, session_id: &str, tool_use_id: &str) -> Result<bool, StoreError> {
        let events = self.read_events(session_id)?;
        let mut seen_tool_use = false;
        for event in &events {
            match event {
                AgentEvent::Assistant { message, .. } if !seen_tool_use => {
                    seen_tool_use = message.content.iter().any(|b| {
                        matches!(
                            b,
                            aviary_protocol::ContentBlock::ToolUse { id, .. } if id == tool_use_id
                        )
                    });
                }
                AgentEvent::User { message, .. } if seen_tool_use => {
                    // Tool-result deliveries are mechanical echoes, not
                    // the human moving on.
                    if message.content.tool_results().is_empty() {
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }
}

/// Filesystem-backed [`SessionStore`].
pub struct FsSessionStore {
    data_dir: PathBuf,
}

impl FsSessionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(session_id)
    }

    fn ensure_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl SessionStore for FsSessionStore {
    fn append_event(&self, session_id: &str, event: &AgentEvent) -> Result<(), StoreError> {
        let dir = self.ensure_dir(session_id)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn read_events(&self, session_id: &str) -> Result<Vec<AgentEvent>, StoreError> {
        let path = self.session_dir(session_id).join(EVENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("skipping corrupt log line in session '{session_id}': {e}"),
            }
        }
        Ok(events)
    }

    fn save_meta(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        let dir = self.ensure_dir(&meta.session_id)?;
        let bytes = serde_json::to_vec_pretty(meta)?;
        Self::write_atomic(&dir.join(META_FILE), &bytes)
    }

    fn load_meta(&self, session_id: &str) -> Result<Option<SessionMeta>, StoreError> {
        let path = self.session_dir(session_id).join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let meta = serde_json::from_slice(&fs::read(path)?)?;
        Ok(Some(meta))
    }

    fn list_sessions(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let sessions_dir = self.data_dir.join("sessions");
        if !sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let mut metas = Vec::new();
        for entry in fs::read_dir(sessions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load_meta(&id) {
                Ok(Some(meta)) => metas.push(meta),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable session meta '{id}': {e}"),
            }
        }
        metas.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(metas)
    }

    fn set_env(&self, session_id: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut env = self.read_env(session_id)?;
        env.insert(key.to_string(), value.to_string());
        let dir = self.ensure_dir(session_id)?;
        let bytes = serde_json::to_vec_pretty(&env)?;
        Self::write_atomic(&dir.join(ENV_FILE), &bytes)
    }

    fn read_env(&self, session_id: &str) -> Result<HashMap<String, String>, StoreError> {
        let path = self.session_dir(session_id).join(ENV_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let env = serde_json::from_slice(&fs::read(path)?)?;
        Ok(env)
    }
}
