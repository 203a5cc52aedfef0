//! HTTP client for the in-container runner API.
//!
//! Each agent container exposes the session engine on one port, which
//! the lifecycle manager learns at start time. This client is a thin
//! typed wrapper over that API; the host never talks to the agent CLI
//! directly.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use aviary_protocol::events::{ContextUsage, EnvUpdate};
use aviary_protocol::input::PendingInputNotice;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session listing entry as served by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub last_usage: Option<ContextUsage>,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

/// Client bound to one agent container.
#[derive(Debug, Clone)]
pub struct AgentApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl AgentApiClient {
    /// Build a client for a runner reachable on the given host port.
    pub fn for_port(port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base_url: format!("http://127.0.0.1:{port}"),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Quick liveness probe against the runner.
    pub async fn healthy(&self) -> bool {
        match self.http.get(self.url("/healthz")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn create_session(
        &self,
        message: &str,
        name: Option<&str>,
        cwd: Option<&str>,
    ) -> Result<String> {
        let response = self
            .http
            .post(self.url("/sessions"))
            .json(&CreateSessionRequest { message, name, cwd })
            .send()
            .await
            .context("creating session")?;
        let response = check(response).await?;
        let created: CreateSessionResponse =
            response.json().await.context("decoding session id")?;
        Ok(created.session_id)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let response = self
            .http
            .get(self.url("/sessions"))
            .send()
            .await
            .context("listing sessions")?;
        check(response)
            .await?
            .json()
            .await
            .context("decoding session list")
    }

    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/messages")))
            .json(&json!({ "text": text }))
            .send()
            .await
            .context("sending message")?;
        check(response).await.map(drop)
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/sessions/{session_id}/interrupt")))
            .send()
            .await
            .context("interrupting session")?;
        check(response).await.map(drop)
    }

    /// Blocking tool calls still waiting on a human.
    pub async fn pending_inputs(&self, session_id: &str) -> Result<Vec<PendingInputNotice>> {
        let response = self
            .http
            .get(self.url(&format!("/sessions/{session_id}/pending")))
            .send()
            .await
            .context("listing pending inputs")?;
        check(response)
            .await?
            .json()
            .await
            .context("decoding pending inputs")
    }

    pub async fn resolve_input(
        &self,
        session_id: &str,
        tool_use_id: &str,
        value: Value,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!(
                "/sessions/{session_id}/pending/{tool_use_id}/resolve"
            )))
            .json(&value)
            .send()
            .await
            .context("resolving pending input")?;
        check(response).await.map(drop)
    }

    pub async fn reject_input(
        &self,
        session_id: &str,
        tool_use_id: &str,
        reason: &str,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!(
                "/sessions/{session_id}/pending/{tool_use_id}/reject"
            )))
            .json(&json!({ "reason": reason }))
            .send()
            .await
            .context("rejecting pending input")?;
        check(response).await.map(drop)
    }

    /// Deliver a configuration value to the session's env store.
    pub async fn update_env(&self, session_id: &str, update: &EnvUpdate) -> Result<()> {
        let response = self
            .http
            .put(self.url(&format!("/sessions/{session_id}/env")))
            .json(update)
            .send()
            .await
            .context("updating session env")?;
        check(response).await.map(drop)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("runner returned {status}: {body}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_rooted_at_the_learned_port() {
        let client = AgentApiClient::for_port(32768).unwrap();
        assert_eq!(client.url("/sessions"), "http://127.0.0.1:32768/sessions");
        assert_eq!(
            client.url("/sessions/abc/pending/toolu_1/resolve"),
            "http://127.0.0.1:32768/sessions/abc/pending/toolu_1/resolve"
        );
    }

    #[test]
    fn session_summary_tolerates_missing_optionals() {
        let summary: SessionSummary = serde_json::from_value(json!({
            "session_id": "s1",
            "cwd": "/workspace",
            "created_at": "2025-05-01T10:00:00Z",
            "last_active_at": "2025-05-01T10:05:00Z"
        }))
        .unwrap();
        assert_eq!(summary.session_id, "s1");
        assert!(summary.name.is_none());
        assert!(summary.last_usage.is_none());
    }
}
