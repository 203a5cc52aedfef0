//! Blocking tool vocabulary for human-in-the-loop requests.
//!
//! A small fixed set of tool names pauses the agent until a human
//! answers: the reconciler detects a completed `tool_use` block with
//! one of these names, parses its accumulated input JSON into the
//! matching argument struct, and publishes a [`PendingInputNotice`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool names that block the agent until resolved by a human.
pub const BLOCKING_TOOLS: [&str; 5] = [
    "request_secret",
    "request_account",
    "schedule_task",
    "ask_user",
    "request_file",
];

pub fn is_blocking_tool(name: &str) -> bool {
    BLOCKING_TOOLS.contains(&name)
}

/// Which blocking tool produced a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRequestKind {
    Secret,
    Account,
    ScheduleTask,
    AskUser,
    File,
}

impl InputRequestKind {
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "request_secret" => Some(Self::Secret),
            "request_account" => Some(Self::Account),
            "schedule_task" => Some(Self::ScheduleTask),
            "ask_user" => Some(Self::AskUser),
            "request_file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn tool_name(self) -> &'static str {
        match self {
            Self::Secret => "request_secret",
            Self::Account => "request_account",
            Self::ScheduleTask => "schedule_task",
            Self::AskUser => "ask_user",
            Self::File => "request_file",
        }
    }
}

/// Arguments of a `request_secret` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRequestArgs {
    /// Environment-style key the secret will be stored under.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Arguments of a `request_account` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRequestArgs {
    /// Provider slug, e.g. `github` or `google`.
    pub provider: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Arguments of a `schedule_task` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTaskArgs {
    pub prompt: String,
    /// Cron-style or natural-language schedule, opaque to the runner.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Arguments of an `ask_user` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskUserArgs {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Arguments of a `request_file` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequestArgs {
    pub description: String,
    /// Accepted MIME types or extensions, free-form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<String>,
}

/// Parsed arguments for any blocking tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputRequestArgs {
    Secret(SecretRequestArgs),
    Account(AccountRequestArgs),
    ScheduleTask(ScheduleTaskArgs),
    AskUser(AskUserArgs),
    File(FileRequestArgs),
}

impl InputRequestArgs {
    /// Parse raw tool input JSON according to the tool kind.
    pub fn parse(kind: InputRequestKind, input: &Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            InputRequestKind::Secret => Self::Secret(serde_json::from_value(input.clone())?),
            InputRequestKind::Account => Self::Account(serde_json::from_value(input.clone())?),
            InputRequestKind::ScheduleTask => {
                Self::ScheduleTask(serde_json::from_value(input.clone())?)
            }
            InputRequestKind::AskUser => Self::AskUser(serde_json::from_value(input.clone())?),
            InputRequestKind::File => Self::File(serde_json::from_value(input.clone())?),
        })
    }
}

/// A request waiting on a human, keyed by the tool-use id of the call
/// that raised it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInputNotice {
    pub tool_use_id: String,
    pub kind: InputRequestKind,
    pub args: InputRequestArgs,
    pub created_at: DateTime<Utc>,
}
