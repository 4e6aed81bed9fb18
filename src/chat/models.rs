use std::str::FromStr;

use agentdeck_protocol::PermissionMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub project_id: Option<i64>,
    pub title: String,
    pub mode: PermissionMode,
    /// Session id reported by the agent process. Bookkeeping only.
    pub agent_session_id: Option<String>,
    pub last_cost: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    User,
    Assistant,
}

impl EntryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for EntryRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Invalid entry role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Completed,
    Interrupted,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "interrupted" => Ok(Self::Interrupted),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid entry status: {}", s)),
        }
    }
}

/// A tool call made during an assistant turn, stored with its entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub input: Value,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: i64,
    pub conversation_id: String,
    pub role: EntryRole,
    pub content: String,
    pub status: EntryStatus,
    pub cost: Option<f64>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub attachments: Vec<String>,
    pub model: Option<String>,
    pub created_at: String,
}

/// Transcript entry to be appended; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTranscriptEntry {
    pub role: EntryRole,
    pub content: String,
    pub status: EntryStatus,
    pub cost: Option<f64>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub attachments: Vec<String>,
    pub model: Option<String>,
}

impl NewTranscriptEntry {
    pub fn user(message: &PendingMessage, model: &str) -> Self {
        Self {
            role: EntryRole::User,
            content: message.content.clone(),
            status: EntryStatus::Completed,
            cost: None,
            tool_calls: Vec::new(),
            attachments: message.attachments.clone(),
            model: Some(model.to_string()),
        }
    }

    pub fn assistant(
        text: String,
        interrupted: bool,
        cost: Option<f64>,
        tool_calls: Vec<ToolCallRecord>,
        model: &str,
    ) -> Self {
        Self {
            role: EntryRole::Assistant,
            content: text,
            status: if interrupted {
                EntryStatus::Interrupted
            } else {
                EntryStatus::Completed
            },
            cost,
            tool_calls,
            attachments: Vec::new(),
            model: Some(model.to_string()),
        }
    }

    /// Error marker written in place of an assistant reply.
    pub fn failure(reason: &str) -> Self {
        Self {
            role: EntryRole::Assistant,
            content: reason.to_string(),
            status: EntryStatus::Failed,
            cost: None,
            tool_calls: Vec::new(),
            attachments: Vec::new(),
            model: None,
        }
    }
}

/// A user message accepted for a conversation, possibly still queued.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingMessage {
    pub content: String,
    pub attachments: Vec<String>,
    pub model: Option<String>,
    pub thinking: bool,
    pub mode: Option<PermissionMode>,
}

impl PendingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }
}

/// One request/response cycle, created when a message is taken off the
/// queue for execution.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: u64,
    pub message: PendingMessage,
    pub model: String,
    pub mode: PermissionMode,
    pub state: TurnState,
    pub started_at: DateTime<Utc>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Turn {
    pub fn new(id: u64, message: PendingMessage, model: String, mode: PermissionMode) -> Self {
        Self {
            id,
            message,
            model,
            mode,
            state: TurnState::Pending,
            started_at: Utc::now(),
            tool_calls: Vec::new(),
        }
    }

    pub fn mark_running(&mut self) {
        if self.state == TurnState::Pending {
            self.state = TurnState::Running;
        }
    }

    /// Move to a terminal state. A turn that already ended keeps its state.
    pub fn finish(&mut self, state: TurnState) {
        debug_assert!(state.is_terminal());
        if !self.state.is_terminal() {
            self.state = state;
        }
    }

    pub fn record_tool_invoked(&mut self, name: &str, input: &Value) {
        self.tool_calls.push(ToolCallRecord {
            name: name.to_string(),
            input: input.clone(),
            result: None,
        });
    }

    /// Attach a result to the most recent call of `name` still missing one.
    pub fn record_tool_completed(&mut self, name: &str, result: &str) {
        if let Some(call) = self
            .tool_calls
            .iter_mut()
            .rev()
            .find(|c| c.name == name && c.result.is_none())
        {
            call.result = Some(result.to_string());
        }
    }
}

/// Everything the context assembler needs to know about a conversation.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub conversation: Conversation,
    /// Working directory of the owning project, if any.
    pub project_path: Option<String>,
    /// Transcript in chronological order, already limited by the store.
    pub history: Vec<TranscriptEntry>,
}
