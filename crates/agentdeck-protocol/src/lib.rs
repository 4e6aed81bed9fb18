//! Realtime wire types for agentdeck.
//!
//! Three families live here:
//! - [`NormalizedEvent`]: one protocol-agnostic unit of streamed agent output,
//!   produced by the server's event translator.
//! - [`ClientMessage`]: what a browser connection may send.
//! - [`ServerMessage`]: what the server pushes back.
//!
//! Every server message that concerns a conversation carries its
//! `conversationId`, so one connection can watch several conversations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Permission level of a conversation, gating which tools the agent may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Read-only tools, agent runs in plan mode
    Readonly,
    /// Configured allow/deny tool lists (default)
    #[default]
    Standard,
    /// All tools, no permission prompts
    Autonomous,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Readonly => "readonly",
            Self::Standard => "standard",
            Self::Autonomous => "autonomous",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "readonly" => Ok(Self::Readonly),
            "standard" => Ok(Self::Standard),
            "autonomous" => Ok(Self::Autonomous),
            _ => Err(format!(
                "Invalid permission mode '{}'. Valid values: readonly, standard, autonomous",
                s
            )),
        }
    }
}

/// One unit of streamed agent output after translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum NormalizedEvent {
    TextDelta {
        text: String,
    },
    ToolInvoked {
        name: String,
        args: Value,
    },
    /// `result` is truncated for transport and may be lossy.
    ToolCompleted {
        name: String,
        result: String,
    },
    TurnDone {
        final_text: String,
        cost: Option<f64>,
        has_more: bool,
        interrupted: bool,
    },
    TurnFailed {
        reason: String,
    },
}

impl NormalizedEvent {
    /// True for `turn-done` and `turn-failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnDone { .. } | Self::TurnFailed { .. })
    }
}

/// Messages a client sends over its realtime connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Send {
        conversation_id: String,
        content: String,
        #[serde(default)]
        attachments: Vec<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        thinking: bool,
        #[serde(default)]
        mode: Option<PermissionMode>,
    },
    Stop {
        conversation_id: String,
    },
    Subscribe {
        conversation_id: String,
    },
    Unsubscribe {
        conversation_id: String,
    },
}

impl ClientMessage {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Send { conversation_id, .. }
            | Self::Stop { conversation_id }
            | Self::Subscribe { conversation_id }
            | Self::Unsubscribe { conversation_id } => conversation_id,
        }
    }
}

/// Messages the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Chunk {
        conversation_id: String,
        content: String,
    },
    ToolUse {
        conversation_id: String,
        tool: String,
        input: Value,
    },
    ToolResult {
        conversation_id: String,
        tool: String,
        result: String,
    },
    Done {
        conversation_id: String,
        cost: Option<f64>,
        has_more: bool,
        interrupted: bool,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        error: String,
    },
    /// Sent on connect (all running conversations) and on a mid-turn subscribe.
    Streaming {
        conversation_ids: Vec<String>,
    },
}

impl ServerMessage {
    /// Wrap a normalized event for delivery to viewers of `conversation_id`.
    pub fn from_event(conversation_id: &str, event: NormalizedEvent) -> Self {
        let conversation_id = conversation_id.to_string();
        match event {
            NormalizedEvent::TextDelta { text } => Self::Chunk {
                conversation_id,
                content: text,
            },
            NormalizedEvent::ToolInvoked { name, args } => Self::ToolUse {
                conversation_id,
                tool: name,
                input: args,
            },
            NormalizedEvent::ToolCompleted { name, result } => Self::ToolResult {
                conversation_id,
                tool: name,
                result,
            },
            NormalizedEvent::TurnDone {
                cost,
                has_more,
                interrupted,
                ..
            } => Self::Done {
                conversation_id,
                cost,
                has_more,
                interrupted,
            },
            NormalizedEvent::TurnFailed { reason } => Self::Error {
                conversation_id: Some(conversation_id),
                error: reason,
            },
        }
    }

    pub fn error(conversation_id: Option<&str>, error: impl Into<String>) -> Self {
        Self::Error {
            conversation_id: conversation_id.map(str::to_string),
            error: error.into(),
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Chunk { conversation_id, .. }
            | Self::ToolUse { conversation_id, .. }
            | Self::ToolResult { conversation_id, .. }
            | Self::Done { conversation_id, .. } => Some(conversation_id),
            Self::Error { conversation_id, .. } => conversation_id.as_deref(),
            Self::Streaming { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_message_parses_with_optional_fields() {
        let json = r#"{"type":"send","conversationId":"c1","content":"fix bug"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Send {
                conversation_id,
                content,
                attachments,
                model,
                thinking,
                mode,
            } => {
                assert_eq!(conversation_id, "c1");
                assert_eq!(content, "fix bug");
                assert!(attachments.is_empty());
                assert!(model.is_none());
                assert!(!thinking);
                assert!(mode.is_none());
            }
            _ => panic!("Expected Send"),
        }
    }

    #[test]
    fn test_send_message_parses_full_payload() {
        let json = r#"{"type":"send","conversationId":"c1","content":"look",
            "attachments":["/tmp/a.png"],"model":"opus","thinking":true,"mode":"readonly"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::Send {
            attachments,
            model,
            thinking,
            mode,
            ..
        } = msg
        else {
            panic!("Expected Send");
        };
        assert_eq!(attachments, vec!["/tmp/a.png".to_string()]);
        assert_eq!(model.as_deref(), Some("opus"));
        assert!(thinking);
        assert_eq!(mode, Some(PermissionMode::Readonly));
    }

    #[test]
    fn test_stop_message_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"stop","conversationId":"c9"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Stop {
                conversation_id: "c9".to_string()
            }
        );
        assert_eq!(msg.conversation_id(), "c9");
    }

    #[test]
    fn test_unknown_client_message_type_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"dance","conversationId":"c"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_done_serializes_camel_case() {
        let msg = ServerMessage::Done {
            conversation_id: "c1".to_string(),
            cost: Some(0.01),
            has_more: true,
            interrupted: false,
        };
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "done");
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["hasMore"], true);
        assert_eq!(value["interrupted"], false);
        assert_eq!(value["cost"], 0.01);
    }

    #[test]
    fn test_streaming_serializes_id_list() {
        let msg = ServerMessage::Streaming {
            conversation_ids: vec!["a".to_string(), "b".to_string()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"streaming","conversationIds":["a","b"]}"#);
    }

    #[test]
    fn test_connection_level_error_omits_conversation_id() {
        let json = serde_json::to_string(&ServerMessage::error(None, "bad json")).unwrap();
        assert_eq!(json, r#"{"type":"error","error":"bad json"}"#);
    }

    #[test]
    fn test_from_event_maps_each_variant() {
        let chunk = ServerMessage::from_event(
            "c",
            NormalizedEvent::TextDelta {
                text: "hi".to_string(),
            },
        );
        assert!(matches!(chunk, ServerMessage::Chunk { ref content, .. } if content == "hi"));

        let tool = ServerMessage::from_event(
            "c",
            NormalizedEvent::ToolInvoked {
                name: "Read".to_string(),
                args: serde_json::json!({"file_path": "a.rs"}),
            },
        );
        assert!(matches!(tool, ServerMessage::ToolUse { ref tool, .. } if tool == "Read"));

        let failed = ServerMessage::from_event(
            "c",
            NormalizedEvent::TurnFailed {
                reason: "boom".to_string(),
            },
        );
        assert_eq!(failed.conversation_id(), Some("c"));
        assert!(matches!(failed, ServerMessage::Error { ref error, .. } if error == "boom"));
    }

    #[test]
    fn test_normalized_event_terminal_flag() {
        assert!(NormalizedEvent::TurnFailed { reason: String::new() }.is_terminal());
        assert!(!NormalizedEvent::TextDelta { text: String::new() }.is_terminal());
    }

    #[test]
    fn test_permission_mode_parse_and_display() {
        assert_eq!("READONLY".parse::<PermissionMode>().unwrap(), PermissionMode::Readonly);
        assert_eq!(PermissionMode::Autonomous.to_string(), "autonomous");
        assert!("yolo".parse::<PermissionMode>().is_err());
        assert_eq!(PermissionMode::default(), PermissionMode::Standard);
    }
}
