//! Context assembler: turns a conversation plus one message into the exact
//! process invocation for a turn.
//!
//! Pure functions only. Everything the invocation depends on is passed in,
//! so the same inputs always yield the same argument list.

use std::path::PathBuf;
use std::time::Duration;

use agentdeck_protocol::PermissionMode;

use super::models::{ConversationContext, EntryRole, EntryStatus, TranscriptEntry, Turn};
use crate::chat::translator::TOOL_RESULT_LIMIT;
use crate::config::tools_for_permission_mode;

/// Agent tool policy and process settings, resolved from configuration.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub command: String,
    pub default_model: String,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Value of `MAX_THINKING_TOKENS` for turns with thinking enabled.
    pub thinking_tokens: u32,
    /// Number of transcript entries replayed into each prompt.
    pub history_limit: usize,
    pub stderr_limit: usize,
    pub tool_result_limit: usize,
    pub turn_timeout: Option<Duration>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            default_model: "sonnet".to_string(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            thinking_tokens: 31999,
            history_limit: 20,
            stderr_limit: 4000,
            tool_result_limit: TOOL_RESULT_LIMIT,
            turn_timeout: None,
        }
    }
}

/// A fully resolved agent process invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// The prompt, also present as the final element of `args`.
    pub prompt: String,
}

/// Model for a turn: the message's own choice, else the configured default.
pub fn resolve_model(settings: &AgentSettings, requested: Option<&str>) -> String {
    requested
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(&settings.default_model)
        .to_string()
}

/// Build the invocation for `turn` within the conversation described by `ctx`.
///
/// `ctx.history` must not yet contain the turn's own user entry.
pub fn assemble(settings: &AgentSettings, ctx: &ConversationContext, turn: &Turn) -> Invocation {
    let prompt = render_prompt(
        &ctx.history,
        &turn.message.content,
        &turn.message.attachments,
        settings.history_limit,
    );

    let mut args: Vec<String> = vec![
        "--print".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
        "--model".into(),
        turn.model.clone(),
    ];

    if let Some(system_prompt) = settings.system_prompt.as_deref()
        && !system_prompt.trim().is_empty()
    {
        args.push("--append-system-prompt".into());
        args.push(system_prompt.to_string());
    }

    let allowed = match turn.mode {
        PermissionMode::Autonomous => Vec::new(),
        mode => tools_for_permission_mode(mode).unwrap_or_else(|| settings.allowed_tools.clone()),
    };
    if !allowed.is_empty() {
        args.push("--allowedTools".into());
        args.push(allowed.join(","));
    }
    if !settings.disallowed_tools.is_empty() {
        args.push("--disallowedTools".into());
        args.push(settings.disallowed_tools.join(","));
    }

    match turn.mode {
        PermissionMode::Readonly => {
            args.push("--permission-mode".into());
            args.push("plan".into());
        }
        PermissionMode::Autonomous => args.push("--dangerously-skip-permissions".into()),
        PermissionMode::Standard => {}
    }

    // The tool lists take several values; `--` keeps the prompt out of them
    args.push("--".into());
    args.push(prompt.clone());

    let mut env = Vec::new();
    if turn.message.thinking {
        env.push((
            "MAX_THINKING_TOKENS".to_string(),
            settings.thinking_tokens.to_string(),
        ));
    }

    Invocation {
        program: settings.command.clone(),
        args,
        env,
        cwd: ctx
            .project_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from),
        prompt,
    }
}

/// Render the prompt: prior transcript, then the new message, then any
/// attachment paths.
pub fn render_prompt(
    history: &[TranscriptEntry],
    content: &str,
    attachments: &[String],
    history_limit: usize,
) -> String {
    let usable: Vec<&TranscriptEntry> = history
        .iter()
        .filter(|e| e.status != EntryStatus::Failed && !e.content.trim().is_empty())
        .collect();
    let start = usable.len().saturating_sub(history_limit);

    let mut prompt = String::new();
    if history_limit > 0 && start < usable.len() {
        prompt.push_str("<conversation_history>\n");
        for entry in &usable[start..] {
            let speaker = match entry.role {
                EntryRole::User => "User",
                EntryRole::Assistant => "Assistant",
            };
            prompt.push_str(speaker);
            prompt.push_str(": ");
            prompt.push_str(entry.content.trim());
            if entry.status == EntryStatus::Interrupted {
                prompt.push_str(" [interrupted]");
            }
            prompt.push('\n');
        }
        prompt.push_str("</conversation_history>\n\n");
    }

    prompt.push_str(content);

    if !attachments.is_empty() {
        prompt.push_str("\n\nAttached files:");
        for path in attachments {
            prompt.push_str("\n- ");
            prompt.push_str(path);
        }
    }

    prompt
}
