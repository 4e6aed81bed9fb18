//! Event translator: one stream-json line in, zero or more
//! [`NormalizedEvent`]s out.
//!
//! The translator is fed line by line for a single turn and keeps only the
//! bookkeeping that mapping needs: the text accumulated so far, the one
//! outstanding tool call, the agent session id, and the terminal verdict.
//! Lines that do not parse are logged and dropped; they never abort the
//! stream.

use agentdeck_protocol::NormalizedEvent;
use tracing::{debug, warn};

use crate::stream::{
    ContentBlock, StreamEvent, UserBlock, UserContent, describe_tool_use, flatten_tool_result,
    truncate_chars,
};

/// Upper bound on tool result text surfaced to clients. Truncation is lossy.
pub const TOOL_RESULT_LIMIT: usize = 2000;

/// The single tool call awaiting its result.
///
/// Tool invocation within a turn is assumed sequential, so one slot is
/// enough; a second invocation before the first completes replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
}

/// Everything the translator learned about a turn, handed over at close.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslatorOutcome {
    pub text: String,
    pub cost: Option<f64>,
    pub session_id: Option<String>,
    /// `TurnDone` or `TurnFailed` from the `result` record, if one arrived.
    pub terminal: Option<NormalizedEvent>,
}

#[derive(Debug)]
pub struct EventTranslator {
    text: String,
    pending_tool: Option<PendingToolCall>,
    session_id: Option<String>,
    cost: Option<f64>,
    terminal: Option<NormalizedEvent>,
    tool_result_limit: usize,
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::with_tool_result_limit(TOOL_RESULT_LIMIT)
    }

    pub fn with_tool_result_limit(tool_result_limit: usize) -> Self {
        Self {
            text: String::new(),
            pending_tool: None,
            session_id: None,
            cost: None,
            terminal: None,
            tool_result_limit,
        }
    }

    /// Translate one complete line of process output.
    pub fn translate_line(&mut self, line: &str) -> Vec<NormalizedEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let record = match StreamEvent::parse(trimmed) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, line = %truncate_chars(trimmed, 200), "dropping unparseable agent output line");
                return Vec::new();
            }
        };

        match record {
            StreamEvent::System { subtype, session_id } => {
                if let Some(id) = session_id {
                    debug!(subtype = %subtype, session_id = %id, "agent session acquired");
                    self.session_id = Some(id);
                }
                Vec::new()
            }
            StreamEvent::Assistant { message, session_id } => {
                if self.session_id.is_none() {
                    self.session_id = session_id;
                }
                let mut events = Vec::new();
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if text.is_empty() {
                                continue;
                            }
                            self.text.push_str(&text);
                            events.push(NormalizedEvent::TextDelta { text });
                        }
                        ContentBlock::ToolUse { name, input, id } => {
                            debug!(tool = %name, summary = %describe_tool_use(&name, &input), "tool invoked");
                            if let Some(previous) = self.pending_tool.replace(PendingToolCall {
                                id,
                                name: name.clone(),
                            }) {
                                warn!(
                                    replaced = %previous.name,
                                    tool = %name,
                                    "tool invoked while another call is outstanding"
                                );
                            }
                            events.push(NormalizedEvent::ToolInvoked { name, args: input });
                        }
                        ContentBlock::Other => {}
                    }
                }
                events
            }
            StreamEvent::User { message } => {
                let Some(message) = message else {
                    return Vec::new();
                };
                let UserContent::Blocks(blocks) = message.content else {
                    return Vec::new();
                };
                let mut events = Vec::new();
                for block in blocks {
                    let UserBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    else {
                        continue;
                    };
                    let Some(pending) = self.pending_tool.take() else {
                        warn!(
                            tool_use_id = tool_use_id.as_deref().unwrap_or(""),
                            "tool result with no pending tool call, dropping"
                        );
                        continue;
                    };
                    if let Some(id) = tool_use_id.as_deref()
                        && !pending.id.is_empty()
                        && id != pending.id
                    {
                        warn!(expected = %pending.id, got = %id, "tool result id does not match pending call");
                    }
                    let result = truncate_chars(&flatten_tool_result(&content), self.tool_result_limit);
                    events.push(NormalizedEvent::ToolCompleted {
                        name: pending.name,
                        result,
                    });
                }
                events
            }
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                total_cost_usd,
                cost_usd,
                session_id,
            } => {
                if self.session_id.is_none() {
                    self.session_id = session_id;
                }
                self.cost = total_cost_usd.or(cost_usd);
                if self.text.is_empty()
                    && !is_error
                    && let Some(result) = result.as_deref()
                {
                    self.text.push_str(result);
                }
                let terminal = if is_error && self.text.is_empty() {
                    let reason = result
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or_else(|| format!("Agent reported an error ({})", subtype));
                    NormalizedEvent::TurnFailed { reason }
                } else {
                    NormalizedEvent::TurnDone {
                        final_text: self.text.clone(),
                        cost: self.cost,
                        has_more: false,
                        interrupted: false,
                    }
                };
                self.terminal = Some(terminal.clone());
                vec![terminal]
            }
            StreamEvent::Other => Vec::new(),
        }
    }

    #[cfg(test)]
    fn accumulated_text(&self) -> &str {
        &self.text
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[cfg(test)]
    fn pending_tool(&self) -> Option<&PendingToolCall> {
        self.pending_tool.as_ref()
    }

    pub fn into_outcome(self) -> TranslatorOutcome {
        TranslatorOutcome {
            text: self.text,
            cost: self.cost,
            session_id: self.session_id,
            terminal: self.terminal,
        }
    }
}
