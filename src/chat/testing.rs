//! Test doubles shared by the chat unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agentdeck_protocol::PermissionMode;
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Notify, mpsc, oneshot};

use super::context::Invocation;
use super::db::ConversationStore;
use super::models::*;
use super::supervisor::{AgentChild, AgentLauncher, SpawnedAgent};
use crate::errors::SupervisorError;

/// Test side of one launched agent.
pub(crate) struct AgentControls {
    pub invocation: Invocation,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    pub exit: oneshot::Sender<i32>,
}

impl AgentControls {
    pub async fn emit(&mut self, line: &str) {
        self.stdout.write_all(line.as_bytes()).await.unwrap();
        self.stdout.write_all(b"\n").await.unwrap();
        self.stdout.flush().await.unwrap();
    }

    pub async fn emit_stderr(&mut self, text: &str) {
        self.stderr.write_all(text.as_bytes()).await.unwrap();
    }

    /// Close both pipes and exit with `code`.
    pub fn finish(self, code: i32) {
        let Self {
            stdout, stderr, exit, ..
        } = self;
        drop(stdout);
        drop(stderr);
        let _ = exit.send(code);
    }

    /// Close both pipes without exiting (what a killed agent looks like).
    pub fn hang_up(self) {
        let Self { stdout, stderr, .. } = self;
        drop(stdout);
        drop(stderr);
    }
}

pub(crate) fn text_line(text: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": {"content": [{"type": "text", "text": text}]}
    })
    .to_string()
}

pub(crate) fn result_line(cost: f64) -> String {
    serde_json::json!({"type": "result", "subtype": "success", "is_error": false, "total_cost_usd": cost})
        .to_string()
}

/// Live/max-live counters for one launcher.
#[derive(Default)]
pub(crate) struct LiveCounter {
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
}

impl LiveCounter {
    fn enter(&self) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedChild {
    exit: Option<oneshot::Receiver<i32>>,
    killed: Arc<Notify>,
    was_killed: bool,
    counter: Arc<LiveCounter>,
    exited: bool,
}

impl ScriptedChild {
    fn mark_exited(&mut self) {
        if !self.exited {
            self.exited = true;
            self.counter.leave();
        }
    }
}

#[async_trait]
impl AgentChild for ScriptedChild {
    fn start_kill(&mut self) -> std::io::Result<()> {
        self.was_killed = true;
        self.killed.notify_one();
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let code = if self.was_killed {
            None
        } else {
            let killed = self.killed.clone();
            match self.exit.take() {
                Some(rx) => tokio::select! {
                    code = rx => code.ok(),
                    _ = killed.notified() => None,
                },
                None => None,
            }
        };
        self.mark_exited();
        Ok(code)
    }
}

/// Launcher whose agents are driven by the test through [`AgentControls`].
pub(crate) struct ScriptedLauncher {
    controls: mpsc::UnboundedSender<AgentControls>,
    pub launches: AtomicUsize,
    pub counter: Arc<LiveCounter>,
}

pub(crate) fn scripted_launcher() -> (Arc<ScriptedLauncher>, mpsc::UnboundedReceiver<AgentControls>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(ScriptedLauncher {
        controls: tx,
        launches: AtomicUsize::new(0),
        counter: Arc::new(LiveCounter::default()),
    });
    (launcher, rx)
}

impl ScriptedLauncher {
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.counter.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, invocation: &Invocation) -> Result<SpawnedAgent, SupervisorError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.counter.enter();
        let (out_agent, out_test) = tokio::io::duplex(64 * 1024);
        let (err_agent, err_test) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = self.controls.send(AgentControls {
            invocation: invocation.clone(),
            stdout: out_test,
            stderr: err_test,
            exit: exit_tx,
        });
        Ok(SpawnedAgent {
            stdout: Box::new(out_agent),
            stderr: Some(Box::new(err_agent)),
            child: Box::new(ScriptedChild {
                exit: Some(exit_rx),
                killed: Arc::new(Notify::new()),
                was_killed: false,
                counter: self.counter.clone(),
                exited: false,
            }),
        })
    }
}

/// Launcher that always fails to spawn.
pub(crate) struct FailingLauncher;

#[async_trait]
impl AgentLauncher for FailingLauncher {
    async fn launch(&self, invocation: &Invocation) -> Result<SpawnedAgent, SupervisorError> {
        Err(SupervisorError::SpawnFailed {
            program: invocation.program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
        })
    }
}

/// In-memory conversation store.
#[derive(Default)]
pub(crate) struct MemoryStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    entries: Mutex<Vec<TranscriptEntry>>,
}

impl MemoryStore {
    pub fn with_conversation(id: &str) -> Arc<Self> {
        let store = Self::default();
        store.conversations.lock().unwrap().insert(
            id.to_string(),
            Conversation {
                id: id.to_string(),
                project_id: None,
                title: String::new(),
                mode: PermissionMode::Standard,
                agent_session_id: None,
                last_cost: None,
                created_at: String::new(),
                updated_at: String::new(),
            },
        );
        Arc::new(store)
    }

    pub fn transcript(&self, conversation_id: &str) -> Vec<TranscriptEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.lock().unwrap().get(conversation_id).cloned()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn conversation_exists(&self, conversation_id: &str) -> Result<bool> {
        Ok(self.conversations.lock().unwrap().contains_key(conversation_id))
    }

    async fn load_context(
        &self,
        conversation_id: &str,
        history_limit: usize,
    ) -> Result<ConversationContext> {
        let conversation = self
            .conversation(conversation_id)
            .ok_or_else(|| anyhow::anyhow!("Conversation {} not found", conversation_id))?;
        let mut history = self.transcript(conversation_id);
        let skip = history.len().saturating_sub(history_limit);
        history.drain(..skip);
        Ok(ConversationContext {
            conversation,
            project_path: None,
            history,
        })
    }

    async fn append_transcript(
        &self,
        conversation_id: &str,
        entry: NewTranscriptEntry,
    ) -> Result<TranscriptEntry> {
        let mut entries = self.entries.lock().unwrap();
        let saved = TranscriptEntry {
            id: entries.len() as i64 + 1,
            conversation_id: conversation_id.to_string(),
            role: entry.role,
            content: entry.content,
            status: entry.status,
            cost: entry.cost,
            tool_calls: entry.tool_calls,
            attachments: entry.attachments,
            model: entry.model,
            created_at: String::new(),
        };
        entries.push(saved.clone());
        Ok(saved)
    }

    async fn record_turn_cost(&self, conversation_id: &str, cost: Option<f64>) -> Result<()> {
        if let Some(c) = self.conversations.lock().unwrap().get_mut(conversation_id) {
            c.last_cost = cost;
        }
        Ok(())
    }

    async fn record_agent_session(&self, conversation_id: &str, session_id: &str) -> Result<()> {
        if let Some(c) = self.conversations.lock().unwrap().get_mut(conversation_id) {
            c.agent_session_id = Some(session_id.to_string());
        }
        Ok(())
    }
}
