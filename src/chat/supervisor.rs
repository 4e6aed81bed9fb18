//! Process supervisor: owns the lifecycle of agent processes, at most one
//! live process per conversation.
//!
//! Each started process gets its own task that reads raw stdout chunks,
//! splits them into lines, runs them through an [`EventTranslator`] and
//! forwards the normalized events. When the process is gone the task sends
//! exactly one [`SupervisorEvent::Closed`] carrying everything accumulated,
//! including output produced before a kill.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agentdeck_protocol::NormalizedEvent;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::Invocation;
use super::lines::LineSplitter;
use super::translator::{EventTranslator, TranslatorOutcome};
use crate::errors::SupervisorError;
use crate::stream::truncate_chars;

/// How long stdout may keep draining after a kill. Grandchildren can hold
/// the pipe open after the agent itself has died.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Handle to a spawned agent child process.
#[async_trait]
pub trait AgentChild: Send {
    /// Begin termination without waiting for it.
    fn start_kill(&mut self) -> std::io::Result<()>;

    /// Wait for exit. `None` when the process died from a signal.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;
}

/// A started agent: its output pipes and child handle.
pub struct SpawnedAgent {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub child: Box<dyn AgentChild>,
}

/// Abstraction over process spawning for testability.
/// Real implementation: `CliLauncher`.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, invocation: &Invocation) -> Result<SpawnedAgent, SupervisorError>;
}

/// Launches the agent CLI as a real OS process.
#[derive(Debug, Default, Clone)]
pub struct CliLauncher;

struct CliChild(tokio::process::Child);

#[async_trait]
impl AgentChild for CliChild {
    fn start_kill(&mut self) -> std::io::Result<()> {
        self.0.start_kill()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }
}

#[async_trait]
impl AgentLauncher for CliLauncher {
    async fn launch(&self, invocation: &Invocation) -> Result<SpawnedAgent, SupervisorError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            program: invocation.program.clone(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();

        Ok(SpawnedAgent {
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            child: Box::new(CliChild(child)),
        })
    }
}

/// Final report for one started process. Sent exactly once per `start`.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub conversation_id: String,
    pub turn_id: u64,
    /// `None` when killed by a signal or when the wait itself failed.
    pub exit_code: Option<i32>,
    pub text: String,
    pub cost: Option<f64>,
    /// Verdict of the `result` record, if the process emitted one.
    pub terminal: Option<NormalizedEvent>,
    /// Captured stderr, bounded.
    pub stderr: String,
    pub kill_requested: bool,
    pub session_id: Option<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Event {
        conversation_id: String,
        turn_id: u64,
        event: NormalizedEvent,
    },
    Closed(ProcessExit),
}

struct LiveProcess {
    turn_id: u64,
    kill: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct OutputLimits {
    stderr: usize,
    tool_result: usize,
}

/// Tracks the live agent process of every conversation.
pub struct ProcessSupervisor {
    launcher: Arc<dyn AgentLauncher>,
    live: Arc<Mutex<HashMap<String, LiveProcess>>>,
    limits: OutputLimits,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn AgentLauncher>, stderr_limit: usize, tool_result_limit: usize) -> Self {
        Self {
            launcher,
            live: Arc::new(Mutex::new(HashMap::new())),
            limits: OutputLimits {
                stderr: stderr_limit,
                tool_result: tool_result_limit,
            },
        }
    }

    /// Start a process for `conversation_id`, replacing any live one.
    ///
    /// Events and the final close report are delivered to `sink`. On error
    /// nothing was started and no close report will follow.
    pub async fn start<T>(
        &self,
        conversation_id: &str,
        turn_id: u64,
        invocation: &Invocation,
        sink: mpsc::Sender<T>,
    ) -> Result<(), SupervisorError>
    where
        T: From<SupervisorEvent> + Send + 'static,
    {
        if self.kill(conversation_id) {
            warn!(
                conversation_id,
                turn_id, "replacing a live agent process for this conversation"
            );
        }

        let spawned = self.launcher.launch(invocation).await?;
        let kill = CancellationToken::new();
        {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = live.insert(
                conversation_id.to_string(),
                LiveProcess {
                    turn_id,
                    kill: kill.clone(),
                },
            ) {
                previous.kill.cancel();
            }
        }

        info!(conversation_id, turn_id, program = %invocation.program, "agent process started");

        tokio::spawn(run_process(
            self.live.clone(),
            conversation_id.to_string(),
            turn_id,
            spawned,
            kill,
            sink,
            self.limits,
        ));
        Ok(())
    }

    /// Request termination of the conversation's live process.
    ///
    /// Returns false if nothing was running. The close report still arrives
    /// through the sink given to `start`.
    pub fn kill(&self, conversation_id: &str) -> bool {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        match live.get(conversation_id) {
            Some(process) => {
                debug!(conversation_id, turn_id = process.turn_id, "kill requested");
                process.kill.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn is_live(&self, conversation_id: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(conversation_id)
    }

    /// Turn id of the live process for a conversation.
    #[cfg(test)]
    fn live_turn(&self, conversation_id: &str) -> Option<u64> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .map(|p| p.turn_id)
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Kill every live process.
    pub fn shutdown(&self) {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        for process in live.values() {
            process.kill.cancel();
        }
    }
}

async fn run_process<T>(
    live: Arc<Mutex<HashMap<String, LiveProcess>>>,
    conversation_id: String,
    turn_id: u64,
    spawned: SpawnedAgent,
    kill: CancellationToken,
    sink: mpsc::Sender<T>,
    limits: OutputLimits,
) where
    T: From<SupervisorEvent> + Send + 'static,
{
    let SpawnedAgent {
        mut stdout,
        stderr,
        mut child,
    } = spawned;

    let stderr_task = stderr.map(|s| tokio::spawn(read_bounded(s, limits.stderr)));

    let mut splitter = LineSplitter::new();
    let mut translator = EventTranslator::with_tool_result_limit(limits.tool_result);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut kill_sent = false;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        let read = match drain_deadline {
            Some(deadline) => tokio::select! {
                r = stdout.read(&mut buf) => r,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(conversation_id = %conversation_id, turn_id, "stdout still open after kill, giving up on it");
                    break;
                }
            },
            None => tokio::select! {
                r = stdout.read(&mut buf) => r,
                _ = kill.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!(conversation_id = %conversation_id, error = %e, "kill signal failed");
                    }
                    kill_sent = true;
                    drain_deadline = Some(Instant::now() + KILL_DRAIN_GRACE);
                    continue;
                }
            },
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    forward(&sink, &conversation_id, turn_id, translator.translate_line(&line)).await;
                }
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "reading agent stdout failed");
                break;
            }
        }
    }

    if let Some(tail) = splitter.finish() {
        forward(&sink, &conversation_id, turn_id, translator.translate_line(&tail)).await;
    }

    let exit_code = loop {
        if kill.is_cancelled() && !kill_sent {
            if let Err(e) = child.start_kill() {
                debug!(conversation_id = %conversation_id, error = %e, "kill signal failed");
            }
            kill_sent = true;
        }
        if kill_sent {
            break child.wait().await;
        }
        tokio::select! {
            r = child.wait() => break r,
            _ = kill.cancelled() => continue,
        }
    };
    let exit_code = match exit_code {
        Ok(code) => code,
        Err(e) => {
            warn!(conversation_id = %conversation_id, error = %e, "waiting for agent process failed");
            None
        }
    };

    let stderr = match stderr_task {
        Some(mut handle) => {
            match tokio::time::timeout(KILL_DRAIN_GRACE, &mut handle).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    warn!(conversation_id = %conversation_id, error = %e, "stderr reader panicked");
                    String::new()
                }
                Err(_) => {
                    handle.abort();
                    String::new()
                }
            }
        }
        None => String::new(),
    };

    {
        let mut table = live.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(&conversation_id).is_some_and(|p| p.turn_id == turn_id) {
            table.remove(&conversation_id);
        }
    }

    let TranslatorOutcome {
        text,
        cost,
        session_id,
        terminal,
    } = translator.into_outcome();

    info!(
        conversation_id = %conversation_id,
        turn_id,
        exit_code = ?exit_code,
        kill_requested = kill.is_cancelled(),
        text_len = text.len(),
        "agent process closed"
    );

    let report = ProcessExit {
        conversation_id,
        turn_id,
        exit_code,
        text,
        cost,
        terminal,
        stderr,
        kill_requested: kill.is_cancelled(),
        session_id,
    };
    if sink.send(SupervisorEvent::Closed(report).into()).await.is_err() {
        debug!(turn_id, "close report dropped, receiver gone");
    }
}

async fn forward<T>(
    sink: &mpsc::Sender<T>,
    conversation_id: &str,
    turn_id: u64,
    events: Vec<NormalizedEvent>,
) where
    T: From<SupervisorEvent>,
{
    for event in events {
        let msg = SupervisorEvent::Event {
            conversation_id: conversation_id.to_string(),
            turn_id,
            event,
        };
        if sink.send(msg.into()).await.is_err() {
            return;
        }
    }
}

/// Read a stream to the end, keeping at most `limit` characters.
async fn read_bounded(mut reader: Box<dyn AsyncRead + Send + Unpin>, limit: usize) -> String {
    let byte_cap = limit.saturating_mul(4);
    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = byte_cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    truncate_chars(String::from_utf8_lossy(&kept).trim(), limit)
}
