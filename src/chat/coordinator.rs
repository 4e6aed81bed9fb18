//! Turn coordinator: one actor task per conversation.
//!
//! Every transition for a conversation (accepting a message, stopping,
//! subscribing, process events and the final close) is a command in that
//! conversation's mailbox and is handled by a single task, in order. This
//! gives the ordering guarantees without any per-conversation locking:
//!
//! - at most one turn runs at a time, and queued messages run FIFO;
//! - a turn's `done`/`error` is published before anything from the next turn;
//! - the final transcript write and the "is anything queued" check happen
//!   in the same step, so a message accepted concurrently is never lost
//!   or run twice.
//!
//! Actors are spawned on first use. One that sits idle with an empty queue
//! removes itself from the registry and is respawned by the next command.
//!
//! ```text
//!   accept ──► Idle ──spawn──► Running ◄──accept (enqueue)──┐
//!                ▲                │ close                   │
//!                │                ├─ ok, queue empty ──► Idle
//!                │                ├─ ok, queue non-empty ─► Running (next)
//!                └── failure ─────┘   (queue discarded)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agentdeck_protocol::{NormalizedEvent, ServerMessage};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::{self, AgentSettings, resolve_model};
use super::db::ConversationStore;
use super::gateway::{ConnectionId, Gateway};
use super::models::{NewTranscriptEntry, PendingMessage, Turn, TurnState};
use super::supervisor::{ProcessExit, ProcessSupervisor, SupervisorEvent};
use crate::errors::{CoordinatorError, GatewayError};

const MAILBOX_CAPACITY: usize = 256;

/// An idle actor with an empty queue exits after this long without commands.
const IDLE_RETIRE_AFTER: Duration = Duration::from_secs(30);

/// Reason given when a stop lands before the agent wrote anything.
pub const STOPPED_WITHOUT_OUTPUT: &str = "Stopped before the agent produced any output";

/// What `accept` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Started { turn_id: u64 },
    /// Waiting behind the running turn; `position` is 1-based.
    Queued { position: usize },
    /// The turn could not be started; the failure was already broadcast.
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorPhase {
    Idle,
    Running,
    RunningWithQueue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationStatus {
    pub phase: CoordinatorPhase,
    pub turn_id: Option<u64>,
    pub queued: usize,
}

impl ConversationStatus {
    fn idle() -> Self {
        Self {
            phase: CoordinatorPhase::Idle,
            turn_id: None,
            queued: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase != CoordinatorPhase::Idle
    }
}

/// How a finished process is classified.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { text: String, cost: Option<f64> },
    Interrupted { text: String, cost: Option<f64> },
    Failed { reason: String },
}

/// Classify a close report.
///
/// A stop request decides on accumulated text alone: partial output is an
/// interrupted success, no output is a failure. Without a stop, any text is
/// a success, and an empty clean exit is an empty success unless the
/// agent's own `result` record reported an error.
pub fn classify(exit: &ProcessExit, stop_requested: bool) -> TurnOutcome {
    let has_text = !exit.text.is_empty();

    if stop_requested || exit.kill_requested {
        return if has_text {
            TurnOutcome::Interrupted {
                text: exit.text.clone(),
                cost: exit.cost,
            }
        } else if !exit.stderr.is_empty() {
            TurnOutcome::Failed {
                reason: exit.stderr.clone(),
            }
        } else {
            TurnOutcome::Failed {
                reason: STOPPED_WITHOUT_OUTPUT.to_string(),
            }
        };
    }

    let reported_failure = match &exit.terminal {
        Some(NormalizedEvent::TurnFailed { reason }) => Some(reason.clone()),
        _ => None,
    };

    if has_text || (exit.success() && reported_failure.is_none()) {
        return TurnOutcome::Completed {
            text: exit.text.clone(),
            cost: exit.cost,
        };
    }

    let reason = reported_failure
        .or_else(|| (!exit.stderr.is_empty()).then(|| exit.stderr.clone()))
        .unwrap_or_else(|| match exit.exit_code {
            Some(code) => format!("Agent process exited with code {} and no output", code),
            None => "Agent process was terminated without producing output".to_string(),
        });
    TurnOutcome::Failed { reason }
}

pub(crate) enum ActorCommand {
    Accept {
        message: PendingMessage,
        reply: oneshot::Sender<AcceptOutcome>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        connection: ConnectionId,
        reply: oneshot::Sender<Result<bool, GatewayError>>,
    },
    Status {
        reply: oneshot::Sender<ConversationStatus>,
    },
    Supervisor(SupervisorEvent),
    TurnTimeout {
        turn_id: u64,
    },
}

impl From<SupervisorEvent> for ActorCommand {
    fn from(event: SupervisorEvent) -> Self {
        Self::Supervisor(event)
    }
}

struct ActorHandle {
    generation: u64,
    tx: mpsc::Sender<ActorCommand>,
    task: JoinHandle<()>,
}

type ActorRegistry = Arc<Mutex<HashMap<String, ActorHandle>>>;

struct Shared {
    supervisor: ProcessSupervisor,
    store: Arc<dyn ConversationStore>,
    gateway: Arc<Gateway>,
    settings: AgentSettings,
    next_turn_id: AtomicU64,
    next_actor: AtomicU64,
    shutdown: CancellationToken,
}

/// Entry point for everything that changes a conversation's turn state.
#[derive(Clone)]
pub struct TurnCoordinator {
    shared: Arc<Shared>,
    actors: ActorRegistry,
}

impl TurnCoordinator {
    pub fn new(
        supervisor: ProcessSupervisor,
        store: Arc<dyn ConversationStore>,
        gateway: Arc<Gateway>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                supervisor,
                store,
                gateway,
                settings,
                next_turn_id: AtomicU64::new(1),
                next_actor: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
            actors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.shared.gateway
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.shared.store
    }

    /// Mailbox of the conversation's actor, spawning the actor if needed.
    fn mailbox(&self, conversation_id: &str) -> Result<mpsc::Sender<ActorCommand>, CoordinatorError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShuttingDown);
        }
        let mut actors = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = actors.get(conversation_id)
            && !handle.tx.is_closed()
        {
            return Ok(handle.tx.clone());
        }

        let generation = self.shared.next_actor.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = ConversationActor {
            conversation_id: conversation_id.to_string(),
            generation,
            shared: self.shared.clone(),
            registry: self.actors.clone(),
            mailbox: tx.downgrade(),
            current: None,
            queue: VecDeque::new(),
            stop_requested: false,
            timeout: None,
            draining: false,
        };
        let task = tokio::spawn(actor.run(rx));
        debug!(conversation_id, "conversation actor spawned");
        actors.insert(
            conversation_id.to_string(),
            ActorHandle {
                generation,
                tx: tx.clone(),
                task,
            },
        );
        Ok(tx)
    }

    /// Mailbox of an existing actor only.
    fn existing_mailbox(&self, conversation_id: &str) -> Option<mpsc::Sender<ActorCommand>> {
        self.actors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .filter(|h| !h.tx.is_closed())
            .map(|h| h.tx.clone())
    }

    async fn request<R>(
        &self,
        conversation_id: &str,
        tx: mpsc::Sender<ActorCommand>,
        make: impl FnOnce(oneshot::Sender<R>) -> ActorCommand,
    ) -> Result<R, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        tx.send(make(reply))
            .await
            .map_err(|_| CoordinatorError::ActorGone(conversation_id.to_string()))?;
        rx.await
            .map_err(|_| CoordinatorError::ActorGone(conversation_id.to_string()))
    }

    /// Start a turn for `message`, or queue it behind the running one.
    pub async fn accept(
        &self,
        conversation_id: &str,
        message: PendingMessage,
    ) -> Result<AcceptOutcome, CoordinatorError> {
        let tx = self.mailbox(conversation_id)?;
        self.request(conversation_id, tx, |reply| ActorCommand::Accept { message, reply })
            .await
    }

    /// Ask the running turn to stop. Queued messages are kept.
    ///
    /// Returns false when nothing was running. The turn's terminal event
    /// arrives later through the normal close path.
    pub async fn stop(&self, conversation_id: &str) -> Result<bool, CoordinatorError> {
        match self.existing_mailbox(conversation_id) {
            Some(tx) => {
                self.request(conversation_id, tx, |reply| ActorCommand::Stop { reply })
                    .await
            }
            None => Ok(false),
        }
    }

    /// Subscribe a connection to a conversation.
    ///
    /// If a turn is running, the connection is told so in the same step.
    /// Returns whether a turn was running.
    pub async fn subscribe(
        &self,
        conversation_id: &str,
        connection: ConnectionId,
    ) -> Result<bool, GatewayError> {
        let tx = self.mailbox(conversation_id)?;
        self.request(conversation_id, tx, |reply| ActorCommand::Subscribe {
            connection,
            reply,
        })
        .await?
    }

    pub async fn status(&self, conversation_id: &str) -> Result<ConversationStatus, CoordinatorError> {
        match self.existing_mailbox(conversation_id) {
            Some(tx) => {
                self.request(conversation_id, tx, |reply| ActorCommand::Status { reply })
                    .await
            }
            None => Ok(ConversationStatus::idle()),
        }
    }

    pub async fn is_running(&self, conversation_id: &str) -> bool {
        self.status(conversation_id)
            .await
            .map(|s| s.is_running())
            .unwrap_or(false)
    }

    /// Ids of every conversation with a running turn, sorted.
    pub async fn running_conversations(&self) -> Vec<String> {
        let mailboxes: Vec<(String, mpsc::Sender<ActorCommand>)> = {
            let actors = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
            actors
                .iter()
                .filter(|(_, h)| !h.tx.is_closed())
                .map(|(id, h)| (id.clone(), h.tx.clone()))
                .collect()
        };

        let mut running = Vec::new();
        for (id, tx) in mailboxes {
            if let Ok(status) = self
                .request(&id, tx, |reply| ActorCommand::Status { reply })
                .await
                && status.is_running()
            {
                running.push(id);
            }
        }
        running.sort();
        running
    }

    /// Kill every running turn and wait for the actors to wind down.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.supervisor.shutdown();
        let handles: Vec<ActorHandle> = {
            let mut actors = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
            actors.drain().map(|(_, h)| h).collect()
        };
        info!(actors = handles.len(), "shutting down conversation actors");
        for ActorHandle { tx, mut task, .. } in handles {
            drop(tx);
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                warn!("conversation actor did not stop in time, aborting");
                task.abort();
            }
        }
    }

    #[cfg(test)]
    fn actor_count(&self) -> usize {
        self.actors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct ConversationActor {
    conversation_id: String,
    generation: u64,
    shared: Arc<Shared>,
    registry: ActorRegistry,
    mailbox: mpsc::WeakSender<ActorCommand>,
    current: Option<Turn>,
    queue: VecDeque<PendingMessage>,
    stop_requested: bool,
    timeout: Option<JoinHandle<()>>,
    /// Shutting down: exit once the current turn has closed.
    draining: bool,
}

impl ConversationActor {
    async fn run(mut self, mut rx: mpsc::Receiver<ActorCommand>) {
        let shutdown = self.shared.shutdown.clone();
        let idle = tokio::time::sleep(IDLE_RETIRE_AFTER);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        self.handle(cmd).await;
                        idle.as_mut().reset(Instant::now() + IDLE_RETIRE_AFTER);
                    }
                    None => break,
                },
                _ = &mut idle, if self.is_idle() => {
                    if self.try_retire(&rx) {
                        break;
                    }
                    idle.as_mut().reset(Instant::now() + IDLE_RETIRE_AFTER);
                }
                _ = shutdown.cancelled(), if !self.draining => {
                    self.draining = true;
                    if !self.queue.is_empty() {
                        info!(conversation_id = %self.conversation_id, dropped = self.queue.len(), "discarding queued messages on shutdown");
                        self.queue.clear();
                    }
                    if self.current.is_some() {
                        self.stop_requested = true;
                        self.shared.supervisor.kill(&self.conversation_id);
                    }
                }
            }
            if self.draining && self.current.is_none() {
                break;
            }
        }
        self.cancel_timeout();
        debug!(conversation_id = %self.conversation_id, "conversation actor stopped");
    }

    fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty() && !self.draining
    }

    /// Leave the registry if nobody can still reach this mailbox.
    ///
    /// Runs under the registry lock, which `mailbox()` also holds while
    /// handing out senders, so no new sender can appear in between.
    fn try_retire(&self, rx: &mpsc::Receiver<ActorCommand>) -> bool {
        let mut actors = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = actors.get(&self.conversation_id).is_some_and(|handle| {
            handle.generation == self.generation && handle.tx.strong_count() == 1
        }) && rx.is_empty();
        if unused {
            actors.remove(&self.conversation_id);
            debug!(conversation_id = %self.conversation_id, "retiring idle conversation actor");
        }
        unused
    }

    async fn handle(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::Accept { message, reply } => {
                let outcome = self.accept(message).await;
                let _ = reply.send(outcome);
            }
            ActorCommand::Stop { reply } => {
                let _ = reply.send(self.stop());
            }
            ActorCommand::Subscribe { connection, reply } => {
                let _ = reply.send(self.subscribe(connection));
            }
            ActorCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ActorCommand::Supervisor(SupervisorEvent::Event { turn_id, event, .. }) => {
                self.on_event(turn_id, event);
            }
            ActorCommand::Supervisor(SupervisorEvent::Closed(exit)) => {
                self.on_close(exit).await;
            }
            ActorCommand::TurnTimeout { turn_id } => {
                if self.current.as_ref().is_some_and(|t| t.id == turn_id) {
                    warn!(conversation_id = %self.conversation_id, turn_id, "turn timed out, stopping agent");
                    self.stop();
                }
            }
        }
    }

    fn status(&self) -> ConversationStatus {
        let phase = match (&self.current, self.queue.is_empty()) {
            (None, _) => CoordinatorPhase::Idle,
            (Some(_), true) => CoordinatorPhase::Running,
            (Some(_), false) => CoordinatorPhase::RunningWithQueue,
        };
        ConversationStatus {
            phase,
            turn_id: self.current.as_ref().map(|t| t.id),
            queued: self.queue.len(),
        }
    }

    async fn accept(&mut self, message: PendingMessage) -> AcceptOutcome {
        if self.draining {
            return AcceptOutcome::Failed {
                reason: "Server is shutting down".to_string(),
            };
        }
        if self.current.is_some() {
            self.queue.push_back(message);
            debug!(conversation_id = %self.conversation_id, queued = self.queue.len(), "message queued");
            return AcceptOutcome::Queued {
                position: self.queue.len(),
            };
        }
        match self.begin_turn(message).await {
            Ok(turn_id) => AcceptOutcome::Started { turn_id },
            Err(reason) => AcceptOutcome::Failed { reason },
        }
    }

    fn stop(&mut self) -> bool {
        let Some(turn) = &self.current else {
            return false;
        };
        info!(conversation_id = %self.conversation_id, turn_id = turn.id, "stop requested");
        self.stop_requested = true;
        self.shared.supervisor.kill(&self.conversation_id);
        true
    }

    fn subscribe(&self, connection: ConnectionId) -> Result<bool, GatewayError> {
        let gateway = &self.shared.gateway;
        gateway.subscribe(connection, &self.conversation_id)?;
        let running = self.current.is_some();
        if running {
            gateway.send_to(
                connection,
                ServerMessage::Streaming {
                    conversation_ids: vec![self.conversation_id.clone()],
                },
            )?;
        }
        Ok(running)
    }

    fn publish(&self, message: ServerMessage) {
        self.shared.gateway.publish(&self.conversation_id, &message);
    }

    /// Persist the user entry, build the invocation and spawn the process.
    async fn begin_turn(&mut self, message: PendingMessage) -> Result<u64, String> {
        let shared = self.shared.clone();
        let settings = &shared.settings;
        let turn_id = shared.next_turn_id.fetch_add(1, Ordering::Relaxed);

        let ctx = match shared
            .store
            .load_context(&self.conversation_id, settings.history_limit)
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                return Err(self
                    .fail_turn(format!("Failed to load conversation: {:#}", e))
                    .await);
            }
        };

        let mode = message.mode.unwrap_or(ctx.conversation.mode);
        let model = resolve_model(settings, message.model.as_deref());
        let mut turn = Turn::new(turn_id, message, model, mode);

        if let Err(e) = shared
            .store
            .append_transcript(
                &self.conversation_id,
                NewTranscriptEntry::user(&turn.message, &turn.model),
            )
            .await
        {
            error!(conversation_id = %self.conversation_id, error = %format!("{:#}", e), "failed to persist user message");
        }

        let invocation = context::assemble(settings, &ctx, &turn);
        let Some(sink) = self.mailbox.upgrade() else {
            return Err(self.fail_turn("Server is shutting down".to_string()).await);
        };

        if let Err(e) = shared
            .supervisor
            .start(&self.conversation_id, turn_id, &invocation, sink)
            .await
        {
            return Err(self.fail_turn(e.to_string()).await);
        }

        info!(
            conversation_id = %self.conversation_id,
            turn_id,
            model = %turn.model,
            mode = %turn.mode,
            "turn started"
        );
        turn.mark_running();
        self.current = Some(turn);
        self.stop_requested = false;
        self.arm_timeout(turn_id);
        Ok(turn_id)
    }

    fn arm_timeout(&mut self, turn_id: u64) {
        self.cancel_timeout();
        let Some(limit) = self.shared.settings.turn_timeout else {
            return;
        };
        let mailbox = self.mailbox.clone();
        self.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(ActorCommand::TurnTimeout { turn_id }).await;
            }
        }));
    }

    fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }

    fn on_event(&mut self, turn_id: u64, event: NormalizedEvent) {
        let Some(turn) = self.current.as_mut().filter(|t| t.id == turn_id) else {
            debug!(conversation_id = %self.conversation_id, turn_id, "dropping event from stale turn");
            return;
        };
        match &event {
            NormalizedEvent::ToolInvoked { name, args } => turn.record_tool_invoked(name, args),
            NormalizedEvent::ToolCompleted { name, result } => turn.record_tool_completed(name, result),
            // Terminal verdicts are published once the process has closed
            NormalizedEvent::TurnDone { .. } | NormalizedEvent::TurnFailed { .. } => return,
            NormalizedEvent::TextDelta { .. } => {}
        }
        self.publish(ServerMessage::from_event(&self.conversation_id, event));
    }

    async fn on_close(&mut self, exit: ProcessExit) {
        if self.current.as_ref().map(|t| t.id) != Some(exit.turn_id) {
            debug!(conversation_id = %self.conversation_id, turn_id = exit.turn_id, "ignoring close of stale turn");
            return;
        }
        self.cancel_timeout();
        let store = self.shared.store.clone();

        if let Some(session_id) = exit.session_id.as_deref()
            && let Err(e) = store.record_agent_session(&self.conversation_id, session_id).await
        {
            warn!(conversation_id = %self.conversation_id, error = %format!("{:#}", e), "failed to record agent session");
        }

        let outcome = classify(&exit, self.stop_requested);
        self.stop_requested = false;

        let (text, cost, interrupted) = match outcome {
            TurnOutcome::Failed { reason } => {
                if let Some(turn) = self.current.as_mut() {
                    turn.finish(TurnState::Failed);
                }
                warn!(
                    conversation_id = %self.conversation_id,
                    turn_id = exit.turn_id,
                    exit_code = ?exit.exit_code,
                    reason = %reason,
                    "turn failed"
                );
                self.fail_turn(reason).await;
                return;
            }
            TurnOutcome::Completed { text, cost } => (text, cost, false),
            TurnOutcome::Interrupted { text, cost } => (text, cost, true),
        };

        let Some(mut turn) = self.current.take() else {
            return;
        };
        turn.finish(if interrupted {
            TurnState::Interrupted
        } else {
            TurnState::Completed
        });

        let entry = NewTranscriptEntry::assistant(
            text.clone(),
            interrupted,
            cost,
            std::mem::take(&mut turn.tool_calls),
            &turn.model,
        );
        if let Err(e) = store.append_transcript(&self.conversation_id, entry).await {
            error!(conversation_id = %self.conversation_id, error = %format!("{:#}", e), "failed to persist assistant reply");
        }
        if let Err(e) = store.record_turn_cost(&self.conversation_id, cost).await {
            warn!(conversation_id = %self.conversation_id, error = %format!("{:#}", e), "failed to record turn cost");
        }

        let has_more = !self.queue.is_empty() && !self.draining;
        info!(
            conversation_id = %self.conversation_id,
            turn_id = turn.id,
            interrupted,
            has_more,
            cost = ?cost,
            "turn finished"
        );
        self.publish(ServerMessage::from_event(
            &self.conversation_id,
            NormalizedEvent::TurnDone {
                final_text: text,
                cost,
                has_more,
                interrupted,
            },
        ));

        if has_more && let Some(next) = self.queue.pop_front() {
            // Failures here are published and reset the actor to idle.
            let _ = self.begin_turn(next).await;
        }
    }

    /// Record and publish a failed turn, then drop the queue and go idle.
    async fn fail_turn(&mut self, reason: String) -> String {
        if let Err(e) = self
            .shared
            .store
            .append_transcript(&self.conversation_id, NewTranscriptEntry::failure(&reason))
            .await
        {
            error!(conversation_id = %self.conversation_id, error = %format!("{:#}", e), "failed to persist failure marker");
        }
        self.publish(ServerMessage::from_event(
            &self.conversation_id,
            NormalizedEvent::TurnFailed {
                reason: reason.clone(),
            },
        ));
        if !self.queue.is_empty() {
            info!(conversation_id = %self.conversation_id, dropped = self.queue.len(), "discarding queued messages after failure");
            self.queue.clear();
        }
        self.current = None;
        self.stop_requested = false;
        self.cancel_timeout();
        reason
    }
}
