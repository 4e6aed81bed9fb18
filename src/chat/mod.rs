//! Chat back-end: conversations with a coding agent over WebSocket.
//!
//! ## Overview
//!
//! Each user message starts (or queues behind) a *turn*: one run of the
//! agent CLI whose JSON-lines output is translated into normalized events,
//! persisted to SQLite, and fanned out to every connection subscribed to the
//! conversation.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (browser)│ <─────── │    ├─ api.rs  (REST handlers, AppState)          │
//! └──────────┘ WebSocket│    └─ ws.rs   (socket loop, client dispatch)     │
//!                       │         │                                        │
//!                       │         │ TurnCoordinator::accept()/stop()       │
//!                       │         v                                        │
//!                       │  coordinator.rs  (one actor per conversation)    │
//!                       │         │                                        │
//!                       │         │ context::assemble() → Invocation       │
//!                       │         │ ProcessSupervisor::start()             │
//!                       │         v                                        │
//!                       │  supervisor.rs  (child process, stdout/stderr)   │
//!                       │         │                                        │
//!                       │         │ lines.rs → translator.rs               │
//!                       │         v                                        │
//!                       │  gateway.rs  (per-connection bounded queues)     │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `models`     | Projects, conversations, transcript entries, `Turn`     |
//! | `db`         | SQLite access via `DbHandle`, `ConversationStore` trait |
//! | `context`    | Model resolution, prompt rendering, CLI argument build  |
//! | `lines`      | Splits raw stdout chunks into complete lines            |
//! | `translator` | Agent JSON line → `NormalizedEvent`                     |
//!
//! ## Typical Turn Flow
//!
//! 1. Client sends `{"type":"send",...}` → `ws::dispatch()` subscribes the
//!    sender and calls `TurnCoordinator::accept()`.
//! 2. The conversation actor loads prior context, persists the user entry
//!    and asks the supervisor to spawn the agent.
//! 3. Stdout lines become `chunk` / `tool_use` / `tool_result` messages as
//!    they arrive. Tool calls are recorded on the in-flight `Turn`.
//! 4. On exit the actor classifies the turn (completed, interrupted or
//!    failed), persists the assistant or failure entry, publishes `done` or
//!    `error`, and starts the next queued message if there is one.

pub mod api;
pub mod context;
pub mod coordinator;
pub mod db;
pub mod gateway;
pub mod lines;
pub mod models;
pub mod server;
pub mod supervisor;
pub mod translator;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;
