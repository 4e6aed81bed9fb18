use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use agentdeck_protocol::PermissionMode;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Persistence operations the turn coordinator needs.
/// Real implementation: `DbHandle`.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn conversation_exists(&self, conversation_id: &str) -> Result<bool>;

    /// Conversation, project path and the latest `history_limit` entries.
    async fn load_context(
        &self,
        conversation_id: &str,
        history_limit: usize,
    ) -> Result<ConversationContext>;

    async fn append_transcript(
        &self,
        conversation_id: &str,
        entry: NewTranscriptEntry,
    ) -> Result<TranscriptEntry>;

    async fn record_turn_cost(&self, conversation_id: &str, cost: Option<f64>) -> Result<()>;

    async fn record_agent_session(&self, conversation_id: &str, session_id: &str) -> Result<()>;
}

/// Async-safe handle to the chat database.
///
/// Wraps `ChatDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ChatDb>>,
}

impl DbHandle {
    pub fn new(db: ChatDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ChatDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ChatDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

#[async_trait]
impl ConversationStore for DbHandle {
    async fn conversation_exists(&self, conversation_id: &str) -> Result<bool> {
        let id = conversation_id.to_string();
        self.call(move |db| Ok(db.get_conversation(&id)?.is_some()))
            .await
    }

    async fn load_context(
        &self,
        conversation_id: &str,
        history_limit: usize,
    ) -> Result<ConversationContext> {
        let id = conversation_id.to_string();
        self.call(move |db| db.load_context(&id, history_limit)).await
    }

    async fn append_transcript(
        &self,
        conversation_id: &str,
        entry: NewTranscriptEntry,
    ) -> Result<TranscriptEntry> {
        let id = conversation_id.to_string();
        self.call(move |db| db.append_transcript(&id, &entry)).await
    }

    async fn record_turn_cost(&self, conversation_id: &str, cost: Option<f64>) -> Result<()> {
        let id = conversation_id.to_string();
        self.call(move |db| db.set_last_cost(&id, cost)).await
    }

    async fn record_agent_session(&self, conversation_id: &str, session_id: &str) -> Result<()> {
        let id = conversation_id.to_string();
        let session_id = session_id.to_string();
        self.call(move |db| db.set_agent_session(&id, &session_id))
            .await
    }
}

pub struct ChatDb {
    conn: Connection,
}

const CONVERSATION_COLUMNS: &str =
    "id, project_id, title, mode, agent_session_id, last_cost, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, conversation_id, role, content, status, cost, tool_calls, attachments, model, created_at";

impl ChatDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    project_id INTEGER REFERENCES projects(id) ON DELETE SET NULL,
                    title TEXT NOT NULL DEFAULT '',
                    mode TEXT NOT NULL DEFAULT 'standard',
                    agent_session_id TEXT,
                    last_cost REAL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS transcript_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'completed',
                    cost REAL,
                    tool_calls TEXT NOT NULL DEFAULT '[]',
                    attachments TEXT NOT NULL DEFAULT '[]',
                    model TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project_id);
                CREATE INDEX IF NOT EXISTS idx_transcript_conversation ON transcript_entries(conversation_id, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, path: &str) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, path) VALUES (?1, ?2)",
                params![name, path],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, path, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], project_from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, path, created_at FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()
            .context("Failed to query project")
    }

    // ── Conversations ─────────────────────────────────────────────────

    pub fn create_conversation(
        &self,
        project_id: Option<i64>,
        title: &str,
        mode: PermissionMode,
    ) -> Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO conversations (id, project_id, title, mode) VALUES (?1, ?2, ?3, ?4)",
                params![id, project_id, title, mode.as_str()],
            )
            .context("Failed to insert conversation")?;
        self.get_conversation(&id)?
            .context("Conversation not found after insert")
    }

    pub fn list_conversations(&self, project_id: Option<i64>) -> Result<Vec<Conversation>> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE (?1 IS NULL OR project_id = ?1) ORDER BY updated_at DESC, created_at DESC",
            CONVERSATION_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_conversations")?;
        let rows = stmt
            .query_map(params![project_id], ConversationRow::from_row)
            .context("Failed to query conversations")?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(
                row.context("Failed to read conversation row")?
                    .into_conversation()?,
            );
        }
        Ok(conversations)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ConversationRow::from_row)
            .optional()
            .context("Failed to query conversation")?;
        row.map(ConversationRow::into_conversation).transpose()
    }

    pub fn update_conversation_mode(&self, id: &str, mode: PermissionMode) -> Result<Conversation> {
        self.conn
            .execute(
                "UPDATE conversations SET mode = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![mode.as_str(), id],
            )
            .context("Failed to update conversation mode")?;
        self.get_conversation(id)?
            .context("Conversation not found after mode update")
    }

    pub fn set_last_cost(&self, id: &str, cost: Option<f64>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET last_cost = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![cost, id],
            )
            .context("Failed to update last_cost")?;
        Ok(())
    }

    pub fn set_agent_session(&self, id: &str, session_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET agent_session_id = ?1 WHERE id = ?2",
                params![session_id, id],
            )
            .context("Failed to update agent_session_id")?;
        Ok(())
    }

    // ── Transcript ────────────────────────────────────────────────────

    pub fn append_transcript(
        &self,
        conversation_id: &str,
        entry: &NewTranscriptEntry,
    ) -> Result<TranscriptEntry> {
        let tool_calls =
            serde_json::to_string(&entry.tool_calls).context("Failed to encode tool calls")?;
        let attachments =
            serde_json::to_string(&entry.attachments).context("Failed to encode attachments")?;
        self.conn
            .execute(
                "INSERT INTO transcript_entries
                    (conversation_id, role, content, status, cost, tool_calls, attachments, model)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    conversation_id,
                    entry.role.as_str(),
                    entry.content,
                    entry.status.as_str(),
                    entry.cost,
                    tool_calls,
                    attachments,
                    entry.model,
                ],
            )
            .context("Failed to insert transcript entry")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .execute(
                "UPDATE conversations SET updated_at = datetime('now') WHERE id = ?1",
                params![conversation_id],
            )
            .context("Failed to touch conversation")?;
        self.get_transcript_entry(id)?
            .context("Transcript entry not found after insert")
    }

    pub fn get_transcript_entry(&self, id: i64) -> Result<Option<TranscriptEntry>> {
        let sql = format!("SELECT {} FROM transcript_entries WHERE id = ?1", ENTRY_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], EntryRow::from_row)
            .optional()
            .context("Failed to query transcript entry")?;
        row.map(EntryRow::into_entry).transpose()
    }

    /// Transcript in chronological order. `limit` keeps only the newest entries.
    pub fn list_transcript(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TranscriptEntry>> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let sql = format!(
            "SELECT {} FROM (
                SELECT {} FROM transcript_entries WHERE conversation_id = ?1
                ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
            ENTRY_COLUMNS, ENTRY_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_transcript")?;
        let rows = stmt
            .query_map(params![conversation_id, limit], EntryRow::from_row)
            .context("Failed to query transcript")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("Failed to read transcript row")?.into_entry()?);
        }
        Ok(entries)
    }

    pub fn load_context(&self, conversation_id: &str, history_limit: usize) -> Result<ConversationContext> {
        let conversation = self
            .get_conversation(conversation_id)?
            .with_context(|| format!("Conversation {} not found", conversation_id))?;
        let project_path = match conversation.project_id {
            Some(project_id) => self.get_project(project_id)?.map(|p| p.path),
            None => None,
        };
        let history = self.list_transcript(conversation_id, Some(history_limit))?;
        Ok(ConversationContext {
            conversation,
            project_path,
            history,
        })
    }
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Intermediate row struct for conversations.
struct ConversationRow {
    id: String,
    project_id: Option<i64>,
    title: String,
    mode: String,
    agent_session_id: Option<String>,
    last_cost: Option<f64>,
    created_at: String,
    updated_at: String,
}

impl ConversationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            mode: row.get(3)?,
            agent_session_id: row.get(4)?,
            last_cost: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_conversation(self) -> Result<Conversation> {
        let mode = PermissionMode::from_str(&self.mode)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse conversation mode")?;
        Ok(Conversation {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            mode,
            agent_session_id: self.agent_session_id,
            last_cost: self.last_cost,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for transcript_entries.
struct EntryRow {
    id: i64,
    conversation_id: String,
    role: String,
    content: String,
    status: String,
    cost: Option<f64>,
    tool_calls: String,
    attachments: String,
    model: Option<String>,
    created_at: String,
}

impl EntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            status: row.get(4)?,
            cost: row.get(5)?,
            tool_calls: row.get(6)?,
            attachments: row.get(7)?,
            model: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<TranscriptEntry> {
        let role = EntryRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse entry role")?;
        let status = EntryStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse entry status")?;
        let tool_calls: Vec<ToolCallRecord> =
            serde_json::from_str(&self.tool_calls).context("Failed to parse tool_calls JSON")?;
        let attachments: Vec<String> =
            serde_json::from_str(&self.attachments).context("Failed to parse attachments JSON")?;
        Ok(TranscriptEntry {
            id: self.id,
            conversation_id: self.conversation_id,
            role,
            content: self.content,
            status,
            cost: self.cost,
            tool_calls,
            attachments,
            model: self.model,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
