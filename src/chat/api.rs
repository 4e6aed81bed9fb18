use std::sync::Arc;

use agentdeck_protocol::PermissionMode;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::context::AgentSettings;
use super::coordinator::TurnCoordinator;
use super::db::DbHandle;
use super::gateway::Gateway;
use super::supervisor::{AgentLauncher, ProcessSupervisor};
use crate::errors::ChatError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub coordinator: TurnCoordinator,
    pub gateway: Arc<Gateway>,
    /// Cancelled when the server starts shutting down; closes open sockets.
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the store, gateway, supervisor and coordinator together.
    pub fn new(
        db: DbHandle,
        launcher: Arc<dyn AgentLauncher>,
        settings: AgentSettings,
        subscriber_buffer: usize,
    ) -> Self {
        let gateway = Arc::new(Gateway::new(subscriber_buffer));
        let supervisor =
            ProcessSupervisor::new(launcher, settings.stderr_limit, settings.tool_result_limit);
        let coordinator = TurnCoordinator::new(
            supervisor,
            Arc::new(db.clone()),
            gateway.clone(),
            settings,
        );
        Self {
            db,
            coordinator,
            gateway,
            shutdown: CancellationToken::new(),
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub path: String,
}

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub project_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mode: Option<PermissionMode>,
}

#[derive(Deserialize)]
pub struct UpdateModeRequest {
    pub mode: PermissionMode,
}

#[derive(Deserialize)]
pub struct ConversationFilter {
    pub project_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct TranscriptQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Serialize)]
pub struct StreamingResponse {
    pub conversation_ids: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::ProjectNotFound { .. } | ChatError::ConversationNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            ChatError::BadRequest(msg) => ApiError::BadRequest(msg),
            ChatError::Database(_) | ChatError::Coordinator(_) => {
                error!(error = %err, "internal API error");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

fn db_error(e: anyhow::Error) -> ApiError {
    ApiError::from(ChatError::Database(e))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/{id}", get(get_conversation))
        .route("/api/conversations/{id}/mode", patch(update_mode))
        .route("/api/conversations/{id}/messages", get(list_messages))
        .route("/api/conversations/{id}/stop", post(stop_conversation))
        .route("/api/streaming", get(streaming))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .db
        .call(|db| db.list_projects())
        .await
        .map_err(db_error)?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ChatError::BadRequest("Project name must not be empty".into()).into());
    }
    let name = req.name;
    let path = req.path;
    let project = state
        .db
        .call(move |db| db.create_project(&name, &path))
        .await
        .map_err(db_error)?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .call(move |db| db.get_project(id))
        .await
        .map_err(db_error)?;
    match project {
        Some(project) => Ok(Json(project)),
        None => Err(ChatError::ProjectNotFound { id }.into()),
    }
}

async fn list_conversations(
    State(state): State<SharedState>,
    Query(filter): Query<ConversationFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state
        .db
        .call(move |db| db.list_conversations(filter.project_id))
        .await
        .map_err(db_error)?;
    Ok(Json(conversations))
}

async fn create_conversation(
    State(state): State<SharedState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(project_id) = req.project_id {
        let exists = state
            .db
            .call(move |db| Ok(db.get_project(project_id)?.is_some()))
            .await
            .map_err(db_error)?;
        if !exists {
            return Err(ChatError::ProjectNotFound { id: project_id }.into());
        }
    }
    let title = req
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "New conversation".to_string());
    let mode = req.mode.unwrap_or_default();
    let conversation = state
        .db
        .call(move |db| db.create_conversation(req.project_id, &title, mode))
        .await
        .map_err(db_error)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let conversation = state
        .db
        .call(move |db| db.get_conversation(&lookup))
        .await
        .map_err(db_error)?;
    conversation
        .map(Json)
        .ok_or_else(|| ChatError::ConversationNotFound { id }.into())
}

/// Change the default mode for future turns. A running turn keeps the
/// mode it was started with.
async fn update_mode(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateModeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let conversation = state
        .db
        .call(move |db| {
            if db.get_conversation(&lookup)?.is_none() {
                return Ok(None);
            }
            db.update_conversation_mode(&lookup, req.mode).map(Some)
        })
        .await
        .map_err(db_error)?;
    conversation
        .map(Json)
        .ok_or_else(|| ChatError::ConversationNotFound { id }.into())
}

async fn list_messages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let entries = state
        .db
        .call(move |db| {
            if db.get_conversation(&lookup)?.is_none() {
                return Ok(None);
            }
            db.list_transcript(&lookup, query.limit).map(Some)
        })
        .await
        .map_err(db_error)?;
    entries
        .map(Json)
        .ok_or_else(|| ChatError::ConversationNotFound { id }.into())
}

async fn stop_conversation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let exists = state
        .db
        .call(move |db| Ok(db.get_conversation(&lookup)?.is_some()))
        .await
        .map_err(db_error)?;
    if !exists {
        return Err(ChatError::ConversationNotFound { id }.into());
    }
    let stopped = state
        .coordinator
        .stop(&id)
        .await
        .map_err(|e| ApiError::from(ChatError::from(e)))?;
    Ok(Json(StopResponse { stopped }))
}

async fn streaming(State(state): State<SharedState>) -> impl IntoResponse {
    Json(StreamingResponse {
        conversation_ids: state.coordinator.running_conversations().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::db::ChatDb;
    use crate::chat::testing::{scripted_launcher, text_line};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let db = DbHandle::new(ChatDb::new_in_memory().unwrap());
        let (launcher, _agents) = scripted_launcher();
        Arc::new(AppState::new(db, launcher, AgentSettings::default(), 16))
    }

    fn test_app() -> Router {
        api_router().with_state(test_state())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = test_app().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_and_get_project() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/projects",
                serde_json::json!({"name": "deck", "path": "/tmp/deck"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let project: serde_json::Value = body_json(response.into_body()).await;
        let id = project["id"].as_i64().unwrap();

        let response = app
            .oneshot(get(&format!("/api/projects/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(fetched["path"], "/tmp/deck");
    }

    #[tokio::test]
    async fn test_get_project_not_found() {
        let response = test_app().oneshot(get("/api/projects/9999")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Project 9999 not found");
    }

    #[tokio::test]
    async fn test_create_conversation_defaults() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/conversations", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let conversation: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(conversation["mode"], "standard");
        assert_eq!(conversation["title"], "New conversation");

        let response = app.oneshot(get("/api/conversations")).await.unwrap();
        let all: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_create_conversation_for_missing_project_is_404() {
        let response = test_app()
            .oneshot(json_request(
                "POST",
                "/api/conversations",
                serde_json::json!({"project_id": 42}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_conversations_filters_by_project() {
        let state = test_state();
        {
            let db = state.db.lock_sync().unwrap();
            let project = db.create_project("p", "/tmp/p").unwrap();
            db.create_conversation(Some(project.id), "in project", PermissionMode::Standard)
                .unwrap();
            db.create_conversation(None, "loose", PermissionMode::Standard)
                .unwrap();
        }
        let app = api_router().with_state(state);
        let response = app
            .oneshot(get("/api/conversations?project_id=1"))
            .await
            .unwrap();
        let filtered: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["title"], "in project");
    }

    #[tokio::test]
    async fn test_update_mode() {
        let state = test_state();
        let id = state
            .db
            .lock_sync()
            .unwrap()
            .create_conversation(None, "c", PermissionMode::Standard)
            .unwrap()
            .id;
        let app = api_router().with_state(state);
        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &format!("/api/conversations/{}/mode", id),
                serde_json::json!({"mode": "readonly"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let conversation: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(conversation["mode"], "readonly");

        let response = app
            .oneshot(json_request(
                "PATCH",
                "/api/conversations/missing/mode",
                serde_json::json!({"mode": "autonomous"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_mode_rejects_unknown_value() {
        let response = test_app()
            .oneshot(json_request(
                "PATCH",
                "/api/conversations/x/mode",
                serde_json::json!({"mode": "yolo"}),
            ))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_messages_returns_transcript_in_order() {
        let state = test_state();
        let id = {
            let db = state.db.lock_sync().unwrap();
            let conversation = db
                .create_conversation(None, "c", PermissionMode::Standard)
                .unwrap();
            let message = crate::chat::models::PendingMessage::text("hello");
            db.append_transcript(
                &conversation.id,
                &crate::chat::models::NewTranscriptEntry::user(&message, "sonnet"),
            )
            .unwrap();
            db.append_transcript(
                &conversation.id,
                &crate::chat::models::NewTranscriptEntry::assistant(
                    "hi there".into(),
                    false,
                    Some(0.02),
                    vec![],
                    "sonnet",
                ),
            )
            .unwrap();
            conversation.id
        };
        let app = api_router().with_state(state);
        let response = app
            .oneshot(get(&format!("/api/conversations/{}/messages", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let entries: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["role"], "user");
        assert_eq!(entries[1]["content"], "hi there");
        assert_eq!(entries[1]["status"], "completed");
    }

    #[tokio::test]
    async fn test_stop_idle_conversation_reports_false() {
        let state = test_state();
        let id = state
            .db
            .lock_sync()
            .unwrap()
            .create_conversation(None, "c", PermissionMode::Standard)
            .unwrap()
            .id;
        let app = api_router().with_state(state);
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/conversations/{}/stop", id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["stopped"], false);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/conversations/unknown/stop",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_streaming_lists_running_conversations() {
        let db = DbHandle::new(ChatDb::new_in_memory().unwrap());
        let id = db
            .lock_sync()
            .unwrap()
            .create_conversation(None, "c", PermissionMode::Standard)
            .unwrap()
            .id;
        let (launcher, mut agents) = scripted_launcher();
        let state = Arc::new(AppState::new(db, launcher, AgentSettings::default(), 16));
        state
            .coordinator
            .accept(&id, crate::chat::models::PendingMessage::text("go"))
            .await
            .unwrap();
        let mut agent = agents.recv().await.unwrap();
        agent.emit(&text_line("working")).await;

        let app = api_router().with_state(state);
        let response = app.oneshot(get("/api/streaming")).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["conversation_ids"], serde_json::json!([id]));
    }
}
