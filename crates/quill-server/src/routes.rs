use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use quill_core::bus::Bus;
use quill_core::error::SessionError;
use quill_core::event::BusEvent;
use quill_core::ids::{now_millis, MessageId, SessionId};
use quill_core::message::Message;
use quill_core::part::Part;
use quill_core::permission::PermissionReply;
use quill_core::project::{Project, ProjectIcon};
use quill_core::provider::ModelRef;
use quill_core::session::Session;
use quill_engine::runner::{PromptInput, PromptPart};
use quill_engine::SessionEngine;
use quill_store::projects::ProjectRepo;
use quill_store::Database;

use crate::error::ApiError;
use crate::files;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub bus: Bus,
    pub db: Database,
}

impl AppState {
    pub fn new(engine: Arc<SessionEngine>, db: Database) -> Self {
        let bus = engine.bus().clone();
        Self { engine, bus, db }
    }
}

// --- /path ---

pub async fn get_path(State(state): State<AppState>) -> Json<Value> {
    let config = state.engine.config();
    let directory = config.directory.to_string_lossy().to_string();
    let data = config.data_dir.to_string_lossy().to_string();
    Json(json!({
        "cwd": directory,
        "directory": directory,
        "worktree": directory,
        "state": data,
        "config": data,
        "data": data,
        "root": directory,
    }))
}

// --- /project ---

pub async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(ProjectRepo::new(state.db.clone()).list()?))
}

pub async fn current_project(State(state): State<AppState>) -> Result<Json<Project>, ApiError> {
    let project = ProjectRepo::new(state.db.clone()).get(&state.engine.config().project_id)?;
    Ok(Json(project))
}

#[derive(Deserialize)]
pub struct ProjectUpdateBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<ProjectIcon>,
}

pub async fn update_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProjectUpdateBody>,
) -> Result<Json<Project>, ApiError> {
    let repo = ProjectRepo::new(state.db.clone());
    let mut project = repo.get(&id)?;
    if let Some(name) = body.name {
        project.name = name;
    }
    if let Some(icon) = body.icon {
        project.icon = Some(icon);
    }
    project.time.updated = now_millis();
    repo.put(&project)?;
    state.bus.publish(BusEvent::ProjectUpdated {
        project: project.clone(),
    });
    Ok(Json(project))
}

// --- /session ---

pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.engine.list_sessions()?))
}

#[derive(Deserialize)]
pub struct SessionCreateBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "parentID")]
    pub parent_id: Option<SessionId>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<SessionCreateBody>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.engine.create_session(body.title, body.parent_id)?))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.engine.get_session(&id)?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<bool>, ApiError> {
    state.engine.delete_session(&id)?;
    Ok(Json(true))
}

pub async fn share_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    state.engine.share(&id)?;
    Ok(Json(state.engine.get_session(&id)?))
}

pub async fn unshare_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    state.engine.unshare(&id)?;
    Ok(Json(state.engine.get_session(&id)?))
}

/// Cancel the session's live turn, if any.
pub async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<bool>, ApiError> {
    state.engine.get_session(&id)?;
    Ok(Json(state.engine.abort(&id)))
}

// --- prompt ---

#[derive(Deserialize)]
pub struct PromptBody {
    #[serde(default)]
    pub agent: Option<String>,
    pub model: ModelRef,
    pub parts: Vec<PromptPart>,
}

/// Run one turn to completion; stream consumers watch `/event` instead.
pub async fn prompt_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<PromptBody>,
) -> Result<Json<Message>, ApiError> {
    let assistant = state
        .engine
        .prompt(PromptInput {
            session_id: id,
            agent: body.agent,
            model: body.model,
            parts: body.parts,
        })
        .await?;
    Ok(Json(Message::Assistant(assistant)))
}

// --- history ---

pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(state.engine.messages(&id)?))
}

pub async fn list_parts(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(SessionId, MessageId)>,
) -> Result<Json<Vec<Part>>, ApiError> {
    let message = state
        .engine
        .messages(&id)?
        .into_iter()
        .find(|m| m.id() == &message_id)
        .ok_or_else(|| SessionError::not_found(format!("message {message_id}")))?;
    Ok(Json(state.engine.parts(message.id())?))
}

// --- permissions ---

#[derive(Deserialize)]
pub struct PermissionReplyBody {
    pub response: PermissionReply,
}

pub async fn reply_permission(
    State(state): State<AppState>,
    Path((id, permission_id)): Path<(SessionId, String)>,
    Json(body): Json<PermissionReplyBody>,
) -> Result<Json<bool>, ApiError> {
    if state
        .engine
        .reply_permission(&id, &permission_id, body.response)
    {
        Ok(Json(true))
    } else {
        Err(SessionError::not_found(format!("permission {permission_id}")).into())
    }
}

// --- files ---

pub async fn get_file(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let path = params
        .get("path")
        .ok_or_else(|| SessionError::not_found("query parameter `path`"))?;
    let content = files::read_file(&state.engine.config().directory, path)?;
    Ok(Json(json!({ "path": path, "content": content })))
}

pub async fn find_files(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<String>> {
    let query = params.get("query").cloned().unwrap_or_default();
    Json(files::find_files(&state.engine.config().directory, &query))
}

// --- lifecycle ---

/// Drain: cancel all live turns. The process owner decides when to exit.
pub async fn dispose(State(state): State<AppState>) -> Json<Value> {
    let cancelled = state.engine.dispose();
    Json(json!({ "cancelled": cancelled }))
}
