//! RPC surface
//!
//! Read endpoints go straight to the store; mutations go through the
//! submission service. Error kinds map onto status codes in
//! `Error::into_response`: Validation 400, Conflict 409, NotFound 404,
//! everything else 500.

use crate::config::Config;
use crate::db::Store;
use crate::models::{Project, ProjectWithLatestTask, Task, TaskEvent, TaskStatus, WatchProgress};
use crate::pipeline::PipelineRunner;
use crate::{submit, Error, Result};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub runner: Arc<PipelineRunner>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/projects", post(submit_project).get(list_projects))
        .route(
            "/api/projects/:project_id",
            get(project_by_id).delete(delete_project),
        )
        .route(
            "/api/projects/:project_id/watch-progress",
            put(upsert_watch_progress),
        )
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:task_id", get(task_by_id))
        .route("/api/tasks/:task_id/cancel", post(cancel_task))
        .route("/api/tasks/:task_id/retry", post(retry_task))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitProjectRequest {
    source_or_url: String,
    #[serde(default)]
    translation_hint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitProjectResponse {
    project_id: Uuid,
    task_id: Uuid,
    status: &'static str,
}

async fn submit_project(
    State(state): State<AppState>,
    Json(request): Json<SubmitProjectRequest>,
) -> Result<Json<SubmitProjectResponse>> {
    let outcome = submit::submit_project(
        &state.store,
        &state.runner,
        &request.source_or_url,
        request.translation_hint.as_deref(),
    )
    .await?;

    Ok(Json(SubmitProjectResponse {
        project_id: outcome.project_id,
        task_id: outcome.task_id,
        status: "queued",
    }))
}

async fn list_projects(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProjectWithLatestTask>>> {
    Ok(Json(state.store.list_projects(200).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectDetailResponse {
    #[serde(flatten)]
    project: Project,
    tasks: Vec<Task>,
}

async fn project_by_id(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<ProjectDetailResponse>> {
    let (project, tasks) = state.store.get_project(project_id).await?;
    Ok(Json(ProjectDetailResponse { project, tasks }))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    submit::delete_project(&state.store, &state.config, project_id).await?;
    Ok(Json(serde_json::json!({ "deleted": project_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchProgressRequest {
    viewer_id: String,
    position_sec: f64,
    duration_sec: f64,
}

async fn upsert_watch_progress(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<WatchProgressRequest>,
) -> Result<Json<WatchProgress>> {
    if request.viewer_id.is_empty() {
        return Err(Error::Validation("viewerId must not be empty".into()));
    }
    if request.position_sec < 0.0 {
        return Err(Error::Validation("positionSec must be >= 0".into()));
    }
    if request.duration_sec <= 0.0 {
        return Err(Error::Validation("durationSec must be > 0".into()));
    }

    let progress = state
        .store
        .upsert_watch_progress(
            project_id,
            &request.viewer_id,
            request.position_sec,
            request.duration_sec,
        )
        .await?;
    Ok(Json(progress))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    limit: Option<i64>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>> {
    let limit = query.limit.unwrap_or(100);
    if limit <= 0 {
        return Err(Error::Validation("limit must be positive".into()));
    }
    Ok(Json(state.store.list_tasks(limit).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskDetailResponse {
    #[serde(flatten)]
    task: Task,
    events: Vec<TaskEvent>,
}

async fn task_by_id(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskDetailResponse>> {
    let (task, events) = state.store.get_task(task_id).await?;
    Ok(Json(TaskDetailResponse { task, events }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelTaskResponse {
    task_id: Uuid,
    status: TaskStatus,
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<CancelTaskResponse>> {
    let status = state.store.request_task_cancel(task_id).await?;
    Ok(Json(CancelTaskResponse { task_id, status }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetryTaskResponse {
    task_id: Uuid,
    project_id: Uuid,
}

async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<RetryTaskResponse>> {
    let (task_id, project_id) = submit::retry_task(&state.store, &state.runner, task_id).await?;
    Ok(Json(RetryTaskResponse {
        task_id,
        project_id,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
