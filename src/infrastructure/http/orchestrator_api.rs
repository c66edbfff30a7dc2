//! Orchestrator HTTP surface: workflow CRUD, execution, cancellation,
//! schedules, events, and store statistics.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::errors::SwarmError;
use crate::domain::models::{ExecutionStatus, ScheduleConfig, Workflow};
use crate::infrastructure::database::WorkflowStore;
use crate::services::cancellation::CancellationRegistry;
use crate::services::scheduler::Scheduler;
use crate::services::workflow_engine::WorkflowEngine;

pub struct OrchestratorState {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<WorkflowStore>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<CancellationRegistry>,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: Arc<OrchestratorState>) -> Router {
    Router::new()
        .route("/v1/workflows", post(put_workflow).get(get_workflows).delete(delete_workflow))
        .route("/v1/run", post(run_workflow))
        .route("/v1/executions", get(list_executions))
        .route("/v1/executions/active", get(active_executions))
        .route("/v1/executions/:id", get(get_execution))
        .route("/v1/cancel/:workflow_id", post(cancel_execution))
        .route(
            "/v1/schedules",
            post(put_schedule).get(list_schedules).delete(delete_schedule),
        )
        .route("/v1/events", post(trigger_event))
        .route("/v1/stats/db", get(db_stats))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(axum::middleware::from_fn(super::middleware::request_id_layer))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "orchestrator"}))
}

async fn render_metrics(State(state): State<Arc<OrchestratorState>>) -> String {
    state.metrics_handle.render()
}

async fn put_workflow(
    State(state): State<Arc<OrchestratorState>>,
    Json(workflow): Json<Workflow>,
) -> Result<Response, SwarmError> {
    workflow.validate()?;
    state.store.put_workflow(&workflow).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"status": "stored", "name": workflow.name})),
    )
        .into_response())
}

#[derive(Deserialize)]
struct NameQuery {
    name: Option<String>,
}

async fn get_workflows(
    State(state): State<Arc<OrchestratorState>>,
    Query(query): Query<NameQuery>,
) -> Result<Json<Value>, SwarmError> {
    match query.name {
        Some(name) => {
            let workflow = state.store.get_workflow(&name).await?;
            Ok(Json(json!({"workflow": workflow})))
        }
        None => {
            let workflows = state.store.list_workflows().await?;
            Ok(Json(json!({"workflows": workflows})))
        }
    }
}

async fn delete_workflow(
    State(state): State<Arc<OrchestratorState>>,
    Query(query): Query<NameQuery>,
) -> Result<Json<Value>, SwarmError> {
    let name = query
        .name
        .ok_or_else(|| SwarmError::validation("name", "query parameter 'name' is required"))?;
    state.store.delete_workflow(&name).await?;
    Ok(Json(json!({"status": "deleted", "name": name})))
}

#[derive(Deserialize)]
struct RunRequest {
    workflow: String,
    #[serde(default)]
    parameters: HashMap<String, Value>,
}

/// POST /v1/run: execute a stored workflow synchronously. Failures return
/// 500 with the per-task results embedded.
async fn run_workflow(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<RunRequest>,
) -> Result<Response, SwarmError> {
    let workflow = state.store.get_workflow(&request.workflow).await?;
    let execution = state
        .engine
        .execute_with_parameters(&workflow, request.parameters)
        .await?;
    state.store.put_execution(&execution).await?;

    let body = json!({
        "status": execution.status.as_str(),
        "workflow_id": execution.workflow_id,
        "duration_ms": execution.duration_ms(),
        "task_results": execution.task_results,
    });
    let status = if execution.status == ExecutionStatus::Completed {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(body)).into_response())
}

#[derive(Deserialize)]
struct ListExecutionsQuery {
    workflow: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_executions(
    State(state): State<Arc<OrchestratorState>>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<Value>, SwarmError> {
    let executions = state
        .store
        .list_executions(&query.workflow, None, None, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(json!({"executions": executions})))
}

async fn active_executions(
    State(state): State<Arc<OrchestratorState>>,
) -> Json<Value> {
    Json(json!({"active": state.registry.active().await}))
}

async fn get_execution(
    State(state): State<Arc<OrchestratorState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, SwarmError> {
    let execution = state.store.get_execution(&id).await?;
    Ok(Json(json!({"execution": execution})))
}

#[derive(Deserialize, Default)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_execution(
    State(state): State<Arc<OrchestratorState>>,
    Path(workflow_id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<Value>, SwarmError> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "operator request".to_string());
    let status = state
        .registry
        .cancel(&workflow_id, &reason)
        .await
        .ok_or_else(|| SwarmError::not_found("execution", workflow_id.clone()))?;
    Ok(Json(json!({"workflow_id": workflow_id, "status": status})))
}

async fn put_schedule(
    State(state): State<Arc<OrchestratorState>>,
    Json(schedule): Json<ScheduleConfig>,
) -> Result<Response, SwarmError> {
    state.scheduler.register(schedule.clone()).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"status": "scheduled", "workflow": schedule.workflow_name})),
    )
        .into_response())
}

async fn list_schedules(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    Json(json!({"schedules": state.scheduler.list().await}))
}

#[derive(Deserialize)]
struct ScheduleQuery {
    workflow: String,
}

async fn delete_schedule(
    State(state): State<Arc<OrchestratorState>>,
    Query(query): Query<ScheduleQuery>,
) -> Result<Json<Value>, SwarmError> {
    state.scheduler.unregister(&query.workflow).await?;
    Ok(Json(json!({"status": "deleted", "workflow": query.workflow})))
}

#[derive(Deserialize)]
struct EventRequest {
    event_type: String,
    #[serde(default)]
    event_data: HashMap<String, Value>,
}

async fn trigger_event(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<EventRequest>,
) -> Result<Json<Value>, SwarmError> {
    let launched = state
        .scheduler
        .trigger_event(&request.event_type, request.event_data)
        .await?;
    Ok(Json(json!({
        "event_type": request.event_type,
        "launched": launched,
    })))
}

async fn db_stats(
    State(state): State<Arc<OrchestratorState>>,
) -> Result<Json<Value>, SwarmError> {
    Ok(Json(json!({"db": state.store.stats().await?})))
}

/// Bind and serve the orchestrator API until shutdown resolves.
pub async fn serve(
    state: Arc<OrchestratorState>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "orchestrator listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
