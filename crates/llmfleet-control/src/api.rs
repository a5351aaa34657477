use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use llmfleet_supervisor::{CreateRequest, StartOverrides, StopResult, models, process::TerminateOutcome};
use llmfleet_types::{HealthCheck, Instance, InstanceId, InstanceStatus, ResourceSample};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 2000;

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/create-instance", post(create_instance))
        .route("/start-instance", post(start_instance))
        .route("/stop-instance", post(stop_instance))
        .route("/remove-instance", post(remove_instance))
        .route("/rename-instance", post(rename_instance))
        .route("/list-instances", get(list_instances))
        .route("/list-models", get(list_models))
        .route("/instance-logs", get(instance_logs))
        .route("/api/info", get(info))
        .route("/health", get(health))
        .with_state(state)
}

/// Wire shape of one instance.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub instance_id: InstanceId,
    pub name: String,
    pub port: u16,
    pub model: Option<String>,
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub pinned: bool,
    pub primary: bool,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_health_check: Option<HealthCheck>,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<Instance> for InstanceView {
    fn from(i: Instance) -> Self {
        Self {
            instance_id: i.id,
            name: i.name,
            port: i.port,
            model: i.model_ref,
            pid: i.pid,
            status: i.status,
            pinned: i.pinned,
            primary: i.primary,
            priority: i.priority,
            message: i.message,
            last_health_check: i.last_health_check,
            consecutive_failures: i.consecutive_failures,
            created_at: i.created_at,
            started_at: i.started_at,
        }
    }
}

// Ports arrive as plain JSON numbers so out-of-range values get our own 400.
fn port_from(raw: i64) -> Result<u16, ApiError> {
    u16::try_from(raw).map_err(|_| ApiError::bad_request("port must be between 1 and 65535"))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CreateInstanceBody {
    name: Option<String>,
    port: i64,
    model: Option<String>,
    #[serde(default = "default_true")]
    auto_start: bool,
    #[serde(default)]
    pinned: bool,
    #[serde(default)]
    priority: i32,
}

#[derive(Debug, Serialize)]
struct CreateInstanceResponse {
    instance_id: InstanceId,
    name: String,
    port: u16,
    status: InstanceStatus,
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    paused_instance: Option<InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_error: Option<ApiError>,
}

async fn create_instance(
    State(state): State<AppState>,
    payload: Result<Json<CreateInstanceBody>, JsonRejection>,
) -> ApiResult<CreateInstanceResponse> {
    let Json(body) = payload?;
    let port = port_from(body.port)?;
    let sup = &state.supervisor;

    let created = sup
        .create_instance(CreateRequest {
            name: body.name,
            port,
            model_ref: body.model,
            pinned: body.pinned,
            priority: body.priority,
        })
        .await?;

    let mut resp = CreateInstanceResponse {
        instance_id: created.id.clone(),
        name: created.name,
        port: created.port,
        status: created.status,
        pid: None,
        paused_instance: None,
        message: Some("created".to_string()),
        start_error: None,
    };

    // The record exists either way; a failed start is reported, not rolled back.
    if body.auto_start {
        match sup.start_instance(&created.id, StartOverrides::default()).await {
            Ok(out) => {
                resp.status = out.instance.status;
                resp.pid = out.instance.pid;
                resp.paused_instance = out.evicted;
                resp.message = out.instance.message;
            }
            Err(e) => {
                tracing::warn!(id = %created.id, error = %e, "created instance failed to start");
                resp.message = Some("created but not started".to_string());
                resp.start_error = Some(ApiError::from(e));
            }
        }
    }
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct StartInstanceBody {
    instance_id: InstanceId,
    port: Option<i64>,
    model: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartInstanceResponse {
    instance_id: InstanceId,
    status: InstanceStatus,
    port: u16,
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    paused_instance: Option<InstanceId>,
    message: Option<String>,
}

async fn start_instance(
    State(state): State<AppState>,
    payload: Result<Json<StartInstanceBody>, JsonRejection>,
) -> ApiResult<StartInstanceResponse> {
    let Json(body) = payload?;
    let port = body.port.map(port_from).transpose()?;
    let out = state
        .supervisor
        .start_instance(
            &body.instance_id,
            StartOverrides {
                port,
                model_ref: body.model,
            },
        )
        .await?;
    Ok(Json(StartInstanceResponse {
        instance_id: out.instance.id,
        status: out.instance.status,
        port: out.instance.port,
        pid: out.instance.pid,
        paused_instance: out.evicted,
        message: out.instance.message,
    }))
}

#[derive(Debug, Deserialize)]
struct StopInstanceBody {
    instance_id: Option<InstanceId>,
    port: Option<i64>,
}

#[derive(Debug, Serialize)]
struct StopInstanceResponse {
    instance_id: InstanceId,
    status: InstanceStatus,
    result: &'static str,
    message: String,
}

async fn resolve_stop_target(state: &AppState, body: StopInstanceBody) -> Result<InstanceId, ApiError> {
    if let Some(id) = body.instance_id {
        return Ok(id);
    }
    let Some(raw) = body.port else {
        return Err(ApiError::bad_request("instance_id or port is required"));
    };
    let port = port_from(raw)?;
    state
        .supervisor
        .registry()
        .port_holder(port, None)
        .await
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no running instance on port {port}"),
            )
        })
}

async fn stop_instance(
    State(state): State<AppState>,
    payload: Result<Json<StopInstanceBody>, JsonRejection>,
) -> ApiResult<StopInstanceResponse> {
    let Json(body) = payload?;
    let id = resolve_stop_target(&state, body).await?;
    let out = state.supervisor.stop_instance(&id).await?;
    let (result, message) = match out.result {
        StopResult::AlreadyStopped => ("already_stopped", format!("{id} was not running")),
        StopResult::Terminated(TerminateOutcome::Killed) => {
            ("terminated", format!("{id} killed after grace period"))
        }
        StopResult::Terminated(TerminateOutcome::AlreadyExited) => {
            ("terminated", format!("{id} had already exited"))
        }
        StopResult::Terminated(_) => ("terminated", format!("{id} stopped")),
    };
    Ok(Json(StopInstanceResponse {
        instance_id: out.instance.id,
        status: out.instance.status,
        result,
        message,
    }))
}

#[derive(Debug, Deserialize)]
struct InstanceIdBody {
    instance_id: InstanceId,
}

#[derive(Debug, Serialize)]
struct RemoveInstanceResponse {
    instance_id: InstanceId,
    removed: bool,
}

async fn remove_instance(
    State(state): State<AppState>,
    payload: Result<Json<InstanceIdBody>, JsonRejection>,
) -> ApiResult<RemoveInstanceResponse> {
    let Json(body) = payload?;
    let removed = state.supervisor.remove_instance(&body.instance_id).await?;
    Ok(Json(RemoveInstanceResponse {
        instance_id: removed.id,
        removed: true,
    }))
}

#[derive(Debug, Deserialize)]
struct RenameInstanceBody {
    instance_id: InstanceId,
    name: String,
}

async fn rename_instance(
    State(state): State<AppState>,
    payload: Result<Json<RenameInstanceBody>, JsonRejection>,
) -> ApiResult<InstanceView> {
    let Json(body) = payload?;
    let renamed = state
        .supervisor
        .rename_instance(&body.instance_id, &body.name)
        .await?;
    Ok(Json(renamed.into()))
}

#[derive(Debug, Serialize)]
struct ListInstancesResponse {
    instances: Vec<InstanceView>,
}

async fn list_instances(State(state): State<AppState>) -> Json<ListInstancesResponse> {
    let instances = state
        .supervisor
        .list_instances()
        .await
        .into_iter()
        .map(InstanceView::from)
        .collect();
    Json(ListInstancesResponse { instances })
}

#[derive(Debug, Serialize)]
struct ListModelsResponse {
    models_dir: String,
    models: Vec<models::ModelFile>,
}

async fn list_models(State(state): State<AppState>) -> ApiResult<ListModelsResponse> {
    let dir = &state.supervisor.config().models_dir;
    let models = models::list_models(dir)
        .await
        .map_err(|e| ApiError::internal(format!("{e:#}")))?;
    Ok(Json(ListModelsResponse {
        models_dir: dir.display().to_string(),
        models,
    }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    instance_id: InstanceId,
    #[serde(default)]
    cursor: u64,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    instance_id: InstanceId,
    lines: Vec<String>,
    next_cursor: u64,
}

async fn instance_logs(
    State(state): State<AppState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<LogsResponse> {
    let Query(q) = query?;
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let (lines, next_cursor) = state
        .supervisor
        .instance_logs(&q.instance_id, q.cursor, limit)
        .await?;
    Ok(Json(LogsResponse {
        instance_id: q.instance_id,
        lines,
        next_cursor,
    }))
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    ip: String,
    hostname: String,
    port: u16,
    version: &'static str,
    primary: Option<InstanceId>,
    instances: Vec<InstanceView>,
}

async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let instances = state
        .supervisor
        .list_instances()
        .await
        .into_iter()
        .map(InstanceView::from)
        .collect();
    Json(InfoResponse {
        ip: state.info.ip.clone(),
        hostname: state.info.hostname.clone(),
        port: state.info.port,
        version: env!("CARGO_PKG_VERSION"),
        primary: state.info.primary.clone(),
        instances,
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    model_path: Option<String>,
    resources: ResourceSample,
}

/// The controller answers the same health contract as the servers it runs.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let resources = state.supervisor.sample_resources().await;
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.info.model_path.is_some(),
        model_path: state.info.model_path.clone(),
        resources,
    })
}
