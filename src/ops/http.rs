//! HTTP surface of the operator API.
//!
//! The installer hosts this while acting as the wizard; a running cluster
//! hosts the same API. The join peer consumes it through
//! `ops::client::HttpOperator`. Requests are authenticated with a bearer
//! token that must match the operation's credential bundle.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use slog::{error, info, Logger};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::error::{Error, Result};
use crate::ops::events::AuditEvent;
use crate::ops::operator::{LocalOperator, Operator};
use crate::ops::{
    Cluster, NewExpandOperation, Operation, OperationKey, OperationState, ProgressEntry, Server,
};
use crate::plan::{OperationPlan, PhaseState};
use crate::rpc::Credentials;

/// Default port of the operator API when a peer address carries none.
pub const DEFAULT_OPERATOR_PORT: u16 = 32100;

/// Wizard discovery payload: the cluster under installation and its install
/// operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WizardInfo {
    pub cluster: Cluster,
    pub operation: Operation,
}

#[derive(Clone)]
struct AppState {
    operator: Arc<LocalOperator>,
    credentials: Credentials,
    logger: Logger,
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::AccessDenied(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::CompareFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::ConnectionProblem(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Aborted(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.0)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> ApiError {
        ApiError(err)
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Handle to a running operator API server.
pub struct OperatorHttpHandle {
    pub addr: SocketAddr,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl OperatorHttpHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

/// Starts the operator API on the given address.
pub async fn serve(
    addr: SocketAddr,
    operator: Arc<LocalOperator>,
    credentials: Credentials,
    cancel: CancellationToken,
    logger: Logger,
) -> Result<OperatorHttpHandle> {
    let state = AppState {
        operator,
        credentials,
        logger: logger.clone(),
    };

    let app = Router::new()
        .route("/v1/wizard", get(handle_wizard))
        .route("/v1/cluster", get(handle_cluster))
        .route("/v1/operations/expand", post(handle_create_expand))
        .route(
            "/v1/operations/{id}",
            get(handle_get_operation).delete(handle_delete_operation),
        )
        .route("/v1/operations/{id}/state", put(handle_set_state))
        .route("/v1/operations/{id}/servers", put(handle_set_servers))
        .route("/v1/operations/{id}/report", get(handle_report))
        .route(
            "/v1/operations/{id}/plan",
            get(handle_get_plan).post(handle_create_plan),
        )
        .route(
            "/v1/operations/{id}/phase",
            get(handle_get_phase).put(handle_update_phase),
        )
        .route("/v1/operations/{id}/phases", get(handle_list_phases))
        .route(
            "/v1/operations/{id}/progress",
            get(handle_get_progress).post(handle_create_progress),
        )
        .route("/v1/operations/{id}/logs", post(handle_logs))
        .route("/v1/events", post(handle_audit_event))
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        error!(logger, "Failed to bind operator API"; "addr" => %addr, "error" => %err);
        Error::from(err)
    })?;
    let local_addr = listener.local_addr()?;
    info!(logger, "Operator API listening"; "addr" => %local_addr);

    let shutdown = cancel.clone();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
    });

    Ok(OperatorHttpHandle {
        addr: local_addr,
        cancel,
        task,
    })
}

async fn auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| state.credentials.matches(token))
        .unwrap_or(false);
    if !authorized {
        return ApiError(Error::access_denied("bad secret token")).into_response();
    }
    next.run(request).await
}

impl AppState {
    /// Builds the full operation key from the cluster this operator serves.
    async fn key(&self, operation_id: &str) -> Result<OperationKey> {
        let cluster = self.operator.get_cluster().await?;
        Ok(OperationKey {
            account_id: cluster.account_id,
            cluster_domain: cluster.domain,
            operation_id: operation_id.to_string(),
        })
    }
}

async fn handle_wizard(State(state): State<AppState>) -> ApiResult<WizardInfo> {
    let cluster = state.operator.get_cluster().await?;
    let operation = state.operator.get_install_operation().await?;
    Ok(Json(WizardInfo { cluster, operation }))
}

async fn handle_cluster(State(state): State<AppState>) -> ApiResult<Cluster> {
    Ok(Json(state.operator.get_cluster().await?))
}

async fn handle_create_expand(
    State(state): State<AppState>,
    Json(req): Json<NewExpandOperation>,
) -> ApiResult<Operation> {
    Ok(Json(state.operator.create_expand_operation(req).await?))
}

async fn handle_get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Operation> {
    let key = state.key(&id).await?;
    Ok(Json(state.operator.get_operation(&key).await?))
}

async fn handle_delete_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let key = state.key(&id).await?;
    state.operator.delete_operation(&key).await?;
    Ok(Json(()))
}

#[derive(Deserialize)]
struct SetStateRequest {
    state: OperationState,
}

async fn handle_set_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetStateRequest>,
) -> ApiResult<()> {
    let key = state.key(&id).await?;
    state.operator.set_operation_state(&key, req.state).await?;
    Ok(Json(()))
}

async fn handle_set_servers(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(servers): Json<Vec<Server>>,
) -> ApiResult<()> {
    let key = state.key(&id).await?;
    state.operator.update_expand_servers(&key, servers).await?;
    Ok(Json(()))
}

async fn handle_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::ops::AgentReport> {
    let key = state.key(&id).await?;
    Ok(Json(state.operator.get_agent_report(&key).await?))
}

async fn handle_create_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(plan): Json<OperationPlan>,
) -> ApiResult<()> {
    let key = state.key(&id).await?;
    state.operator.create_plan(&key, plan).await?;
    Ok(Json(()))
}

async fn handle_get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<OperationPlan> {
    let key = state.key(&id).await?;
    Ok(Json(state.operator.get_plan(&key).await?))
}

#[derive(Deserialize)]
struct PhaseQuery {
    phase: String,
}

async fn handle_get_phase(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PhaseQuery>,
) -> ApiResult<PhaseState> {
    let key = state.key(&id).await?;
    Ok(Json(
        state.operator.get_phase_state(&key, &query.phase).await?,
    ))
}

async fn handle_update_phase(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(phase_state): Json<PhaseState>,
) -> ApiResult<()> {
    let key = state.key(&id).await?;
    state.operator.update_phase_state(&key, phase_state).await?;
    Ok(Json(()))
}

async fn handle_list_phases(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<PhaseState>> {
    let key = state.key(&id).await?;
    Ok(Json(state.operator.list_phase_states(&key).await?))
}

async fn handle_get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProgressEntry> {
    let key = state.key(&id).await?;
    Ok(Json(state.operator.get_progress(&key).await?))
}

async fn handle_create_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(entry): Json<ProgressEntry>,
) -> ApiResult<()> {
    let key = state.key(&id).await?;
    state.operator.create_progress_entry(&key, entry).await?;
    Ok(Json(()))
}

async fn handle_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<()> {
    let key = state.key(&id).await?;
    state
        .operator
        .stream_operation_logs(&key, body.to_vec())
        .await?;
    Ok(Json(()))
}

async fn handle_audit_event(
    State(state): State<AppState>,
    Json(event): Json<AuditEvent>,
) -> ApiResult<()> {
    state.operator.emit_audit_event(event).await?;
    Ok(Json(()))
}
