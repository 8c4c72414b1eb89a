use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use ledger_kernel_api::{
    CandidateRequest, CreateTodoRequest, DeleteTodoRequest, LedgerKernelApi, MigrateResult,
    PollStatusResult, UpdateTodoRequest, VoteRequest, API_CONTRACT_VERSION,
};
use ledger_kernel_core::{
    Address, Addressed, Candidate, LedgerError, NewPoll, Poll, Principal, TaskRecord,
};
use ledger_kernel_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const PRINCIPAL_HEADER: &str = "x-ledger-principal";
const DEFAULT_LOG_FILTER: &str = "ledger_kernel=info";

#[derive(Debug, Clone)]
struct ServiceState {
    api: LedgerKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TodoListQuery {
    owner: Option<Principal>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "ledger-kernel-service")]
#[command(about = "Local HTTP service for the Ledger Kernel")]
struct Args {
    #[arg(long, env = "LEDGER_KERNEL_DB", default_value = "./ledger_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "LEDGER_KERNEL_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: message.into(),
        }
    }

    fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    }

    fn bad_request(status: StatusCode, message: String) -> Self {
        warn!(%status, error = %message, "request input rejected");
        Self::new(status, "bad_request", message)
    }

    fn from_api(err: &anyhow::Error) -> Self {
        let ledger_error = err.chain().find_map(|cause| cause.downcast_ref::<LedgerError>());
        match ledger_error {
            Some(ledger_error) if !matches!(ledger_error, LedgerError::Substrate(_)) => {
                let status = status_for(ledger_error);
                warn!(code = ledger_error.code(), %status, "request rejected");
                Self::new(status, ledger_error.code(), format!("{err:#}"))
            }
            Some(ledger_error) => {
                error!(error = %err, "substrate failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, ledger_error.code(), format!("{err:#}"))
            }
            None => {
                error!(error = %err, "internal failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{err:#}"))
            }
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.status(), rejection.body_text())
    }
}

impl From<PathRejection> for ServiceError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.status(), rejection.body_text())
    }
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::AlreadyExists { .. }
        | LedgerError::CandidateLimitExceeded { .. }
        | LedgerError::PollClosed { .. } => StatusCode::CONFLICT,
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        LedgerError::InvalidTimeWindow { .. }
        | LedgerError::InvalidKey(_)
        | LedgerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::Substrate(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn caller(headers: &HeaderMap) -> Result<Principal, ServiceError> {
    let raw = headers
        .get(PRINCIPAL_HEADER)
        .ok_or_else(|| ServiceError::unauthenticated(format!("missing {PRINCIPAL_HEADER} header")))?;
    let raw = raw.to_str().map_err(|_| {
        ServiceError::unauthenticated(format!("{PRINCIPAL_HEADER} header is not visible ASCII"))
    })?;
    Principal::new(raw).map_err(|err| ServiceError::unauthenticated(err.to_string()))
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/todo", get(todo_list))
        .route("/v1/todo/create", post(todo_create))
        .route("/v1/todo/update", post(todo_update))
        .route("/v1/todo/delete", post(todo_delete))
        .route("/v1/todo/:address", get(todo_show))
        .route("/v1/poll", get(poll_list))
        .route("/v1/poll/initialize", post(poll_initialize))
        .route("/v1/poll/candidate/initialize", post(candidate_initialize))
        .route("/v1/poll/vote", post(poll_vote))
        .route("/v1/poll/:poll_id", get(poll_show))
        .route("/v1/poll/:poll_id/candidates", get(candidate_list))
        .route("/v1/poll/:poll_id/status", get(poll_status))
        .with_state(state)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let state = ServiceState { api: LedgerKernelApi::new(args.db.clone()) };
    state
        .api
        .migrate(false)
        .with_context(|| format!("failed to migrate ledger database {}", args.db.display()))?;

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, db = %args.db.display(), "ledger kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let Json(request) = payload?;
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = state.api.integrity_check().map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(report)))
}

async fn todo_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<CreateTodoRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Addressed<TaskRecord>>>, ServiceError> {
    let Json(request) = payload?;
    let caller = caller(&headers)?;
    let task =
        state.api.todo_create(request, &caller).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(task)))
}

async fn todo_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<UpdateTodoRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Addressed<TaskRecord>>>, ServiceError> {
    let Json(request) = payload?;
    let caller = caller(&headers)?;
    let task =
        state.api.todo_update(request, &caller).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(task)))
}

async fn todo_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<DeleteTodoRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Addressed<TaskRecord>>>, ServiceError> {
    let Json(request) = payload?;
    let caller = caller(&headers)?;
    let task =
        state.api.todo_delete(request, &caller).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(task)))
}

async fn todo_list(
    State(state): State<ServiceState>,
    query: Result<Query<TodoListQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<Addressed<TaskRecord>>>>, ServiceError> {
    let Query(query) = query?;
    let tasks =
        state.api.todo_list(query.owner.as_ref()).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(tasks)))
}

async fn todo_show(
    State(state): State<ServiceState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<ServiceEnvelope<Addressed<TaskRecord>>>, ServiceError> {
    let Path(address) = path?;
    let address = Address::parse_hex(&address)
        .map_err(|err| ServiceError::from_api(&anyhow::Error::from(err)))?;
    let task =
        state.api.todo_show_by_address(&address).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(task)))
}

async fn poll_initialize(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<NewPoll>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Addressed<Poll>>>, ServiceError> {
    let Json(request) = payload?;
    let caller = caller(&headers)?;
    info!(%caller, poll_id = request.poll_id, "poll initialization requested");
    let poll = state.api.poll_initialize(request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(poll)))
}

async fn candidate_initialize(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<CandidateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Addressed<Candidate>>>, ServiceError> {
    let Json(request) = payload?;
    let caller = caller(&headers)?;
    info!(%caller, poll_id = request.poll_id, "candidate registration requested");
    let candidate =
        state.api.candidate_initialize(request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(candidate)))
}

async fn poll_vote(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Addressed<Candidate>>>, ServiceError> {
    let Json(request) = payload?;
    let caller = caller(&headers)?;
    info!(%caller, poll_id = request.poll_id, "vote requested");
    let candidate = state.api.vote(request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(candidate)))
}

async fn poll_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Addressed<Poll>>>>, ServiceError> {
    let polls = state.api.poll_list().map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(polls)))
}

async fn poll_show(
    State(state): State<ServiceState>,
    path: Result<Path<u64>, PathRejection>,
) -> Result<Json<ServiceEnvelope<Addressed<Poll>>>, ServiceError> {
    let Path(poll_id) = path?;
    let poll = state.api.poll_show(poll_id).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(poll)))
}

async fn candidate_list(
    State(state): State<ServiceState>,
    path: Result<Path<u64>, PathRejection>,
) -> Result<Json<ServiceEnvelope<Vec<Addressed<Candidate>>>>, ServiceError> {
    let Path(poll_id) = path?;
    let candidates =
        state.api.candidate_list(poll_id).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(candidates)))
}

async fn poll_status(
    State(state): State<ServiceState>,
    path: Result<Path<u64>, PathRejection>,
) -> Result<Json<ServiceEnvelope<PollStatusResult>>, ServiceError> {
    let Path(poll_id) = path?;
    let status = state.api.poll_status(poll_id).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(envelope(status)))
}
