use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use pass_reclaim_api::{
    AppConfig, ExecutionReport, PlanReport, PoolSnapshot, ReclaimSession, SearchOverrides,
    SearchReport, API_CONTRACT_VERSION,
};
use pass_reclaim_core::RecyclePool;
use pass_reclaim_store_sqlite::SqlitePool;
use pass_reclaim_vendor::{HttpMemberDirectory, MemberDirectory};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

struct ServiceState<D, P> {
    session: Arc<Mutex<ReclaimSession<D, P>>>,
}

impl<D, P> Clone for ServiceState<D, P> {
    fn clone(&self) -> Self {
        Self { session: Arc::clone(&self.session) }
    }
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
    service_contract_version: &'static str,
    error: String,
}

impl ServiceError {
    fn new(message: impl Into<String>) -> Self {
        Self { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
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

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct StateResponse {
    state: String,
}

/// The web form posts the textarea verbatim: one name per line.
#[derive(Debug, Clone, Deserialize)]
struct SearchRequest {
    names: String,
    #[serde(default)]
    overrides: Option<SearchOverrides>,
}

#[derive(Debug, Clone, Deserialize)]
struct PlanRequest {
    #[serde(default)]
    limit: Option<usize>,
}

/// `acknowledged` is the confirmation checkbox; execution refuses without it.
#[derive(Debug, Clone, Deserialize)]
struct ExecuteRequest {
    acknowledged: bool,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[derive(Debug, Parser)]
#[command(name = "pass-reclaim-service")]
#[command(about = "Local HTTP surface for the pass reclaim flow")]
struct Args {
    #[arg(long, default_value = "./pass-reclaim.yaml")]
    config: PathBuf,
    #[arg(long, default_value = "./pass_reclaim_pool.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

fn app<D, P>(state: ServiceState<D, P>) -> Router
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
{
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/state", get(flow_state::<D, P>))
        .route("/v1/search", post(search::<D, P>))
        .route("/v1/plan", post(plan::<D, P>))
        .route("/v1/execute", post(execute::<D, P>))
        .route("/v1/pool", get(pool::<D, P>))
        .route("/v1/missing", get(missing::<D, P>))
        .route("/v1/reset", post(reset::<D, P>))
        .with_state(state)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    let mut store = SqlitePool::open(&args.db)?;
    store.migrate()?;
    let directory = HttpMemberDirectory::new(&config.directory_config());
    let session = ReclaimSession::new(directory, store, config.defaults.clone());
    let state = ServiceState { session: Arc::new(Mutex::new(session)) };

    tracing::info!(bind = %args.bind, "pass-reclaim service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Run a blocking session closure off the async runtime; the session mutex
/// serializes runs, so one vendor call is outstanding at a time.
async fn with_session<D, P, T, F>(
    state: ServiceState<D, P>,
    call: F,
) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
    T: Serialize + Send + 'static,
    F: FnOnce(&mut ReclaimSession<D, P>) -> anyhow::Result<T> + Send + 'static,
{
    let session = Arc::clone(&state.session);
    let joined = tokio::task::spawn_blocking(move || {
        let mut guard = session
            .lock()
            .map_err(|_| anyhow::anyhow!("reconcile session lock is poisoned"))?;
        call(&mut guard)
    })
    .await;

    match joined {
        Ok(Ok(data)) => Ok(Json(envelope(data))),
        Ok(Err(err)) => Err(ServiceError::new(err.to_string())),
        Err(err) => Err(ServiceError::new(format!("session task failed: {err}"))),
    }
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn flow_state<D, P>(
    State(state): State<ServiceState<D, P>>,
) -> Result<Json<ServiceEnvelope<StateResponse>>, ServiceError>
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
{
    with_session(state, |session| {
        Ok(StateResponse { state: session.state().as_str().to_string() })
    })
    .await
}

async fn search<D, P>(
    State(state): State<ServiceState<D, P>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<ServiceEnvelope<SearchReport>>, ServiceError>
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
{
    with_session(state, move |session| {
        session.run_search(&request.names, &request.overrides.unwrap_or_default())
    })
    .await
}

async fn plan<D, P>(
    State(state): State<ServiceState<D, P>>,
    Json(request): Json<PlanRequest>,
) -> Result<Json<ServiceEnvelope<PlanReport>>, ServiceError>
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
{
    with_session(state, move |session| session.plan(request.limit)).await
}

async fn execute<D, P>(
    State(state): State<ServiceState<D, P>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ServiceEnvelope<ExecutionReport>>, ServiceError>
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
{
    with_session(state, move |session| {
        session.execute(request.acknowledged, request.limit, request.delay_ms)
    })
    .await
}

async fn pool<D, P>(
    State(state): State<ServiceState<D, P>>,
) -> Result<Json<ServiceEnvelope<PoolSnapshot>>, ServiceError>
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
{
    with_session(state, |session| session.pool_snapshot()).await
}

async fn missing<D, P>(
    State(state): State<ServiceState<D, P>>,
) -> Result<Json<ServiceEnvelope<Vec<String>>>, ServiceError>
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
{
    with_session(state, |session| {
        let snapshot = session.pool_snapshot()?;
        Ok(snapshot.missing)
    })
    .await
}

async fn reset<D, P>(
    State(state): State<ServiceState<D, P>>,
) -> Result<Json<ServiceEnvelope<StateResponse>>, ServiceError>
where
    D: MemberDirectory + Send + 'static,
    P: RecyclePool + Send + 'static,
{
    with_session(state, |session| {
        session.reset();
        Ok(StateResponse { state: session.state().as_str().to_string() })
    })
    .await
}
