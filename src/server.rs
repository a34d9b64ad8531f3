//!
//! tka HTTP server
//! ---------------
//! Axum routes for the signin API plus the wiring that builds stores, the
//! provisioner, the registrar and the controller from a `ServerConfig`.
//!
//! Handlers never provision inline: they call the registrar, which only reads
//! and writes signin records. Every handler is bounded by the request timeout and
//! guarded against panics; errors leave as `{"status":"error","code","message"}`.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::FutureExt; // for catch_unwind on async blocks
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{
    ErrorBody, LogoutState, LogoutView, SigninPayload, SigninView, HEALTHZ_PATH, KUBECONFIG_PATH, LOGOUT_PATH,
    RETRY_AFTER_SECS, SIGNIN_PATH, STATUS_PATH,
};
use crate::clock::{Clock, SystemClock};
use crate::cluster::{ClusterApi, ClusterInfo, KubeCluster, MemoryCluster};
use crate::config::{Backend, ServerConfig};
use crate::controller::{panic_message, Controller, ExpirySweeper, Reconciler};
use crate::error::{AppError, AppResult, ErrorKind};
use crate::identity::{GateRequest, IdentityGate};
use crate::provisioner::Provisioner;
use crate::registrar::{CreateOutcome, Registrar, SignoutOutcome};
use crate::scheme::Scheme;
use crate::store::{MemorySigninStore, SigninStore};

/// API server address written into profiles by the memory backend when none is configured.
const DEFAULT_MEMORY_SERVER: &str = "https://kubernetes.default.svc";

/// Shared state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registrar: Arc<Registrar>,
    pub clock: Arc<dyn Clock>,
    pub request_timeout: Duration,
}

/// Everything a running server needs, built once at startup.
pub struct Services {
    pub state: AppState,
    pub controller: Arc<Controller>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody::new(self.code_str(), self.message());
        let mut resp = (status, Json(body)).into_response();
        if self.kind() == ErrorKind::NotReady {
            resp.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        resp
    }
}

/// Bound a handler body by the request timeout and turn panics into 500s.
async fn guarded<T, F>(state: &AppState, op: &'static str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(state.request_timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Err(_) => Err(AppError::timeout("request_timeout".to_string(), format!("{} did not finish in {:?}", op, state.request_timeout))),
        Ok(Err(panic)) => {
            let msg = panic_message(panic.as_ref());
            error!(op, panic = %msg, "handler panicked");
            Err(AppError::internal("internal_error", "internal error"))
        }
        Ok(Ok(res)) => res,
    }
}

fn log_rejection(op: &'static str, e: &AppError) {
    match e.kind() {
        ErrorKind::Internal | ErrorKind::Timeout | ErrorKind::Provision => warn!(op, code = %e.code, error = %e, "request failed"),
        _ => debug!(op, code = %e.code, "request rejected"),
    }
}

async fn signin(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let req = GateRequest::new(Some(peer), headers);
    let result = guarded(&state, "signin", async {
        let payload: SigninPayload = if body.iter().all(u8::is_ascii_whitespace) {
            SigninPayload::default()
        } else {
            serde_json::from_slice(&body)
                .map_err(|e| AppError::user("invalid_body", "signin body must be a JSON object").with_cause(e))?
        };
        state.registrar.signin(&req, payload.role.as_deref()).await
    })
    .await;
    let outcome = result.inspect_err(|e| log_rejection("signin", e))?;
    let status = if outcome.is_created() { StatusCode::ACCEPTED } else { StatusCode::OK };
    let view = SigninView::from_record(outcome.record(), state.clock.now());
    if let CreateOutcome::Created(r) = &outcome {
        info!(principal = %r.spec.principal, role = %r.spec.role, "signin accepted");
    }
    Ok((status, Json(view)).into_response())
}

async fn signin_status(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<SigninView>, AppError> {
    let req = GateRequest::new(Some(peer), headers);
    let record = guarded(&state, "status", state.registrar.status(&req))
        .await
        .inspect_err(|e| log_rejection("status", e))?;
    Ok(Json(SigninView::from_record(&record, state.clock.now())))
}

async fn kubeconfig(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let req = GateRequest::new(Some(peer), headers);
    let profile = guarded(&state, "kubeconfig", state.registrar.kubeconfig(&req))
        .await
        .inspect_err(|e| log_rejection("kubeconfig", e))?;
    Ok((StatusCode::OK, Json(profile)).into_response())
}

async fn logout(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let req = GateRequest::new(Some(peer), headers);
    let outcome = guarded(&state, "logout", state.registrar.signout(&req))
        .await
        .inspect_err(|e| log_rejection("logout", e))?;
    let (status, outcome) = match outcome {
        SignoutOutcome::Pending => (StatusCode::ACCEPTED, LogoutState::Pending),
        SignoutOutcome::Absent => (StatusCode::OK, LogoutState::Absent),
    };
    Ok((status, Json(LogoutView { status: "ok".to_string(), outcome })).into_response())
}

async fn healthz() -> impl IntoResponse { Json(serde_json::json!({"status": "ok"})) }

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(SIGNIN_PATH, post(signin))
        .route(STATUS_PATH, get(signin_status))
        .route(KUBECONFIG_PATH, get(kubeconfig))
        .route(LOGOUT_PATH, post(logout))
        .route(HEALTHZ_PATH, get(healthz))
        .with_state(state)
}

/// Wire stores, provisioner, registrar and controller for `config`.
pub fn build_services(config: &ServerConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Services> {
    let scheme = Arc::new(Scheme::with_defaults());

    let cluster: Arc<dyn ClusterApi> = match config.backend {
        Backend::Memory => {
            let info = ClusterInfo {
                server: config.api_server.clone().unwrap_or_else(|| DEFAULT_MEMORY_SERVER.to_string()),
                certificate_authority_data: None,
                insecure_skip_tls_verify: false,
            };
            Arc::new(MemoryCluster::new(scheme.clone(), clock.clone(), info))
        }
        Backend::Kube => Arc::new(
            KubeCluster::in_cluster(scheme.clone(), config.request_timeout, config.api_server.clone())
                .context("configuring Kubernetes backend")?,
        ),
    };

    let store: Arc<dyn SigninStore> = match &config.state_dir {
        Some(dir) => Arc::new(
            MemorySigninStore::open(scheme.clone(), clock.clone(), dir)
                .with_context(|| format!("opening signin state under {}", dir.display()))?,
        ),
        None => Arc::new(MemorySigninStore::new(scheme.clone(), clock.clone())),
    };

    let provisioner = Arc::new(Provisioner::new(cluster, scheme.clone(), clock.clone(), config.provisioner_config()));
    let registrar = Arc::new(Registrar::new(
        store.clone(),
        provisioner.clone(),
        IdentityGate::new(config.gate_config()),
        clock.clone(),
        scheme,
    ));
    let sweeper = Arc::new(ExpirySweeper::new(store.clone(), provisioner.clone(), clock.clone()));
    let reconciler = Arc::new(Reconciler::new(store.clone(), provisioner, sweeper.clone(), clock.clone()));
    let controller = Arc::new(Controller::new(store, reconciler, sweeper, config.controller_config()));

    Ok(Services {
        state: AppState { registrar, clock, request_timeout: config.request_timeout },
        controller,
    })
}

fn log_startup(config: &ServerConfig) {
    info!(
        target: "startup",
        "tka starting: listen={}, backend={:?}, namespace={}, cluster={}, capability={}, allowed_roles={:?}, default_ttl={:?}, max_ttl={:?}, require_loopback={}",
        config.socket_addr(), config.backend, config.namespace, config.cluster_name, config.capability,
        config.allowed_roles, config.default_ttl, config.max_ttl, config.require_loopback
    );
    info!(
        target: "startup",
        "controller: workers={}, resync={:?}, request_timeout={:?}, retry_budget={}, state_dir={:?}",
        config.workers, config.resync_interval, config.request_timeout, config.retry.budget, config.state_dir
    );
}

/// Serve the API on `listener` and run the controller until `shutdown` resolves.
/// HTTP stops accepting first, then the controller drains its in-flight passes.
pub async fn serve<S>(listener: TcpListener, services: Services, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let controller = tokio::spawn(services.controller.clone().run(stop_rx));

    let app = router(services.state);
    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = stop_tx.send(true);
    match controller.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "controller stopped with error"),
        Err(e) => error!(error = %e, "controller task failed"),
    }
    served.context("http server")?;
    info!(target: "startup", "tka stopped");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target: "startup", "shutdown requested");
}

/// Validate `config`, bind, and serve until SIGINT/SIGTERM.
pub async fn run_with_config(config: ServerConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    log_startup(&config);
    let services = build_services(&config, Arc::new(SystemClock))?;
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    info!(target: "startup", "tka listening on {}", addr);
    serve(listener, services, shutdown_signal()).await
}
