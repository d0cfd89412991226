//! Admin HTTP listener: `GET /healthz` and `GET /metrics`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::identity::IdentityStore;
use crate::metrics::MetricsRegistry;

const STORE_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub repo_root: CheckResult,
    pub identity_store: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// What the admin handlers need from the running gateway.
#[derive(Clone)]
pub struct AdminState {
    pub repo_root: PathBuf,
    pub store: Arc<dyn IdentityStore>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The repository root must exist and accept new entries.
async fn check_repo_root(root: &std::path::Path) -> CheckResult {
    let scratch = tempfile::Builder::new()
        .prefix(".healthz-")
        .tempfile_in(root);
    match scratch {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("{} is not writable: {e}", root.display())),
    }
}

/// A lookup of a fingerprint that cannot exist exercises the full store path.
async fn check_identity_store(store: &dyn IdentityStore) -> CheckResult {
    match tokio::time::timeout(
        STORE_CHECK_TIMEOUT,
        store.find_key_by_fingerprint("SHA256:gitgate-healthz"),
    )
    .await
    {
        Ok(Ok(_)) => CheckResult::healthy(),
        Ok(Err(e)) => CheckResult::unhealthy(format!("lookup failed: {e:#}")),
        Err(_) => CheckResult::unhealthy("lookup timed out"),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`.  200 when every check passes, 503 otherwise.
pub async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let (repo_root, identity_store) = tokio::join!(
        check_repo_root(&state.repo_root),
        check_identity_store(state.store.as_ref()),
    );
    let checks = HealthChecks {
        repo_root,
        identity_store,
    };
    let (status, http_status) = if checks.repo_root.ok && checks.identity_store.ok {
        (HealthStatus::Ok, StatusCode::OK)
    } else {
        (HealthStatus::Unhealthy, StatusCode::SERVICE_UNAVAILABLE)
    };
    (http_status, Json(HealthResponse { status, checks }))
}

/// `GET /metrics` in the OpenMetrics text format.
pub async fn metrics_handler(State(state): State<AdminState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the admin router until `shutdown` fires.
pub async fn run_admin_server(
    listen: &str,
    state: AdminState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listen_addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid admin listen address: {listen:?}"))?;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "admin HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("admin HTTP server error")?;
    Ok(())
}
