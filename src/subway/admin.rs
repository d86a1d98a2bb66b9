use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::subway::tunnel::registry::Registry;

#[derive(Clone)]
pub struct AdminState {
    /// Absent when this process only runs a tunnel client.
    pub registry: Option<Arc<Registry>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tunnels", get(tunnels))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");
    serve_listener(listener, state, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    tunnels: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let tunnels = st.registry.as_ref().map_or(0, |r| r.len());
    (StatusCode::OK, Json(HealthResponse { ok: true, tunnels }))
}

async fn tunnels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = st
        .registry
        .as_ref()
        .map(|r| r.snapshot())
        .unwrap_or_default();
    (StatusCode::OK, Json(snap))
}
