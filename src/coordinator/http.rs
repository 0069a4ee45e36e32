//! HTTP API of the proxy
//!
//! - `POST /rpc/:method?virtual_storage=&relative_path=` routes one RPC; the
//!   method name is a single percent-encoded segment. Bodies of streaming
//!   accessors are forwarded as they arrive, others are buffered up to
//!   `MAX_BODY_BYTES`.
//! - `POST /transactions/:id/vote` and `/transactions/:id/stop` for
//!   participants that vote out of band
//! - health, readiness, metrics and admin listings

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, MetricsRegistry, Vote};
use crate::coordinator::router::{Coordinator, RepositoryKey, RequestBody, RouteResponse};
use crate::coordinator::rpc::{classify, Rpc};
use crate::datastore::queue::ReplicationQueue;
use crate::datastore::repositories::RepositoryStore;
use axum::{
    body::{to_bytes, Body},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<dyn RepositoryStore>,
    pub queue: Arc<dyn ReplicationQueue>,
    pub metrics: Arc<MetricsRegistry>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let code = self.to_grpc_status().code();
        (
            status,
            Json(json!({
                "error": self.to_string(),
                "code": format!("{:?}", code),
            })),
        )
            .into_response()
    }
}

pub fn create_router(state: ProxyState) -> Router {
    Router::new()
        .route("/rpc/:method", post(route_rpc))
        .route("/transactions/:id/vote", post(vote))
        .route("/transactions/:id/stop", post(stop))
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .route("/admin/nodes", get(admin_nodes))
        .route("/admin/jobs", get(admin_jobs))
        .route("/admin/repositories/:virtual_storage", get(admin_repositories))
        .route("/admin/transactions", get(admin_transactions))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_tracing_middleware))
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RpcQuery {
    virtual_storage: String,
    relative_path: String,
}

async fn route_rpc(
    State(state): State<ProxyState>,
    Path(method): Path<String>,
    Query(query): Query<RpcQuery>,
    body: Body,
) -> Result<Response, Error> {
    let key = RepositoryKey::new(query.virtual_storage, query.relative_path);
    let body = match classify(&method) {
        Ok(Rpc::Accessor {
            streaming: true, ..
        }) => RequestBody::Stream(Box::pin(
            body.into_data_stream()
                .map_err(|e| Error::Http(format!("request body: {}", e))),
        )),
        _ => RequestBody::Buffered(
            to_bytes(body, MAX_BODY_BYTES)
                .await
                .map_err(|e| Error::InvalidArgument(format!("request body: {}", e)))?,
        ),
    };
    let response = state.coordinator.route(&method, &key, body).await?;
    let response = match response {
        RouteResponse::Unary(body) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            body,
        )
            .into_response(),
        RouteResponse::Stream(stream) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from_stream(stream),
        )
            .into_response(),
    };
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    participant: String,
    /// Hex encoded
    fingerprint: String,
}

async fn vote(
    State(state): State<ProxyState>,
    Path(id): Path<u64>,
    Json(req): Json<VoteRequest>,
) -> Result<impl IntoResponse, Error> {
    let vote = Vote::from_hex(&req.fingerprint)?;
    let outcome = state
        .coordinator
        .transactions()
        .vote(id, &req.participant, vote)
        .await?;
    Ok(Json(outcome))
}

async fn stop(
    State(state): State<ProxyState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, Error> {
    let decision = state.coordinator.transactions().stop(id)?;
    Ok(Json(decision))
}

async fn health(State(state): State<ProxyState>) -> impl IntoResponse {
    let nodes = state.coordinator.health().status();
    let healthy = nodes.iter().filter(|n| n.healthy).count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "nodes": nodes.len(),
        "healthy_nodes": healthy,
        "uptime_seconds": state.metrics.uptime_seconds(),
    }))
}

/// Ready once every virtual storage has a primary
async fn health_ready(State(state): State<ProxyState>) -> impl IntoResponse {
    let health = state.coordinator.health();
    let missing: Vec<String> = health
        .virtual_storages()
        .into_iter()
        .filter(|vs| health.primary_node(vs).is_err())
        .collect();

    if missing.is_empty() {
        (StatusCode::OK, Json(json!({ "ready": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ready": false,
                "without_primary": missing,
            })),
        )
    }
}

async fn metrics(State(state): State<ProxyState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

async fn admin_nodes(State(state): State<ProxyState>) -> impl IntoResponse {
    Json(state.coordinator.health().status())
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    virtual_storage: Option<String>,
}

async fn admin_jobs(
    State(state): State<ProxyState>,
    Query(query): Query<JobsQuery>,
) -> Result<impl IntoResponse, Error> {
    let storages = match query.virtual_storage {
        Some(vs) => {
            // rejects unknown names
            state.coordinator.health().nodes(&vs)?;
            vec![vs]
        }
        None => state.coordinator.health().virtual_storages(),
    };

    let mut jobs = Vec::new();
    for vs in storages {
        jobs.extend(state.queue.list_jobs(&vs).await?);
    }
    Ok(Json(jobs))
}

async fn admin_repositories(
    State(state): State<ProxyState>,
    Path(virtual_storage): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.coordinator.health().nodes(&virtual_storage)?;
    let repositories = state.store.list_repositories(&virtual_storage).await?;
    Ok(Json(repositories))
}

async fn admin_transactions(State(state): State<ProxyState>) -> impl IntoResponse {
    Json(state.coordinator.transactions().list())
}
