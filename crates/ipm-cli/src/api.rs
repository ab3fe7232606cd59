use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ipm_cluster::{peer, ClusterError, HubHandle, HubStatus, Message};
use ipm_core::{Error, Rule};
use ipm_ipt::Engine;
use ipm_metrics::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hub: HubHandle,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub id: String,
}

/// Error rendered as `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        if !e.is_client_error() {
            error!("Request failed: {}", e);
        }
        let status = match e {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Core(e) => e.into(),
            other => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/iptables/rules", post(create_rules).delete(delete_rules))
        .route("/api/v1/cluster", get(cluster).post(cluster))
        .route("/api/v1/cluster/status", get(cluster_status))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    info!("{} request to {}", request.method(), request.uri());
    next.run(request).await
}

async fn create_rules(
    State(state): State<AppState>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<Json<CreateResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if request.rules.is_empty() {
        return Err(ApiError::bad_request("rule set contains no rules"));
    }

    let (id, _) = state.engine.submit_rule_set(&request.rules).await?;

    if let Some(entry) = state.engine.registry().get(&id) {
        info!("Broadcasting CreateRuleSet {}", id);
        if let Err(e) = state.hub.broadcast(Message::create_rule_set(&id, &entry)).await {
            warn!("Failed to broadcast rule set {}: {}", id, e);
        }
    }

    Ok(Json(CreateResponse { id }))
}

async fn delete_rules(
    State(state): State<AppState>,
    payload: Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    if let Some(epoch) = state.engine.remove_rule_set(&request.id).await? {
        info!("Broadcasting DeleteRuleSet {}", request.id);
        if let Err(e) = state
            .hub
            .broadcast(Message::delete_rule_set(&request.id, epoch))
            .await
        {
            warn!("Failed to broadcast deletion of {}: {}", request.id, e);
        }
    }

    Ok(StatusCode::OK)
}

async fn cluster(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let addr = connect
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    peer::upgrade(state.hub.clone(), &headers, &addr, ws).await
}

async fn cluster_status(State(state): State<AppState>) -> Result<Json<HubStatus>, ApiError> {
    Ok(Json(state.hub.status().await?))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to render metrics: {}", e),
        }
        .into_response(),
    }
}
