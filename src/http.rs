//! HTTP surface. Task endpoints authenticate with a bearer account token;
//! admin endpoints require the shared admin token header.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::types::{TaskRequest, TaskType, Tier};

#[derive(Clone)]
pub struct HttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
}

impl HttpState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/v1/interpret-card", post(interpret_card))
        .route("/v1/synthesize-reading", post(synthesize_reading))
        .route("/v1/narrate", post(narrate))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/admin/abuse/:account/reset", post(admin_reset_abuse))
        .route("/admin/accounts/:account/tier", put(admin_set_tier))
        .route("/admin/usage", get(admin_usage))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TaskBody {
    #[serde(default)]
    persona: Option<String>,
    prompt: String,
    #[serde(default)]
    context: BTreeMap<String, String>,
    #[serde(default)]
    correlation_flagged: bool,
}

fn bearer_account(headers: &HeaderMap) -> Result<String, Response> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let token = raw.strip_prefix("Bearer ").unwrap_or("").trim();
    if token.is_empty() {
        return Err((
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "missing bearer account token" })),
        )
            .into_response());
    }
    Ok(token.to_string())
}

async fn interpret_card(
    state: State<HttpState>,
    headers: HeaderMap,
    body: axum::Json<TaskBody>,
) -> Response {
    task_endpoint(TaskType::InterpretCard, state, headers, body).await
}

async fn synthesize_reading(
    state: State<HttpState>,
    headers: HeaderMap,
    body: axum::Json<TaskBody>,
) -> Response {
    task_endpoint(TaskType::SynthesizeReading, state, headers, body).await
}

async fn narrate(
    state: State<HttpState>,
    headers: HeaderMap,
    body: axum::Json<TaskBody>,
) -> Response {
    task_endpoint(TaskType::Narrate, state, headers, body).await
}

async fn task_endpoint(
    task: TaskType,
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: axum::Json<TaskBody>,
) -> Response {
    let account = match bearer_account(&headers) {
        Ok(account) => account,
        Err(response) => return response,
    };

    let request = TaskRequest {
        account,
        task,
        persona: body.0.persona,
        prompt: body.0.prompt,
        context: body.0.context,
        correlation_flagged: body.0.correlation_flagged,
    };

    match state.gateway.handle(&request).await {
        Ok(reply) => (StatusCode::OK, axum::Json(reply)).into_response(),
        Err(error) => error_response(error),
    }
}

fn error_response(error: GatewayError) -> Response {
    let status = match &error {
        GatewayError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        GatewayError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        GatewayError::AbuseDetected { .. } => StatusCode::FORBIDDEN,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = serde_json::json!({
        "error": error.outcome(),
        "message": error.to_string(),
    });

    let mut response = (status, axum::Json(body)).into_response();
    if let Some(retry_after) = error.retry_after_secs() {
        if let Ok(value) = retry_after.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<HttpState>) -> Response {
    (StatusCode::OK, axum::Json(state.gateway.metrics())).into_response()
}

fn require_admin(state: &HttpState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = match &state.admin_token {
        Some(token) => token,
        None => {
            return Err((
                StatusCode::NOT_FOUND,
                axum::Json(serde_json::json!({ "error": "admin api disabled" })),
            )
                .into_response());
        }
    };
    let presented = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented != expected {
        return Err((
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid admin token" })),
        )
            .into_response());
    }
    Ok(())
}

async fn admin_reset_abuse(
    State(state): State<HttpState>,
    Path(account): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    match state.gateway.reset_abuse(&account).await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "account": account, "reset": true })),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct SetTierBody {
    tier: String,
}

async fn admin_set_tier(
    State(state): State<HttpState>,
    Path(account): Path<String>,
    headers: HeaderMap,
    body: axum::Json<SetTierBody>,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    let Some(tier) = Tier::parse(&body.tier) else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": "unknown tier" })),
        )
            .into_response();
    };
    match state.gateway.set_account_tier(&account, tier).await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "account": account, "tier": tier.as_str() })),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default = "default_usage_limit")]
    limit: usize,
    #[serde(default)]
    since_ts_ms: Option<u64>,
}

fn default_usage_limit() -> usize {
    100
}

async fn admin_usage(
    State(state): State<HttpState>,
    Query(query): Query<UsageQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    match state.gateway.usage(query.limit, query.since_ts_ms).await {
        Ok(records) => (StatusCode::OK, axum::Json(records)).into_response(),
        Err(error) => error_response(error),
    }
}
