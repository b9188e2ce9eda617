//! HTTP gateway.
//!
//! JSON API over the generation pipeline plus a plain-text endpoint that
//! serves stored subscriptions to Clash clients.
//!
//! Domain failures (bad links, nothing online) come back as `200` with
//! `success: false` so the web form can show the message; malformed input
//! is `400`, storage trouble `500`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};

use crate::clash::{NodeStatus, ProbeSummary, SubscriptionError};
use crate::config::AppConfig;
use crate::generate::{self, GenerateError, GenerateRequest};
use crate::store::{Owner, StoreError, SubscriptionStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: SubscriptionStore,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let store = SubscriptionStore::new(&config.storage.subscriptions_dir);
        Self {
            config: Arc::new(config),
            store,
        }
    }

    /// Public URL of a stored subscription.
    ///
    /// Uses `gateway.public_url` when configured, then the request `Host`
    /// header, then the listen address.
    fn subscription_url(&self, headers: &HeaderMap, filename: &str) -> String {
        let base = match &self.config.gateway.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| self.config.listen_addr());
                format!("http://{host}")
            }
        };
        format!("{base}/subscriptions/{}", urlencoding::encode(filename))
    }
}

pub fn router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.gateway.request_timeout_secs);
    let max_body = state.config.gateway.max_body_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/api/version", get(version))
        .route("/api/generate", post(handle_generate))
        .route("/api/save", post(handle_save))
        .route("/api/reset", post(handle_reset))
        .route("/subscriptions/{filename}", get(handle_subscription))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TimeoutLayer::new(timeout))
}

/// Bind and serve until Ctrl-C.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr();
    let state = AppState::new(config);
    tracing::info!(
        "storing subscriptions in {}",
        state.store.dir().display()
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("clashlink gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

// ── responses ───────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub node_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_statuses: Option<Vec<NodeStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ProbeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_lines: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<usize>,
}

impl ActionResponse {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Self::default()
        }
    }
}

fn store_error_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::InvalidName(_)
        | StoreError::InvalidOwner(_)
        | StoreError::EmptyContent
        | StoreError::MissingProxies => StatusCode::BAD_REQUEST,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::NameTaken(_) => StatusCode::CONFLICT,
        StoreError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn owner_from(raw: Option<&str>) -> Result<Owner, StoreError> {
    match raw.map(str::trim).filter(|o| !o.is_empty()) {
        Some(name) => Owner::new(name),
        None => Ok(Owner::anonymous()),
    }
}

// ── handlers ────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    #[serde(default)]
    owner: Option<String>,
    #[serde(flatten)]
    request: GenerateRequest,
}

async fn handle_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GenerateBody>,
) -> (StatusCode, Json<GenerateResponse>) {
    let owner = match owner_from(body.owner.as_deref()) {
        Ok(owner) => owner,
        Err(e) => {
            let response = GenerateResponse {
                message: e.to_string(),
                ..GenerateResponse::default()
            };
            return (StatusCode::BAD_REQUEST, Json(response));
        }
    };

    let result = generate::generate(
        &body.request,
        &state.config.generation,
        &owner,
        &state.store,
    )
    .await;

    match result {
        Ok(outcome) => {
            let subscription_url = outcome
                .filename
                .as_deref()
                .map(|f| state.subscription_url(&headers, f));
            let response = GenerateResponse {
                success: true,
                message: format!("generated config with {} node(s)", outcome.node_count),
                subscription_url,
                filename: outcome.filename,
                node_count: outcome.node_count,
                node_statuses: outcome.statuses,
                summary: outcome.summary,
                config_content: Some(outcome.content),
                skipped_lines: outcome.parse_errors.iter().map(ToString::to_string).collect(),
            };
            (StatusCode::OK, Json(response))
        }
        Err(GenerateError::NoOnlineNodes { statuses, summary }) => {
            let response = GenerateResponse {
                message: "no online nodes; try again without filtering".to_string(),
                node_statuses: Some(statuses),
                summary: Some(summary),
                ..GenerateResponse::default()
            };
            (StatusCode::OK, Json(response))
        }
        Err(GenerateError::Store(e)) => {
            tracing::error!("generate: {e}");
            let response = GenerateResponse {
                message: format!("failed to save subscription: {e}"),
                ..GenerateResponse::default()
            };
            (store_error_status(&e), Json(response))
        }
        Err(e @ (GenerateError::EmptyInput | GenerateError::Parse(_))) => {
            let skipped_lines = match &e {
                GenerateError::Parse(SubscriptionError::NoValidLinks { errors }) => {
                    errors.iter().map(ToString::to_string).collect()
                }
                _ => Vec::new(),
            };
            let response = GenerateResponse {
                message: e.to_string(),
                skipped_lines,
                ..GenerateResponse::default()
            };
            (StatusCode::OK, Json(response))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SaveBody {
    #[serde(alias = "configContent", alias = "content")]
    config_content: String,
    filename: Option<String>,
    owner: Option<String>,
}

async fn handle_save(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SaveBody>,
) -> (StatusCode, Json<ActionResponse>) {
    let saved = match owner_from(body.owner.as_deref()) {
        Ok(owner) => {
            state
                .store
                .save_custom(body.filename.as_deref(), &body.config_content, &owner)
                .await
        }
        Err(e) => Err(e),
    };

    match saved {
        Ok(filename) => {
            let response = ActionResponse {
                success: true,
                message: "config saved".to_string(),
                subscription_url: Some(state.subscription_url(&headers, &filename)),
                filename: Some(filename),
                deleted: None,
            };
            (StatusCode::OK, Json(response))
        }
        Err(e) => {
            let status = store_error_status(&e);
            if status.is_server_error() {
                tracing::error!("save: {e}");
            }
            (status, Json(ActionResponse::failure(e.to_string())))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResetBody {
    owner: Option<String>,
}

async fn handle_reset(
    State(state): State<AppState>,
    Json(body): Json<ResetBody>,
) -> (StatusCode, Json<ActionResponse>) {
    let deleted = match owner_from(body.owner.as_deref()) {
        Ok(owner) => state.store.reset(&owner).await,
        Err(e) => Err(e),
    };

    match deleted {
        Ok(count) => {
            let response = ActionResponse {
                success: true,
                message: format!("deleted {count} subscription(s)"),
                deleted: Some(count),
                ..ActionResponse::default()
            };
            (StatusCode::OK, Json(response))
        }
        Err(e) => {
            let status = store_error_status(&e);
            if status.is_server_error() {
                tracing::error!("reset: {e}");
            }
            (status, Json(ActionResponse::failure(e.to_string())))
        }
    }
}

async fn handle_subscription(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    match state.store.load(&filename).await {
        Ok(content) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/yaml; charset=utf-8")],
            content,
        )
            .into_response(),
        Err(e) => {
            let status = store_error_status(&e);
            if status.is_server_error() {
                tracing::error!("serving subscription {filename}: {e}");
            }
            (status, e.to_string()).into_response()
        }
    }
}
