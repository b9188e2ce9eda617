//! Shared helpers for gateway tests.

use axum::{body::Body, http::Response, Router};
use http_body_util::BodyExt;
use serde_json::Value;

use clashlink::gateway::{self, AppState};
use clashlink::AppConfig;

/// Router backed by a subscriptions directory under `dir`.
pub fn test_app(dir: &std::path::Path) -> Router {
    test_app_with(dir, |_| {})
}

pub fn test_app_with(dir: &std::path::Path, tweak: impl FnOnce(&mut AppConfig)) -> Router {
    let mut config = AppConfig::default();
    config.storage.subscriptions_dir = dir.join("subscriptions");
    tweak(&mut config);
    gateway::router(AppState::new(config))
}

pub async fn response_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn response_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&response_bytes(response).await).unwrap()
}
