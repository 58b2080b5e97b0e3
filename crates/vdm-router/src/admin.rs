use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};

use vdm_core::Gateway;

use crate::proxy::GatewayState;

/// Read-only operational endpoints; intentionally outside the proxy auth
/// layer so probes work without the proxy key.
pub fn admin_router(gateway: Arc<Gateway>) -> Router {
    let state = GatewayState { gateway };
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<GatewayState>) -> Json<JsonValue> {
    let gateway = &state.gateway;
    let providers: Vec<JsonValue> = gateway
        .registry()
        .list()
        .into_iter()
        .map(|provider| {
            json!({
                "name": provider.name,
                "api_format": provider.api_format.as_str(),
                "auth_mode": provider.auth_mode.as_str(),
                "base_url": provider.base_url,
                "api_key_hash": key_hash(provider.api_keys.first()),
            })
        })
        .collect();

    Json(json!({
        "status": "healthy",
        "default_provider": gateway.settings().default_provider,
        "client_api_key_validation": gateway.settings().proxy_api_key.is_some(),
        "providers": providers,
    }))
}

async fn metrics(State(state): State<GatewayState>) -> Json<JsonValue> {
    Json(state.gateway.metrics_snapshot())
}

/// First 8 hex chars of the key's SHA-256; never the key itself.
fn key_hash(key: Option<&String>) -> JsonValue {
    match key {
        Some(key) => {
            let digest = Sha256::digest(key.as_bytes());
            let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
            json!(format!("sha256:{hex}"))
        }
        None => json!("<not set>"),
    }
}
