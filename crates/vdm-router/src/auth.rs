use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use vdm_protocol::claude::error::ErrorEnvelope;

use crate::proxy::GatewayState;

/// The client's API key, from `x-api-key` or `Authorization: Bearer`.
pub fn client_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key")
        && let Ok(value) = value.to_str()
        && !value.is_empty()
    {
        return Some(value.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// When `PROXY_API_KEY` is configured, every proxy route requires it.
pub async fn require_proxy_key(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.gateway.settings().proxy_api_key.clone() else {
        return next.run(request).await;
    };

    match client_api_key(request.headers()) {
        Some(provided) if provided == expected => next.run(request).await,
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    let envelope = ErrorEnvelope::new(
        "authentication_error",
        "Invalid API key. Provide it via the x-api-key header or as a bearer token.",
    );
    let body = serde_json::to_vec(&envelope).unwrap_or_default();
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(body),
    )
        .into_response()
}
