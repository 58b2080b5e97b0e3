use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use vdm_core::{Gateway, GatewayResponse};

use crate::auth;

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<Gateway>,
}

pub fn proxy_router(gateway: Arc<Gateway>) -> Router {
    let state = GatewayState { gateway };

    Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_proxy_key,
        ))
        .with_state(state)
}

async fn messages(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_key = auth::client_api_key(&headers);
    into_http(state.gateway.handle_messages(body, client_key).await)
}

async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_key = auth::client_api_key(&headers);
    into_http(state.gateway.handle_chat_completions(body, client_key).await)
}

async fn count_tokens(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_key = auth::client_api_key(&headers);
    into_http(state.gateway.count_tokens(body, client_key).await)
}

fn into_http(response: GatewayResponse) -> Response {
    match response {
        GatewayResponse::Json { status, body } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            [(header::CONTENT_TYPE, "application/json")],
            Body::from(body),
        )
            .into_response(),
        GatewayResponse::Stream { rx } => {
            let stream = ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                    (header::CONNECTION, "keep-alive"),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}
