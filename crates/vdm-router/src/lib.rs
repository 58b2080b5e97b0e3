use std::sync::Arc;

use axum::Router;

use vdm_core::Gateway;

pub mod admin;
pub mod auth;
pub mod proxy;

/// Full HTTP surface: proxy routes behind ingress auth, plus the read-only
/// admin endpoints.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .merge(proxy::proxy_router(gateway.clone()))
        .merge(admin::admin_router(gateway))
}
