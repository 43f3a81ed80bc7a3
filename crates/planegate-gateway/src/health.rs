//! Liveness and readiness checks, served on their own plain-HTTP listener

use axum::routing::get;
use axum::Router;

async fn ok() -> &'static str {
    "ok"
}

/// `/health` and `/ready`
pub fn health_router() -> Router {
    Router::new()
        .route("/health", get(ok))
        .route("/ready", get(ok))
}
