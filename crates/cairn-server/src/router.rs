use axum::{routing::get, Router};
use cairn_db::Db;
use tower_http::trace::TraceLayer;

use crate::handler;

/// Build the axum router with all introspection endpoints over `db`.
pub fn build_router(db: Db) -> Router {
    Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route("/v1/info", get(handler::info_handler))
        .route("/v1/dump", get(handler::dump_handler))
        .route("/v1/tables", get(handler::tables_handler))
        .route("/v1/tables/:name", get(handler::table_handler))
        .route("/v1/metrics", get(handler::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(db)
}
