use axum::extract::{Path, State};
use axum::response::Json;
use cairn_db::{Db, MetricsSnapshot, TableInfo, Txn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ServerError, ServerResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Objects of one table together with its summary.
#[derive(Clone, Debug, Serialize)]
pub struct TableResponse {
    pub info: TableInfo,
    pub objects: Vec<serde_json::Value>,
}

/// Health check handler.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Info handler.
pub async fn info_handler(State(db): State<Db>) -> Json<serde_json::Value> {
    let txn = db.read_txn();
    Json(json!({
        "name": "cairn-server",
        "version": env!("CARGO_PKG_VERSION"),
        "handle": db.name(),
        "tables": txn.table_entries().len(),
        "gc_interval_ms": db.config().gc_interval_ms,
        "gc_batch_limit": db.config().gc_batch_limit,
    }))
}

/// Every table and its objects from one snapshot.
pub async fn dump_handler(State(db): State<Db>) -> ServerResult<Json<serde_json::Value>> {
    Ok(Json(db.read_txn().to_json()?))
}

pub async fn tables_handler(State(db): State<Db>) -> Json<Vec<TableInfo>> {
    Json(db.read_txn().tables())
}

pub async fn table_handler(
    State(db): State<Db>,
    Path(name): Path<String>,
) -> ServerResult<Json<TableResponse>> {
    let txn = db.read_txn();
    let entry = txn
        .table_by_name(&name)
        .ok_or(ServerError::TableNotFound(name))?;
    Ok(Json(TableResponse {
        info: entry.info(),
        objects: entry.objects_json()?,
    }))
}

pub async fn metrics_handler(State(db): State<Db>) -> ServerResult<Json<MetricsSnapshot>> {
    db.metrics()
        .snapshot()
        .map(Json)
        .ok_or(ServerError::MetricsUnavailable)
}
