//! HTTP introspection server for Cairn databases.
//!
//! Serves read-only JSON views of a [`cairn_db::Db`]: a full snapshot dump,
//! table metadata, the objects of one table, and the metrics snapshot. Every
//! request reads from its own snapshot, so a response is always consistent
//! across tables.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HealthResponse, TableResponse};
pub use router::build_router;
pub use server::CairnServer;
