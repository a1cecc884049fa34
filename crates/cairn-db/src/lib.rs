//! In-memory transactional store for Cairn.
//!
//! A [`Db`] holds typed tables, each backed by immutable radix trees: a
//! primary index, any number of secondary indexes, a revision index and a
//! graveyard of deleted objects. Readers take lock-free snapshots; writers
//! lock the tables they touch, stage changes on private copies and publish
//! them with a single atomic swap of the root.
//!
//! # Key Types
//!
//! - [`Db`] -- the database: registration, transactions, graveyard worker
//! - [`Table`] -- a typed table and its queries and mutations
//! - [`Index`] / [`Query`] -- key derivation and lookups
//! - [`ReadTxn`] / [`WriteTxn`] -- snapshot reads and locked writes
//! - [`DeleteTracker`] / [`ChangeIterator`] -- observing deletions and changes
//! - [`Metrics`] -- pluggable sink over the `metrics` facade, [`LocalMetrics`] by default
//!
//! # Design Rules
//!
//! 1. Everything reachable from a published root is immutable.
//! 2. The root is replaced only by registration and commit, under one mutex.
//! 3. Write transactions lock tables in registration order.
//! 4. All indexes of a table change together, in one revision per object.
//! 5. A tombstone is kept while any open tracker's watermark is at or below
//!    its revision.
//! 6. Lookup misses are `Ok(None)`, never errors.

pub mod config;
pub mod db;
pub mod entry;
pub mod error;
pub mod graveyard;
pub mod index;
pub mod key;
pub mod metrics;
pub mod object;
pub mod root;
pub mod table;
pub mod tracker;
pub mod txn;

// Re-export primary types at crate root for ergonomic imports.
pub use cairn_radix::Watch;
pub use config::DbConfig;
pub use db::Db;
pub use entry::{IndexInfo, TableEntry, TableInfo};
pub use error::{DbError, DbResult};
pub use graveyard::GcReport;
pub use index::{Index, Query};
pub use key::{Key, KeySet};
pub use crate::metrics::{
    HandleStats, LocalMetrics, Metrics, MetricsSnapshot, NoopMetrics, RecorderMetrics, TableStats,
};
pub use object::{Revision, TableObject};
pub use root::Root;
pub use table::{AnyTable, IndexMeta, Objects, Table, TableMeta};
pub use tracker::{Change, ChangeIterator, DeleteTracker, Tombstone};
pub use txn::{ReadTxn, Txn, WriteTxn};
