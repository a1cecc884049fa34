use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::DbConfig;
use crate::entry::TableEntry;
use crate::error::{DbError, DbResult};
use crate::graveyard::{self, GcReport};
use crate::metrics::{LocalMetrics, Metrics};
use crate::root::Root;
use crate::table::{is_valid_name, AnyTable, TableMeta};
use crate::txn::{ReadTxn, WriteTxn};

const DEFAULT_HANDLE: &str = "db";

/// An in-memory transactional database of typed tables.
///
/// Cloning is cheap and clones share all state. Readers take lock-free
/// snapshots with [`Db::read_txn`]; writers lock the tables they touch with
/// [`Db::write_txn`] and publish atomically on commit.
#[derive(Clone)]
pub struct Db {
    handle: Arc<str>,
    state: Arc<DbState>,
}

struct DbState {
    root: ArcSwap<Root>,
    /// Serializes every replacement of `root`.
    root_lock: Mutex<()>,
    config: DbConfig,
    metrics: Arc<dyn Metrics>,
    gc_trigger: Notify,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Db {
    /// Create a database recording metrics in a [`LocalMetrics`].
    pub fn new(config: DbConfig) -> DbResult<Self> {
        Self::with_metrics(config, Arc::new(LocalMetrics::new()))
    }

    /// Create a database with a custom metrics sink.
    pub fn with_metrics(config: DbConfig, metrics: Arc<dyn Metrics>) -> DbResult<Self> {
        config.validate()?;
        Ok(Self {
            handle: Arc::from(DEFAULT_HANDLE),
            state: Arc::new(DbState {
                root: ArcSwap::from_pointee(Root::default()),
                root_lock: Mutex::new(()),
                config,
                metrics,
                gc_trigger: Notify::new(),
                worker: Mutex::new(None),
            }),
        })
    }

    /// A handle on the same database whose transactions are reported to the
    /// metrics sink under `name`.
    pub fn handle(&self, name: &str) -> Db {
        Db {
            handle: Arc::from(name),
            state: Arc::clone(&self.state),
        }
    }

    /// Name of this handle.
    pub fn name(&self) -> &str {
        &self.handle
    }

    pub fn config(&self) -> &DbConfig {
        &self.state.config
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.state.metrics
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register one table. See [`Db::register_tables`].
    pub fn register_table(&self, table: &dyn AnyTable) -> DbResult<()> {
        self.register_tables(&[table])
    }

    /// Register tables, assigning each the next position in the root.
    ///
    /// Either every table is registered or, on error, none is.
    pub fn register_tables(&self, tables: &[&dyn AnyTable]) -> DbResult<()> {
        let _guard = self.state.root_lock.lock();
        let current = self.state.root.load_full();

        let mut names: HashSet<&str> = current.tables.iter().map(TableEntry::name).collect();
        for table in tables {
            let meta = table.meta();
            let name = meta.name();
            if !is_valid_name(name) {
                return Err(DbError::InvalidTableName(name.to_string()));
            }
            if meta.position().is_some() || !names.insert(name) {
                return Err(DbError::DuplicateTable(name.to_string()));
            }
            let mut index_names = HashSet::new();
            for index in meta.indexes() {
                if !is_valid_name(&index.name) {
                    return Err(DbError::InvalidIndexName {
                        table: name.to_string(),
                        index: index.name.to_string(),
                    });
                }
                if !index_names.insert(&*index.name) {
                    return Err(DbError::DuplicateIndex {
                        table: name.to_string(),
                        index: index.name.to_string(),
                    });
                }
            }
            if let Some(primary) = meta.indexes().first().filter(|i| !i.unique) {
                return Err(DbError::PrimaryNotUnique {
                    table: name.to_string(),
                    index: primary.name.to_string(),
                });
            }
        }

        let mut next = Root::clone(&current);
        for table in tables {
            let meta = table.meta();
            let pos = next.tables.len();
            if !meta.assign_position(pos) {
                // Lost a race against a registration in another database.
                for (assigned, entry) in next.tables.iter().enumerate().skip(current.len()) {
                    entry.meta.clear_position(assigned);
                }
                return Err(DbError::DuplicateTable(meta.name().to_string()));
            }
            next.tables.push(TableEntry::new(Arc::clone(meta)));
        }
        for (pos, entry) in next.tables.iter().enumerate().skip(current.len()) {
            info!(handle = self.name(), table = entry.name(), pos, "registered table");
        }
        self.state.root.store(Arc::new(next));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// A snapshot of the current root. Never blocks.
    pub fn read_txn(&self) -> ReadTxn {
        ReadTxn::new(self.load_root())
    }

    /// Lock `tables` and start a write transaction on them.
    ///
    /// Blocks until every lock is held. Locks are taken in registration
    /// order, so transactions over overlapping tables cannot deadlock.
    pub fn write_txn(&self, tables: &[&dyn AnyTable]) -> DbResult<WriteTxn> {
        let root = self.state.root.load();
        let metas = tables
            .iter()
            .map(|table| -> DbResult<(usize, Arc<TableMeta>)> {
                let meta = table.meta();
                Ok((root.position(meta)?, Arc::clone(meta)))
            })
            .collect::<DbResult<Vec<_>>>()?;
        drop(root);
        Ok(WriteTxn::begin(self.clone(), metas))
    }

    pub(crate) fn load_root(&self) -> Arc<Root> {
        self.state.root.load_full()
    }

    /// Swap in a root with `staged` replacing the entries at their
    /// positions. Tables registered since the transaction began are kept.
    pub(crate) fn publish(&self, staged: BTreeMap<usize, TableEntry>) -> Arc<Root> {
        let _guard = self.state.root_lock.lock();
        let mut next = Root::clone(&self.state.root.load());
        for (pos, entry) in staged {
            next.tables[pos] = entry;
        }
        let next = Arc::new(next);
        self.state.root.store(Arc::clone(&next));
        next
    }

    // -----------------------------------------------------------------------
    // Graveyard
    // -----------------------------------------------------------------------

    /// Start the graveyard worker on the current tokio runtime.
    pub fn start(&self) -> DbResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DbError::NoRuntime)?;
        let mut worker = self.state.worker.lock();
        if worker.is_some() {
            return Err(DbError::AlreadyStarted);
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(graveyard::run(self.clone(), shutdown_rx));
        *worker = Some(Worker { shutdown, task });
        info!(
            handle = self.name(),
            interval_ms = self.state.config.gc_interval_ms,
            "started graveyard worker"
        );
        Ok(())
    }

    /// Stop the graveyard worker and wait for it to exit.
    pub async fn stop(&self) -> DbResult<()> {
        let worker = self.state.worker.lock().take().ok_or(DbError::NotStarted)?;
        let _ = worker.shutdown.send(true);
        worker
            .task
            .await
            .map_err(|e| DbError::Worker(e.to_string()))?;
        info!(handle = self.name(), "stopped graveyard worker");
        Ok(())
    }

    /// Run one collection pass now, on the calling thread.
    pub fn collect_graveyard(&self) -> DbResult<GcReport> {
        graveyard::collect(self)
    }

    /// Wake the graveyard worker. Wakeups coalesce.
    pub(crate) fn trigger_gc(&self) {
        self.state.gc_trigger.notify_one();
    }

    pub(crate) async fn gc_triggered(&self) {
        self.state.gc_trigger.notified().await;
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("handle", &self.handle)
            .field("tables", &self.state.root.load().len())
            .finish()
    }
}
