use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use cairn_radix::Watch;
use parking_lot::{ArcMutexGuard, RawMutex};
use tracing::{debug, warn};

use crate::db::Db;
use crate::entry::{TableEntry, TableInfo};
use crate::error::{DbError, DbResult};
use crate::root::Root;
use crate::table::TableMeta;
use crate::tracker::TrackerState;

/// Read access to a database snapshot.
///
/// Implemented by [`ReadTxn`] and by [`WriteTxn`], which reads its own
/// staged changes.
pub trait Txn {
    /// The entry of a registered table.
    fn table_entry(&self, meta: &TableMeta) -> DbResult<&TableEntry>;

    /// Every table entry, in registration order.
    fn table_entries(&self) -> Vec<&TableEntry>;

    /// Summaries of every table.
    fn tables(&self) -> Vec<TableInfo> {
        self.table_entries().into_iter().map(TableEntry::info).collect()
    }

    /// Look up a table entry by name.
    fn table_by_name(&self, name: &str) -> Option<&TableEntry> {
        self.table_entries().into_iter().find(|e| e.name() == name)
    }

    /// Every table and its objects as a JSON object keyed by table name.
    fn to_json(&self) -> DbResult<serde_json::Value> {
        let mut tables = serde_json::Map::new();
        for entry in self.table_entries() {
            tables.insert(
                entry.name().to_string(),
                serde_json::Value::Array(entry.objects_json()?),
            );
        }
        Ok(serde_json::Value::Object(tables))
    }

    /// Write [`Txn::to_json`] to `writer`, pretty-printed.
    fn write_json(&self, writer: impl Write) -> DbResult<()>
    where
        Self: Sized,
    {
        serde_json::to_writer_pretty(writer, &self.to_json()?)?;
        Ok(())
    }
}

/// A consistent, immutable snapshot of the database.
///
/// Creating one is a single atomic load. Later commits are never visible
/// through it.
#[derive(Clone)]
pub struct ReadTxn {
    root: Arc<Root>,
}

impl ReadTxn {
    pub(crate) fn new(root: Arc<Root>) -> Self {
        Self { root }
    }

    /// The captured root.
    pub fn root(&self) -> &Root {
        &self.root
    }
}

impl Txn for ReadTxn {
    fn table_entry(&self, meta: &TableMeta) -> DbResult<&TableEntry> {
        self.root.entry(meta)
    }

    fn table_entries(&self) -> Vec<&TableEntry> {
        self.root.tables.iter().collect()
    }
}

impl fmt::Debug for ReadTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTxn")
            .field("tables", &self.root.len())
            .finish()
    }
}

/// Mutable access to one staged table of a [`WriteTxn`].
pub(crate) struct StagedTable<'a> {
    pub entry: &'a mut TableEntry,
    pub watches: &'a mut Vec<Watch>,
    pub graveyard_dirty: &'a mut bool,
    /// Trackers registered by this transaction.
    pub trackers: &'a mut Vec<Arc<TrackerState>>,
}

/// A write transaction over a fixed set of tables.
///
/// Holds the locks of its tables from creation until [`WriteTxn::commit`] or
/// [`WriteTxn::abort`]. Changes are staged on private copies of the table
/// entries and published together by `commit`. A transaction dropped without
/// either is aborted with a warning. Delete trackers registered by an
/// aborted transaction are closed with it.
pub struct WriteTxn {
    db: Db,
    root: Arc<Root>,
    /// Private entries of the locked tables, by position.
    staged: BTreeMap<usize, TableEntry>,
    names: Vec<Arc<str>>,
    /// Watches of superseded nodes, closed after publishing.
    watches: Vec<Watch>,
    graveyard_dirty: bool,
    trackers: Vec<Arc<TrackerState>>,
    locks: Vec<ArcMutexGuard<RawMutex, ()>>,
    acquired_at: Instant,
    finished: bool,
}

impl WriteTxn {
    /// Lock `metas` in position order and stage their entries.
    pub(crate) fn begin(db: Db, mut metas: Vec<(usize, Arc<TableMeta>)>) -> Self {
        metas.sort_by_key(|(pos, _)| *pos);
        metas.dedup_by_key(|(pos, _)| *pos);

        let names: Vec<Arc<str>> = metas
            .iter()
            .map(|(_, meta)| Arc::from(meta.name()))
            .collect();
        let start = Instant::now();
        let mut locks = Vec::with_capacity(metas.len());
        for (_, meta) in &metas {
            let wait = Instant::now();
            locks.push(meta.lock.lock_arc());
            db.metrics()
                .write_txn_table_acquisition(db.name(), meta.name(), wait.elapsed());
        }
        db.metrics()
            .write_txn_total_acquisition(db.name(), &name_refs(&names), start.elapsed());

        // Snapshot only once every lock is held, so no staged entry can be
        // stale.
        let root = db.load_root();
        let staged = metas
            .iter()
            .map(|(pos, _)| (*pos, root.tables[*pos].clone()))
            .collect();

        Self {
            db,
            root,
            staged,
            names,
            watches: Vec::new(),
            graveyard_dirty: false,
            trackers: Vec::new(),
            locks,
            acquired_at: Instant::now(),
            finished: false,
        }
    }

    /// The database this transaction writes to.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Names of the locked tables, in lock order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| &**n)
    }

    pub(crate) fn staged(&mut self, meta: &TableMeta) -> DbResult<StagedTable<'_>> {
        let pos = self.root.position(meta)?;
        let entry = self
            .staged
            .get_mut(&pos)
            .ok_or_else(|| DbError::TableNotLocked(meta.name().to_string()))?;
        Ok(StagedTable {
            entry,
            watches: &mut self.watches,
            graveyard_dirty: &mut self.graveyard_dirty,
            trackers: &mut self.trackers,
        })
    }

    /// Publish every staged change atomically and release the locks.
    ///
    /// Returns a snapshot of the new root.
    pub fn commit(mut self) -> ReadTxn {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        let metrics = self.db.metrics();
        for entry in staged.values() {
            metrics.object_count(entry.name(), entry.num_objects());
            metrics.revision(entry.name(), entry.revision);
        }

        let root = self.db.publish(staged);
        for watch in self.watches.drain(..) {
            watch.close();
        }
        if self.graveyard_dirty {
            self.db.trigger_gc();
        }
        self.trackers.clear();

        let held = self.acquired_at.elapsed();
        metrics.write_txn_duration(self.db.name(), &name_refs(&self.names), held);
        debug!(
            handle = self.db.name(),
            tables = ?self.names,
            held_us = held.as_micros() as u64,
            "committed write transaction"
        );
        self.locks.clear();
        ReadTxn::new(root)
    }

    /// Discard every staged change and release the locks.
    pub fn abort(mut self) {
        self.finished = true;
        self.release("aborted write transaction");
    }

    fn release(&mut self, message: &'static str) {
        let held = self.acquired_at.elapsed();
        self.db
            .metrics()
            .write_txn_duration(self.db.name(), &name_refs(&self.names), held);
        debug!(handle = self.db.name(), tables = ?self.names, "{message}");
        self.staged.clear();
        self.watches.clear();
        for tracker in self.trackers.drain(..) {
            tracker.close();
        }
        self.locks.clear();
    }
}

impl Txn for WriteTxn {
    fn table_entry(&self, meta: &TableMeta) -> DbResult<&TableEntry> {
        let pos = self.root.position(meta)?;
        Ok(self.staged.get(&pos).unwrap_or(&self.root.tables[pos]))
    }

    fn table_entries(&self) -> Vec<&TableEntry> {
        self.root
            .tables
            .iter()
            .enumerate()
            .map(|(pos, entry)| self.staged.get(&pos).unwrap_or(entry))
            .collect()
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                handle = self.db.name(),
                tables = ?self.names,
                "write transaction dropped without commit or abort, aborting"
            );
            self.release("aborted dropped write transaction");
        }
    }
}

impl fmt::Debug for WriteTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTxn")
            .field("handle", &self.db.name())
            .field("tables", &self.names)
            .finish()
    }
}

fn name_refs(names: &[Arc<str>]) -> Vec<&str> {
    names.iter().map(|n| &**n).collect()
}
