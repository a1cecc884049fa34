use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cairn_radix::Watch;
use tracing::debug;

use crate::db::Db;
use crate::entry::update;
use crate::error::{DbError, DbResult};
use crate::key::{revision_key, Key};
use crate::object::{Revision, TableObject};
use crate::table::{AnyTable, Table};
use crate::txn::{ReadTxn, Txn, WriteTxn};

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// Shared between a tracker handle and the table entry it is attached to.
pub(crate) struct TrackerState {
    pub id: u64,
    pub name: String,
    /// Lowest revision not yet processed.
    pub watermark: AtomicU64,
    closed: AtomicBool,
}

impl TrackerState {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A deleted object retained in the graveyard.
#[derive(Clone, Debug)]
pub struct Tombstone<T> {
    /// Primary key of the deleted object.
    pub key: Key,
    /// Revision of the deletion.
    pub revision: Revision,
    /// The object as it was when deleted.
    pub object: Arc<T>,
}

/// A cursor over a table's graveyard.
///
/// While the tracker is open, the collector keeps every tombstone at or above
/// its watermark. Advance it with [`DeleteTracker::mark`] once tombstones are
/// handled; dropping the tracker detaches it. A tracker registered by a write
/// transaction that is aborted or dropped is closed and can no longer be
/// processed.
pub struct DeleteTracker<T> {
    table: Table<T>,
    db: Db,
    state: Arc<TrackerState>,
}

impl<T: TableObject> DeleteTracker<T> {
    pub(crate) fn register(
        table: Table<T>,
        txn: &mut WriteTxn,
        name: &str,
        watermark: Revision,
    ) -> DbResult<Self> {
        let db = txn.db().clone();
        let state = Arc::new(TrackerState {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            watermark: AtomicU64::new(watermark),
            closed: AtomicBool::new(false),
        });
        let staged = txn.staged(table.meta())?;
        update(&mut staged.entry.delete_trackers, staged.watches, |t| {
            t.insert(&state.id.to_be_bytes(), Arc::clone(&state))
        });
        staged.trackers.push(Arc::clone(&state));
        debug!(
            table = table.name(),
            tracker = name,
            watermark,
            "registered delete tracker"
        );
        Ok(Self { table, db, state })
    }

    /// Name given at registration.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Lowest revision not yet processed.
    pub fn watermark(&self) -> Revision {
        self.state.watermark.load(Ordering::Acquire)
    }

    /// Read up to `limit` tombstones at or above the watermark, in deletion
    /// order, and the watermark to [`mark`](Self::mark) once they are
    /// handled.
    ///
    /// The watermark is not advanced here, so an unhandled batch can be read
    /// again. Only committed snapshots are accepted: a write transaction's
    /// staged revisions may never be published.
    pub fn process(&self, txn: &ReadTxn, limit: usize) -> DbResult<(Vec<Tombstone<T>>, Revision)> {
        if self.state.is_closed() {
            return Err(DbError::TrackerClosed {
                table: self.table.name().to_string(),
                tracker: self.state.name.clone(),
            });
        }
        let entry = txn.table_entry(self.table.meta())?;
        let from = self.watermark();
        let mut iter = entry.graveyard.lower_bound(&revision_key(from));
        let tombstones: Vec<Tombstone<T>> = iter
            .by_ref()
            .take(limit)
            .map(|(_, obj)| Tombstone {
                key: Key::from(&obj.primary_key[..]),
                revision: obj.revision,
                object: obj.downcast(),
            })
            .collect();

        let next = if iter.next().is_none() {
            // Every deletion up to this snapshot's revision has been seen.
            from.max(entry.revision + 1)
        } else {
            tombstones.last().map_or(from, |t| t.revision + 1)
        };
        Ok((tombstones, next))
    }

    /// Advance the watermark. Moving it backwards is ignored.
    pub fn mark(&self, watermark: Revision) {
        let prev = self.state.watermark.fetch_max(watermark, Ordering::AcqRel);
        if watermark > prev {
            self.db.trigger_gc();
        }
    }

    /// Detach the tracker. Same as dropping it.
    pub fn close(self) {}
}

impl<T> Drop for DeleteTracker<T> {
    fn drop(&mut self) {
        self.state.close();
        self.db.trigger_gc();
    }
}

impl<T> fmt::Debug for DeleteTracker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteTracker")
            .field("name", &self.state.name)
            .field("watermark", &self.state.watermark.load(Ordering::Relaxed))
            .finish()
    }
}

/// One change observed by a [`ChangeIterator`].
#[derive(Clone, Debug)]
pub struct Change<T> {
    pub object: Arc<T>,
    pub revision: Revision,
    pub deleted: bool,
}

/// Iterates a table's changes in revision order.
///
/// Upserts come from the revision index, which always holds every live
/// object at its latest revision. Deletions come from the graveyard through
/// a delete tracker owned by the iterator, which keeps them from being
/// collected until they have been returned.
pub struct ChangeIterator<T> {
    table: Table<T>,
    upserts_from: Revision,
    deletes: DeleteTracker<T>,
}

impl<T: TableObject> ChangeIterator<T> {
    pub(crate) fn new(table: Table<T>, deletes: DeleteTracker<T>) -> Self {
        Self {
            table,
            upserts_from: 0,
            deletes,
        }
    }

    /// Changes since the previous call, and a watch that closes on the next
    /// change to the table.
    ///
    /// The first call returns every object in the table. An object updated
    /// several times between calls is returned once, at its latest revision.
    /// Fails with [`DbError::TrackerClosed`] if the iterator was created by a
    /// write transaction that did not commit.
    pub fn next(&mut self, txn: &ReadTxn) -> DbResult<(Vec<Change<T>>, Watch)> {
        let revision = self.table.revision(txn)?;
        let mut changes: Vec<Change<T>> = self
            .table
            .since(txn, self.upserts_from)?
            .map(|(object, revision)| Change {
                object,
                revision,
                deleted: false,
            })
            .collect();
        let (tombstones, next) = self.deletes.process(txn, usize::MAX)?;
        changes.extend(tombstones.into_iter().map(|t| Change {
            object: t.object,
            revision: t.revision,
            deleted: true,
        }));
        changes.sort_by_key(|c| c.revision);

        self.upserts_from = self.upserts_from.max(revision + 1);
        self.deletes.mark(next);
        Ok((changes, self.table.watch(txn)?))
    }
}
