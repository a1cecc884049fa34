use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use cairn_radix::{Iter, Watch};
use parking_lot::Mutex;

use crate::entry::{update, TableEntry};
use crate::error::{DbError, DbResult};
use crate::index::{Index, Indexer, Query};
use crate::key::{encode_non_unique, graveyard_key, non_unique_secondary_len, revision_key, Key};
use crate::object::{Object, Revision, TableObject};
use crate::tracker::{ChangeIterator, DeleteTracker};
use crate::txn::{Txn, WriteTxn};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

const UNREGISTERED: usize = usize::MAX;

/// Name and uniqueness of one index, as registered.
#[derive(Clone, Debug)]
pub struct IndexMeta {
    pub name: Arc<str>,
    pub unique: bool,
}

/// Untyped description of a table: its name, indexes, lock and, once
/// registered, its position in the root.
pub struct TableMeta {
    id: u64,
    name: Arc<str>,
    indexes: Vec<IndexMeta>,
    pos: AtomicUsize,
    pub(crate) lock: Arc<Mutex<()>>,
}

impl TableMeta {
    fn new(name: Arc<str>, indexes: Vec<IndexMeta>) -> Self {
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            indexes,
            pos: AtomicUsize::new(UNREGISTERED),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the root; `None` until registered.
    pub fn position(&self) -> Option<usize> {
        let pos = self.pos.load(Ordering::Acquire);
        (pos != UNREGISTERED).then_some(pos)
    }

    /// Indexes, primary first.
    pub fn indexes(&self) -> &[IndexMeta] {
        &self.indexes
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Claim `pos` for an unregistered table. Fails if already claimed.
    pub(crate) fn assign_position(&self, pos: usize) -> bool {
        self.pos
            .compare_exchange(UNREGISTERED, pos, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo [`assign_position`](Self::assign_position) for a registration
    /// that was never published.
    pub(crate) fn clear_position(&self, pos: usize) {
        let _ = self
            .pos
            .compare_exchange(pos, UNREGISTERED, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl fmt::Debug for TableMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableMeta")
            .field("name", &self.name)
            .field("position", &self.position())
            .field("indexes", &self.indexes)
            .finish()
    }
}

/// Any table, regardless of its object type. Used where tables of different
/// types are passed together, such as registration and write transactions.
pub trait AnyTable: Send + Sync {
    fn meta(&self) -> &Arc<TableMeta>;

    fn name(&self) -> &str {
        self.meta().name()
    }
}

/// Table and index names: `^[a-z][a-z0-9_-]{0,30}$`.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    matches!(bytes.first(), Some(b'a'..=b'z'))
        && bytes.len() <= 31
        && bytes[1..]
            .iter()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

/// A typed table of `T` objects.
///
/// Built once with [`Table::new`] and [`Table::with_index`], registered with
/// [`Db::register_table`](crate::Db::register_table), then cloned freely.
/// Reads take any [`Txn`]; writes take a [`WriteTxn`] that locked the table.
pub struct Table<T> {
    meta: Arc<TableMeta>,
    /// Primary first.
    indexers: Arc<[Indexer<T>]>,
}

impl<T: TableObject> Table<T> {
    /// Create a table with the given primary index.
    pub fn new<K: ?Sized>(name: impl Into<Arc<str>>, primary: Index<T, K>) -> Self {
        let indexer = primary.indexer();
        let meta = TableMeta::new(
            name.into(),
            vec![IndexMeta {
                name: Arc::clone(&indexer.name),
                unique: indexer.unique,
            }],
        );
        Self {
            meta: Arc::new(meta),
            indexers: Arc::from(vec![indexer]),
        }
    }

    /// Add a secondary index. Must be called before registration.
    pub fn with_index<K: ?Sized>(self, index: Index<T, K>) -> Self {
        let mut indexers = self.indexers.to_vec();
        indexers.push(index.indexer());
        let indexes = indexers
            .iter()
            .map(|i| IndexMeta {
                name: Arc::clone(&i.name),
                unique: i.unique,
            })
            .collect();
        Self {
            meta: Arc::new(TableMeta::new(Arc::clone(&self.meta.name), indexes)),
            indexers: Arc::from(indexers),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        self.meta.name()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The first object matching `query`, with its revision.
    pub fn get(&self, txn: &impl Txn, query: Query<T>) -> DbResult<Option<(Arc<T>, Revision)>> {
        Ok(self.list(txn, query)?.next())
    }

    /// Like [`Table::get`], plus a watch that closes when the result may have
    /// changed.
    pub fn get_watch(
        &self,
        txn: &impl Txn,
        query: Query<T>,
    ) -> DbResult<(Option<(Arc<T>, Revision)>, Watch)> {
        let entry = txn.table_entry(&self.meta)?;
        let watch = self.index_of(entry, &query.index)?.tree.prefix_watch(query.key.as_bytes());
        Ok((self.get(txn, query)?, watch))
    }

    /// Every object matching `query`.
    pub fn list<'a>(&self, txn: &'a impl Txn, query: Query<T>) -> DbResult<Objects<'a, T>> {
        let entry = txn.table_entry(&self.meta)?;
        let index = self.index_of(entry, &query.index)?;
        let key = query.key.as_bytes();
        Ok(if index.unique {
            Objects::one(index.tree.get(key))
        } else {
            Objects::scan(index.tree.prefix(key), Some(key.len()))
        })
    }

    /// Objects whose key in the queried index starts with the query key, in
    /// key order.
    pub fn prefix<'a>(&self, txn: &'a impl Txn, query: Query<T>) -> DbResult<Objects<'a, T>> {
        let entry = txn.table_entry(&self.meta)?;
        let index = self.index_of(entry, &query.index)?;
        Ok(Objects::scan(index.tree.prefix(query.key.as_bytes()), None))
    }

    /// Objects whose key in the queried index is at or above the query key,
    /// in key order.
    pub fn lower_bound<'a>(&self, txn: &'a impl Txn, query: Query<T>) -> DbResult<Objects<'a, T>> {
        let entry = txn.table_entry(&self.meta)?;
        let index = self.index_of(entry, &query.index)?;
        Ok(Objects::scan(index.tree.lower_bound(query.key.as_bytes()), None))
    }

    /// Every object in primary key order.
    pub fn all<'a>(&self, txn: &'a impl Txn) -> DbResult<Objects<'a, T>> {
        let entry = txn.table_entry(&self.meta)?;
        Ok(Objects::scan(entry.primary().iter(), None))
    }

    /// Objects written at or after `revision`, in revision order.
    pub fn since<'a>(&self, txn: &'a impl Txn, revision: Revision) -> DbResult<Objects<'a, T>> {
        let entry = txn.table_entry(&self.meta)?;
        Ok(Objects::scan(entry.revisions.lower_bound(&revision_key(revision)), None))
    }

    /// Revision of the last change to the table.
    pub fn revision(&self, txn: &impl Txn) -> DbResult<Revision> {
        Ok(txn.table_entry(&self.meta)?.revision)
    }

    /// Number of live objects.
    pub fn num_objects(&self, txn: &impl Txn) -> DbResult<usize> {
        Ok(txn.table_entry(&self.meta)?.num_objects())
    }

    /// A watch that closes on the next change to the table.
    pub fn watch(&self, txn: &impl Txn) -> DbResult<Watch> {
        Ok(txn.table_entry(&self.meta)?.revisions.root_watch())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert or replace an object, returning the version it replaced.
    ///
    /// Key functions run and constraints are checked before any index is
    /// touched, so a failed insert leaves the transaction unchanged.
    pub fn insert(&self, txn: &mut WriteTxn, object: T) -> DbResult<Option<Arc<T>>> {
        let primary = self.primary_key(&object)?;
        let staged = txn.staged(&self.meta)?;
        let entry = &mut *staged.entry;

        let old = entry.primary().get(&primary).cloned();
        let new_keys = self.secondary_keys(&object, &primary)?;
        for (i, keys) in new_keys.iter().enumerate() {
            let indexer = &self.indexers[i + 1];
            if !indexer.unique {
                continue;
            }
            let tree = &entry.indexes[i + 1].tree;
            for key in keys {
                if let Some(owner) = tree.get(key) {
                    if *owner.primary_key != *primary {
                        return Err(DbError::UniqueConstraint {
                            table: self.name().to_string(),
                            index: indexer.name.to_string(),
                            key: Key::new(key.clone()).to_string(),
                        });
                    }
                }
            }
        }
        let old_keys = match &old {
            Some(old) => self.secondary_keys(&old.downcast::<T>(), &primary)?,
            None => Vec::new(),
        };

        entry.revision += 1;
        let revision = entry.revision;
        let primary: Arc<[u8]> = Arc::from(primary);
        let value = Arc::new(object);
        let new = Object::new(revision, Arc::clone(&primary), value);
        let watches = &mut *staged.watches;

        update(&mut entry.indexes[0].tree, watches, |t| {
            t.insert(&primary, new.clone());
        });
        update(&mut entry.revisions, watches, |t| {
            if let Some(old) = &old {
                t.delete(&revision_key(old.revision));
            }
            t.insert(&revision_key(revision), new.clone());
        });
        for (i, keys) in old_keys.iter().enumerate() {
            update(&mut entry.indexes[i + 1].tree, watches, |t| {
                for key in keys {
                    t.delete(key);
                }
            });
        }
        for (i, keys) in new_keys.iter().enumerate() {
            update(&mut entry.indexes[i + 1].tree, watches, |t| {
                for key in keys {
                    t.insert(key, new.clone());
                }
            });
        }

        // Re-inserting a deleted key retires its tombstone.
        if let Some(tomb) = entry.graveyard_by_key.get(&primary).cloned() {
            update(&mut entry.graveyard_by_key, watches, |t| t.delete(&primary));
            update(&mut entry.graveyard, watches, |t| {
                t.delete(&graveyard_key(tomb.revision, &primary))
            });
        }

        Ok(old.map(|old| old.downcast()))
    }

    /// Delete the object with the same primary key as `object`, returning the
    /// deleted version. Deleting an absent object is a no-op.
    pub fn delete(&self, txn: &mut WriteTxn, object: &T) -> DbResult<Option<Arc<T>>> {
        let primary = self.primary_key(object)?;
        let staged = txn.staged(&self.meta)?;
        let Some(old) = staged.entry.primary().get(&primary).cloned() else {
            return Ok(None);
        };
        let old_value = old.downcast::<T>();
        let old_keys = self.secondary_keys(&old_value, &primary)?;

        let entry = &mut *staged.entry;
        let watches = &mut *staged.watches;
        entry.revision += 1;
        let revision = entry.revision;

        update(&mut entry.indexes[0].tree, watches, |t| t.delete(&primary));
        update(&mut entry.revisions, watches, |t| {
            t.delete(&revision_key(old.revision))
        });
        for (i, keys) in old_keys.iter().enumerate() {
            update(&mut entry.indexes[i + 1].tree, watches, |t| {
                for key in keys {
                    t.delete(key);
                }
            });
        }

        let tomb = Object {
            revision,
            ..old
        };
        update(&mut entry.graveyard, watches, |t| {
            t.insert(&graveyard_key(revision, &primary), tomb.clone())
        });
        update(&mut entry.graveyard_by_key, watches, |t| {
            t.insert(&primary, tomb.clone())
        });
        *staged.graveyard_dirty = true;

        Ok(Some(old_value))
    }

    /// Delete every object, returning how many were deleted.
    pub fn delete_all(&self, txn: &mut WriteTxn) -> DbResult<usize> {
        let objects: Vec<Arc<T>> = self.all(&*txn)?.map(|(obj, _)| obj).collect();
        for obj in &objects {
            self.delete(txn, obj)?;
        }
        Ok(objects.len())
    }

    // -----------------------------------------------------------------------
    // Trackers
    // -----------------------------------------------------------------------

    /// Attach a delete tracker starting at revision 0, so it sees every
    /// tombstone still in the graveyard.
    ///
    /// Tombstones at or above the tracker's watermark are retained until it
    /// advances or is dropped. The tracker attaches when `txn` commits; if it
    /// aborts instead, the tracker is closed.
    pub fn delete_tracker(&self, txn: &mut WriteTxn, name: &str) -> DbResult<DeleteTracker<T>> {
        DeleteTracker::register(self.clone(), txn, name, 0)
    }

    /// Iterate changes to the table: first every current object, then each
    /// later upsert and deletion in revision order. Like
    /// [`delete_tracker`](Self::delete_tracker), the iterator is only usable
    /// once `txn` commits.
    pub fn changes(&self, txn: &mut WriteTxn) -> DbResult<ChangeIterator<T>> {
        let revision = self.revision(&*txn)?;
        let tracker = DeleteTracker::register(self.clone(), txn, "changes", revision + 1)?;
        Ok(ChangeIterator::new(self.clone(), tracker))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn primary_key(&self, object: &T) -> DbResult<Vec<u8>> {
        let keys = self.indexers[0].keys(object);
        if keys.len() != 1 {
            return Err(DbError::PrimaryKeyCount {
                table: self.name().to_string(),
                count: keys.len(),
            });
        }
        Ok(keys.into_iter().next().map(Key::into_bytes).unwrap_or_default())
    }

    /// Stored keys for each secondary index, in index order.
    fn secondary_keys(&self, object: &T, primary: &[u8]) -> DbResult<Vec<Vec<Vec<u8>>>> {
        self.indexers[1..]
            .iter()
            .map(|indexer| {
                indexer
                    .keys(object)
                    .into_iter()
                    .map(|key| {
                        if indexer.unique {
                            return Ok(key.into_bytes());
                        }
                        encode_non_unique(key.as_bytes(), primary).ok_or_else(|| {
                            DbError::KeyTooLong {
                                index: indexer.name.to_string(),
                                len: key.len(),
                            }
                        })
                    })
                    .collect()
            })
            .collect()
    }

    fn index_of<'a>(
        &self,
        entry: &'a TableEntry,
        index: &str,
    ) -> DbResult<&'a crate::entry::IndexTree> {
        entry.index(index).ok_or_else(|| DbError::IndexNotFound {
            table: self.name().to_string(),
            index: index.to_string(),
        })
    }
}

impl<T> AnyTable for Table<T>
where
    T: TableObject,
{
    fn meta(&self) -> &Arc<TableMeta> {
        &self.meta
    }
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            meta: Arc::clone(&self.meta),
            indexers: Arc::clone(&self.indexers),
        }
    }
}

impl<T> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("meta", &self.meta).finish()
    }
}

/// Iterator over `(object, revision)` pairs of a table.
pub struct Objects<'a, T> {
    inner: Inner<'a>,
    _object: PhantomData<fn() -> T>,
}

enum Inner<'a> {
    One(Option<&'a Object>),
    /// `secondary_len` restricts a non-unique scan to keys whose secondary
    /// part has exactly that length.
    Scan {
        iter: Iter<'a, Object>,
        secondary_len: Option<usize>,
    },
}

impl<'a, T> Objects<'a, T> {
    fn one(obj: Option<&'a Object>) -> Self {
        Self {
            inner: Inner::One(obj),
            _object: PhantomData,
        }
    }

    fn scan(iter: Iter<'a, Object>, secondary_len: Option<usize>) -> Self {
        Self {
            inner: Inner::Scan {
                iter,
                secondary_len,
            },
            _object: PhantomData,
        }
    }
}

impl<'a, T: TableObject> Iterator for Objects<'a, T> {
    type Item = (Arc<T>, Revision);

    fn next(&mut self) -> Option<Self::Item> {
        let obj = match &mut self.inner {
            Inner::One(obj) => obj.take()?,
            Inner::Scan {
                iter,
                secondary_len,
            } => loop {
                let (key, obj) = iter.next()?;
                match secondary_len {
                    Some(len) if non_unique_secondary_len(key) != Some(*len) => continue,
                    _ => break obj,
                }
            },
        };
        Some((obj.downcast(), obj.revision))
    }
}
