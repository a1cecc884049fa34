use std::sync::atomic::Ordering;
use std::sync::Arc;

use cairn_radix::{Tree, Txn as TreeTxn, Watch};
use serde::Serialize;

use crate::error::DbResult;
use crate::object::{Object, Revision};
use crate::table::TableMeta;
use crate::tracker::TrackerState;

/// One index of a table together with its current tree.
#[derive(Clone)]
pub(crate) struct IndexTree {
    pub name: Arc<str>,
    pub unique: bool,
    pub tree: Tree<Object>,
}

/// The state of one table inside a [`Root`](crate::Root).
///
/// Entries are immutable once published. A write transaction works on a
/// private clone, which shares every tree with the published entry until
/// the first mutation.
#[derive(Clone)]
pub struct TableEntry {
    pub(crate) meta: Arc<TableMeta>,
    pub(crate) revision: Revision,
    /// Primary index first, then the secondary indexes in declaration order.
    pub(crate) indexes: Vec<IndexTree>,
    /// Live objects keyed by big-endian revision.
    pub(crate) revisions: Tree<Object>,
    /// Tombstones keyed by `(deletion revision, primary key)`.
    pub(crate) graveyard: Tree<Object>,
    /// Tombstones keyed by primary key.
    pub(crate) graveyard_by_key: Tree<Object>,
    pub(crate) delete_trackers: Tree<Arc<TrackerState>>,
}

impl TableEntry {
    pub(crate) fn new(meta: Arc<TableMeta>) -> Self {
        let indexes = meta
            .indexes()
            .iter()
            .map(|index| IndexTree {
                name: Arc::clone(&index.name),
                unique: index.unique,
                tree: Tree::new(),
            })
            .collect();
        Self {
            meta,
            revision: 0,
            indexes,
            revisions: Tree::new(),
            graveyard: Tree::new(),
            graveyard_by_key: Tree::new(),
            delete_trackers: Tree::new(),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        self.meta.name()
    }

    /// Revision of the last change to the table; 0 if never written.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Number of live objects.
    pub fn num_objects(&self) -> usize {
        self.primary().len()
    }

    /// Number of tombstones awaiting collection.
    pub fn graveyard_len(&self) -> usize {
        self.graveyard.len()
    }

    pub(crate) fn primary(&self) -> &Tree<Object> {
        &self.indexes[0].tree
    }

    pub(crate) fn index(&self, name: &str) -> Option<&IndexTree> {
        self.indexes.iter().find(|index| &*index.name == name)
    }

    /// Lowest watermark among open delete trackers; `None` if there are
    /// none.
    pub(crate) fn low_watermark(&self) -> Option<Revision> {
        self.delete_trackers
            .iter()
            .map(|(_, state)| state)
            .filter(|state| !state.is_closed())
            .map(|state| state.watermark.load(Ordering::Acquire))
            .min()
    }

    pub(crate) fn has_closed_trackers(&self) -> bool {
        self.delete_trackers
            .iter()
            .any(|(_, state)| state.is_closed())
    }

    /// Summary for introspection.
    pub fn info(&self) -> TableInfo {
        TableInfo {
            name: self.name().to_string(),
            position: self.meta.position().unwrap_or_default(),
            revision: self.revision,
            objects: self.num_objects(),
            graveyard: self.graveyard.len(),
            delete_trackers: self.delete_trackers.len(),
            indexes: self
                .indexes
                .iter()
                .map(|index| IndexInfo {
                    name: index.name.to_string(),
                    unique: index.unique,
                })
                .collect(),
        }
    }

    /// Every live object as JSON, in primary key order.
    pub fn objects_json(&self) -> DbResult<Vec<serde_json::Value>> {
        Ok(self
            .primary()
            .iter()
            .map(|(_, obj)| obj.to_json())
            .collect::<serde_json::Result<_>>()?)
    }
}

/// Table summary returned by [`Txn::tables`](crate::Txn::tables).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub position: usize,
    pub revision: Revision,
    pub objects: usize,
    pub graveyard: usize,
    pub delete_trackers: usize,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
}

/// Apply a batch of mutations to a staged tree, collecting the watches of
/// the nodes it supersedes.
///
/// The tree is moved into the batch so that nodes created by earlier
/// mutations of the same write transaction are uniquely owned and get
/// updated in place.
pub(crate) fn update<V: Clone, R>(
    tree: &mut Tree<V>,
    watches: &mut Vec<Watch>,
    f: impl FnOnce(&mut TreeTxn<V>) -> R,
) -> R {
    let mut txn = std::mem::take(tree).into_txn();
    let out = f(&mut txn);
    let (next, superseded) = txn.commit_only();
    *tree = next;
    watches.extend(superseded);
    out
}
