use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Per-table change counter. Every insert, update or delete bumps it by one.
pub type Revision = u64;

/// Values that can be stored in a table.
///
/// Objects are immutable once inserted: updating means inserting a new value
/// under the same primary key. `Serialize` is required so snapshots can be
/// dumped for introspection.
pub trait TableObject: Serialize + Send + Sync + 'static {}

impl<T: Serialize + Send + Sync + 'static> TableObject for T {}

/// Type-erased view of a stored value.
pub(crate) trait DynObject: Send + Sync + 'static {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
}

impl<T: TableObject> DynObject for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// An object as stored in every index of its table.
///
/// Cloning is cheap; the value itself is shared.
#[derive(Clone)]
pub(crate) struct Object {
    /// Revision at which this version was written (or deleted, for
    /// tombstones).
    pub revision: Revision,
    pub primary_key: Arc<[u8]>,
    pub data: Arc<dyn DynObject>,
}

impl Object {
    pub fn new<T: TableObject>(revision: Revision, primary_key: Arc<[u8]>, value: Arc<T>) -> Self {
        Self {
            revision,
            primary_key,
            data: value,
        }
    }

    /// Recover the typed value.
    ///
    /// Each table stores values of exactly one type, and only `Table<T>`
    /// reads them back, so a mismatch is a bug in this crate.
    pub fn downcast<T: TableObject>(&self) -> Arc<T> {
        Arc::clone(&self.data)
            .into_any()
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("table object is not a {}", std::any::type_name::<T>()))
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        self.data.to_json()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("revision", &self.revision)
            .field("primary_key", &hex::encode(&self.primary_key))
            .finish()
    }
}
