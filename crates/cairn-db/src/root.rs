use crate::entry::TableEntry;
use crate::error::{DbError, DbResult};
use crate::table::TableMeta;

/// One version of the whole database: every table's entry, addressed by
/// position.
///
/// Roots are immutable once published. Registration appends entries;
/// commits replace the entries of the tables they wrote.
#[derive(Clone, Default)]
pub struct Root {
    pub(crate) tables: Vec<TableEntry>,
}

impl Root {
    /// Position of a table registered in this root.
    pub(crate) fn position(&self, meta: &TableMeta) -> DbResult<usize> {
        meta.position()
            .filter(|&pos| {
                self.tables
                    .get(pos)
                    .is_some_and(|entry| entry.meta.id() == meta.id())
            })
            .ok_or_else(|| DbError::TableNotRegistered(meta.name().to_string()))
    }

    pub(crate) fn entry(&self, meta: &TableMeta) -> DbResult<&TableEntry> {
        let pos = self.position(meta)?;
        Ok(&self.tables[pos])
    }

    /// Entries in registration order.
    pub fn tables(&self) -> &[TableEntry] {
        &self.tables
    }

    /// Number of registered tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns `true` before any table is registered.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
