use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::key::{Key, KeySet};

type FromObject<T> = Arc<dyn Fn(&T) -> KeySet + Send + Sync>;
type FromKey<K> = Arc<dyn Fn(&K) -> Key + Send + Sync>;

/// A named way to derive keys from objects of type `T`, queried with
/// values of type `K`.
///
/// ```ignore
/// let by_id = Index::new("id", |u: &User| KeySet::single(u.id), |id: &u64| Key::from(*id));
/// let by_team = Index::new("team", |u: &User| KeySet::single(&u.team), |t: &str| Key::from(t))
///     .non_unique();
/// ```
pub struct Index<T, K: ?Sized> {
    name: Arc<str>,
    unique: bool,
    from_object: FromObject<T>,
    from_key: FromKey<K>,
}

impl<T, K: ?Sized> Index<T, K> {
    /// Create a unique index.
    pub fn new(
        name: impl Into<Arc<str>>,
        from_object: impl Fn(&T) -> KeySet + Send + Sync + 'static,
        from_key: impl Fn(&K) -> Key + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            unique: true,
            from_object: Arc::new(from_object),
            from_key: Arc::new(from_key),
        }
    }

    /// Allow several objects to share a key.
    pub fn non_unique(mut self) -> Self {
        self.unique = false;
        self
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` unless [`Index::non_unique`] was applied.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Build a query for objects with key `key`.
    pub fn query(&self, key: &K) -> Query<T> {
        Query::new(Arc::clone(&self.name), (self.from_key)(key))
    }

    pub(crate) fn indexer(&self) -> Indexer<T> {
        Indexer {
            name: Arc::clone(&self.name),
            unique: self.unique,
            from_object: Arc::clone(&self.from_object),
        }
    }
}

impl<T, K: ?Sized> Clone for Index<T, K> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            unique: self.unique,
            from_object: Arc::clone(&self.from_object),
            from_key: Arc::clone(&self.from_key),
        }
    }
}

impl<T, K: ?Sized> fmt::Debug for Index<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("unique", &self.unique)
            .finish()
    }
}

/// A lookup against one index of a `Table<T>`.
pub struct Query<T> {
    pub(crate) index: Arc<str>,
    pub(crate) key: Key,
    _object: PhantomData<fn() -> T>,
}

impl<T> Query<T> {
    pub(crate) fn new(index: Arc<str>, key: Key) -> Self {
        Self {
            index,
            key,
            _object: PhantomData,
        }
    }

    /// Name of the index this query runs against.
    pub fn index(&self) -> &str {
        &self.index
    }

    /// The encoded key.
    pub fn key(&self) -> &Key {
        &self.key
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.index), self.key.clone())
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("index", &self.index)
            .field("key", &self.key)
            .finish()
    }
}

/// The object-side half of an index, kept by the table.
pub(crate) struct Indexer<T> {
    pub name: Arc<str>,
    pub unique: bool,
    pub from_object: FromObject<T>,
}

impl<T> Indexer<T> {
    pub fn keys(&self, object: &T) -> KeySet {
        (self.from_object)(object)
    }
}

impl<T> Clone for Indexer<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            unique: self.unique,
            from_object: Arc::clone(&self.from_object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Endpoint {
        id: u32,
        labels: Vec<String>,
    }

    #[test]
    fn query_encodes_through_from_key() {
        let by_id = Index::new(
            "id",
            |e: &Endpoint| KeySet::single(e.id),
            |id: &u32| Key::from(*id),
        );
        let q = by_id.query(&7);
        assert_eq!(q.index(), "id");
        assert_eq!(q.key().as_bytes(), &7u32.to_be_bytes());
        assert!(by_id.is_unique());
    }

    #[test]
    fn non_unique_index_yields_many_keys() {
        let by_label = Index::new(
            "label",
            |e: &Endpoint| e.labels.iter().map(String::as_str).collect(),
            |l: &str| Key::from(l),
        )
        .non_unique();
        assert!(!by_label.is_unique());

        let ep = Endpoint {
            id: 1,
            labels: vec!["app=web".into(), "tier=front".into(), "app=web".into()],
        };
        assert_eq!(by_label.indexer().keys(&ep).len(), 2);
    }
}
