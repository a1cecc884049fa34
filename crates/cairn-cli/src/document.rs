use std::collections::BTreeMap;
use std::sync::Arc;

use cairn_db::{DbResult, Index, Key, KeySet, Query, Table, Txn};
use serde::Serialize;
use serde_json::Value;

use crate::config::TableConfig;

/// A schemaless JSON value stored in a table.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Document(pub Value);

impl Document {
    /// The value at a dotted field path. Numeric parts index into arrays.
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.0, |value, part| match value {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Keys of the field at `path`. An array yields one key per scalar
    /// element; a missing, null or object field yields none.
    pub fn field_keys(&self, path: &str) -> KeySet {
        match self.field(path) {
            Some(Value::Array(items)) => items.iter().filter_map(value_key).collect(),
            Some(value) => value_key(value).map(KeySet::single).unwrap_or_default(),
            None => KeySet::empty(),
        }
    }
}

/// Key encoding of a scalar JSON value. Unsigned integers are big-endian so
/// they sort numerically.
pub fn value_key(value: &Value) -> Option<Key> {
    match value {
        Value::String(s) => Some(Key::from(s.as_str())),
        Value::Number(n) => Some(match n.as_u64() {
            Some(u) => Key::from(u),
            None => Key::from(n.to_string()),
        }),
        Value::Bool(b) => Some(Key::from(*b)),
        _ => None,
    }
}

fn field_index(name: &str, field: &str, unique: bool) -> Index<Document, Value> {
    let path: Arc<str> = Arc::from(field);
    let index = Index::new(
        name,
        move |doc: &Document| doc.field_keys(&path),
        |value: &Value| value_key(value).unwrap_or_default(),
    );
    if unique {
        index
    } else {
        index.non_unique()
    }
}

/// A table of [`Document`]s laid out by a [`TableConfig`].
#[derive(Clone)]
pub struct DocumentTable {
    config: TableConfig,
    table: Table<Document>,
    primary: Index<Document, Key>,
    indexes: BTreeMap<String, Index<Document, Value>>,
}

impl DocumentTable {
    /// The primary index is named after the key field, with `.` replaced by
    /// `_`.
    pub fn new(config: TableConfig) -> Self {
        let primary_name = config.primary_key.replace('.', "_");
        let path: Arc<str> = Arc::from(config.primary_key.as_str());
        let primary = Index::new(
            primary_name.as_str(),
            move |doc: &Document| doc.field_keys(&path),
            |key: &Key| key.clone(),
        );
        let mut indexes = BTreeMap::new();
        let mut table = Table::new(config.name.as_str(), primary.clone());
        indexes.insert(
            primary_name.clone(),
            field_index(&primary_name, &config.primary_key, true),
        );
        for ic in &config.indexes {
            let index = field_index(&ic.name, &ic.field, ic.unique);
            table = table.with_index(index.clone());
            indexes.insert(ic.name.clone(), index);
        }
        Self {
            config,
            table,
            primary,
            indexes,
        }
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn table(&self) -> &Table<Document> {
        &self.table
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The primary key of `doc`, if it has exactly one.
    pub fn primary_key(&self, doc: &Document) -> Option<Key> {
        let mut keys = doc.field_keys(&self.config.primary_key).into_iter();
        match (keys.next(), keys.next()) {
            (Some(key), None) => Some(key),
            _ => None,
        }
    }

    /// The current document with primary key `key`.
    pub fn get_by_key(&self, txn: &impl Txn, key: &Key) -> DbResult<Option<Arc<Document>>> {
        Ok(self
            .table
            .get(txn, self.primary.query(key))?
            .map(|(doc, _)| doc))
    }

    /// Query `index` for documents whose field equals `value`.
    pub fn query(&self, index: &str, value: &Value) -> Option<Query<Document>> {
        self.indexes.get(index).map(|i| i.query(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use cairn_db::{Db, DbConfig, DbError};
    use serde_json::json;

    fn nodes_config() -> TableConfig {
        TableConfig {
            name: "nodes".into(),
            primary_key: "meta.id".into(),
            indexes: vec![
                IndexConfig {
                    name: "zone".into(),
                    field: "labels.zone".into(),
                    unique: false,
                },
                IndexConfig {
                    name: "tags".into(),
                    field: "tags".into(),
                    unique: false,
                },
            ],
            source: None,
            poll_interval_ms: 1000,
        }
    }

    fn node(id: u64, zone: &str, tags: &[&str]) -> Document {
        Document(json!({ "meta": { "id": id }, "labels": { "zone": zone }, "tags": tags }))
    }

    #[test]
    fn field_paths() {
        let doc = Document(json!({ "a": { "b": [10, { "c": "x" }] } }));
        assert_eq!(doc.field("a.b.0"), Some(&json!(10)));
        assert_eq!(doc.field("a.b.1.c"), Some(&json!("x")));
        assert_eq!(doc.field("a.z"), None);
        assert_eq!(doc.field("a.b.x"), None);
    }

    #[test]
    fn field_keys_by_type() {
        let doc = Document(json!({ "n": 7, "s": "x", "list": ["a", "b", "a"], "nil": null, "obj": {} }));
        assert_eq!(doc.field_keys("n"), KeySet::single(7u64));
        assert_eq!(doc.field_keys("s"), KeySet::single("x"));
        assert_eq!(doc.field_keys("list").len(), 2);
        assert!(doc.field_keys("nil").is_empty());
        assert!(doc.field_keys("obj").is_empty());
        assert!(doc.field_keys("missing").is_empty());
    }

    #[test]
    fn integers_sort_numerically() {
        assert!(value_key(&json!(2)).unwrap() < value_key(&json!(10)).unwrap());
    }

    #[test]
    fn document_table_queries() {
        let nodes = DocumentTable::new(nodes_config());
        let db = Db::new(DbConfig::default()).unwrap();
        db.register_table(nodes.table()).unwrap();
        let mut txn = db.write_txn(&[nodes.table()]).unwrap();
        nodes.table().insert(&mut txn, node(1, "eu", &["gpu"])).unwrap();
        nodes.table().insert(&mut txn, node(2, "us", &["gpu", "ssd"])).unwrap();
        nodes.table().insert(&mut txn, node(3, "eu", &[])).unwrap();
        let rtxn = txn.commit();

        let q = nodes.query("meta_id", &json!(2)).unwrap();
        let (doc, _) = nodes.table().get(&rtxn, q).unwrap().unwrap();
        assert_eq!(doc.field("labels.zone"), Some(&json!("us")));

        let q = nodes.query("zone", &json!("eu")).unwrap();
        assert_eq!(nodes.table().list(&rtxn, q).unwrap().count(), 2);
        let q = nodes.query("tags", &json!("gpu")).unwrap();
        assert_eq!(nodes.table().list(&rtxn, q).unwrap().count(), 2);
        assert!(nodes.query("nope", &json!(1)).is_none());
    }

    #[test]
    fn document_without_primary_key_is_rejected() {
        let nodes = DocumentTable::new(nodes_config());
        let db = Db::new(DbConfig::default()).unwrap();
        db.register_table(nodes.table()).unwrap();
        let mut txn = db.write_txn(&[nodes.table()]).unwrap();
        let err = nodes
            .table()
            .insert(&mut txn, Document(json!({ "labels": {} })))
            .unwrap_err();
        assert!(matches!(err, DbError::PrimaryKeyCount { count: 0, .. }));
        assert_eq!(nodes.primary_key(&Document(json!({}))), None);
        assert_eq!(nodes.primary_key(&node(4, "eu", &[])), Some(Key::from(4u64)));
        txn.abort();
    }
}
