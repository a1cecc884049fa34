use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context};
use cairn_db::{Db, Key};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentTable};

/// Counts from one reconciliation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Keeps a document table equal to the contents of a JSON file.
///
/// The file must hold an array of documents. It is reloaded when its
/// content hash changes, and the table is reconciled in one write
/// transaction: new documents are inserted, changed ones replaced, and
/// documents no longer present deleted.
pub struct SourceSync {
    db: Db,
    table: DocumentTable,
    path: PathBuf,
    last_hash: Option<blake3::Hash>,
}

impl SourceSync {
    pub fn new(db: Db, table: DocumentTable, path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            table,
            path: path.into(),
            last_hash: None,
        }
    }

    pub fn table_name(&self) -> &str {
        self.table.name()
    }

    /// Reload the file if its contents changed since the last successful
    /// sync. Returns `None` when nothing changed.
    pub fn sync_once(&mut self) -> anyhow::Result<Option<SyncReport>> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("reading source {}", self.path.display()))?;
        let hash = blake3::hash(&bytes);
        if self.last_hash == Some(hash) {
            return Ok(None);
        }
        let documents = parse_documents(&bytes)
            .with_context(|| format!("parsing source {}", self.path.display()))?;
        let report = self.reconcile(documents)?;
        self.last_hash = Some(hash);
        info!(
            table = self.table.name(),
            source = %self.path.display(),
            hash = %hash.to_hex(),
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            "reloaded source"
        );
        Ok(Some(report))
    }

    fn reconcile(&self, documents: Vec<Document>) -> anyhow::Result<SyncReport> {
        let table = self.table.table();
        let mut seen: HashSet<Key> = HashSet::with_capacity(documents.len());
        for doc in &documents {
            let Some(key) = self.table.primary_key(doc) else {
                bail!("document without a single {:?} key: {}", self.table.config().primary_key, doc.0);
            };
            if !seen.insert(key.clone()) {
                bail!("duplicate primary key {key} in {}", self.path.display());
            }
        }

        let mut txn = self.db.write_txn(&[table])?;
        let mut report = SyncReport::default();
        let stale: Vec<_> = table
            .all(&txn)?
            .map(|(doc, _)| doc)
            .filter(|doc| {
                self.table
                    .primary_key(doc)
                    .map_or(true, |key| !seen.contains(&key))
            })
            .collect();
        for doc in stale {
            table.delete(&mut txn, &doc)?;
            report.deleted += 1;
        }

        for doc in documents {
            let current = match self.table.primary_key(&doc) {
                Some(key) => self.table.get_by_key(&txn, &key)?,
                None => None,
            };
            match current {
                Some(existing) if *existing == doc => report.unchanged += 1,
                Some(_) => {
                    table.insert(&mut txn, doc)?;
                    report.updated += 1;
                }
                None => {
                    table.insert(&mut txn, doc)?;
                    report.inserted += 1;
                }
            }
        }

        // A failed insert drops the transaction, which aborts every change.
        txn.commit();
        Ok(report)
    }
}

fn parse_documents(bytes: &[u8]) -> anyhow::Result<Vec<Document>> {
    match serde_json::from_slice(bytes)? {
        Value::Array(items) => Ok(items.into_iter().map(Document).collect()),
        other => bail!("expected a JSON array of documents, found {}", kind(&other)),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Poll the source every `poll_interval` until shutdown. Failed reloads are
/// logged and retried on the next tick; the table keeps its last good
/// contents.
pub async fn run(mut sync: SourceSync, mut shutdown: watch::Receiver<bool>) {
    let interval = sync.table.config().poll_interval();
    let table = sync.table.name().to_string();
    info!(table = %table, source = %sync.path.display(), "watching source");
    loop {
        let (back, result) = match tokio::task::spawn_blocking(move || {
            let result = sync.sync_once();
            (sync, result)
        })
        .await
        {
            Ok(pair) => pair,
            Err(err) => {
                warn!(table = %table, error = %err, "source sync panicked, stopping");
                return;
            }
        };
        sync = back;
        match result {
            Ok(Some(_)) => {}
            Ok(None) => debug!(table = %table, "source unchanged"),
            Err(err) => warn!(table = %table, error = %format!("{err:#}"), "source sync failed"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(table = %table, "source watcher exiting");
}
