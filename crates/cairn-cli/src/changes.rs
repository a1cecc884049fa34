use cairn_db::{Change, ChangeIterator, Db, DbResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentTable};

/// Log every change to `table` until shutdown.
///
/// The first batch is the table's contents at start; after that each batch
/// holds the upserts and deletions committed since the previous one, in
/// revision order.
pub async fn log_changes(db: Db, table: DocumentTable, mut shutdown: watch::Receiver<bool>) {
    // Registering takes the table lock, which may block behind a writer.
    let registration = {
        let db = db.clone();
        let table = table.clone();
        tokio::task::spawn_blocking(move || follow(&db, &table))
    };
    let mut changes = match registration.await {
        Ok(Ok(changes)) => changes,
        Ok(Err(err)) => {
            warn!(table = table.name(), error = %err, "cannot follow changes");
            return;
        }
        Err(err) => {
            warn!(table = table.name(), error = %err, "change registration panicked");
            return;
        }
    };

    loop {
        let (batch, watch) = match changes.next(&db.read_txn()) {
            Ok(next) => next,
            Err(err) => {
                warn!(table = table.name(), error = %err, "change iteration failed");
                return;
            }
        };
        for change in &batch {
            log_change(&table, change);
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = watch.closed() => {}
        }
    }
    debug!(table = table.name(), "change logger exiting");
}

fn follow(db: &Db, table: &DocumentTable) -> DbResult<ChangeIterator<Document>> {
    let mut txn = db.write_txn(&[table.table()])?;
    let changes = table.table().changes(&mut txn)?;
    txn.commit();
    Ok(changes)
}

fn log_change(table: &DocumentTable, change: &Change<Document>) {
    info!(table = table.name(), "{}", describe(table, change));
}

/// One line per change: `+` for an upsert, `-` for a deletion, then the
/// primary key and revision.
pub fn describe(table: &DocumentTable, change: &Change<Document>) -> String {
    let key = table
        .primary_key(&change.object)
        .map(|k| k.to_string())
        .unwrap_or_default();
    let op = if change.deleted { "-" } else { "+" };
    format!("{op} {key} @{}", change.revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use cairn_db::DbConfig;
    use serde_json::json;

    fn jobs() -> (Db, DocumentTable) {
        let table = DocumentTable::new(TableConfig {
            name: "jobs".into(),
            primary_key: "id".into(),
            indexes: Vec::new(),
            source: None,
            poll_interval_ms: 1000,
        });
        let db = Db::new(DbConfig::default()).unwrap();
        db.register_table(table.table()).unwrap();
        (db, table)
    }

    fn lines(table: &DocumentTable, batch: &[Change<Document>]) -> Vec<String> {
        batch.iter().map(|c| describe(table, c)).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn logger_waits_for_held_table_lock() {
        let (db, jobs) = jobs();
        let (tx, rx) = watch::channel(false);
        let held = db.write_txn(&[jobs.table()]).unwrap();
        let task = tokio::spawn(log_changes(db.clone(), jobs.clone(), rx));

        // The runtime keeps running while registration waits for the lock.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        held.abort();

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(db.collect_graveyard().unwrap().trackers_purged, 1);
    }

    #[test]
    fn describe_batches() {
        let (db, jobs) = jobs();
        let mut txn = db.write_txn(&[jobs.table()]).unwrap();
        jobs.table().insert(&mut txn, Document(json!({ "id": "build" }))).unwrap();
        let mut changes = jobs.table().changes(&mut txn).unwrap();
        txn.commit();

        let (batch, _) = changes.next(&db.read_txn()).unwrap();
        assert_eq!(lines(&jobs, &batch), vec!["+ build @1"]);

        let mut txn = db.write_txn(&[jobs.table()]).unwrap();
        jobs.table().delete(&mut txn, &Document(json!({ "id": "build" }))).unwrap();
        txn.commit();
        let (batch, _) = changes.next(&db.read_txn()).unwrap();
        assert_eq!(lines(&jobs, &batch), vec!["- build @2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn logger_exits_on_shutdown() {
        let (db, jobs) = jobs();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(log_changes(db.clone(), jobs.clone(), rx));

        let mut txn = db.write_txn(&[jobs.table()]).unwrap();
        jobs.table().insert(&mut txn, Document(json!({ "id": "test" }))).unwrap();
        txn.commit();
        tokio::task::yield_now().await;

        tx.send(true).unwrap();
        task.await.unwrap();
        // The logger's tracker is closed once it exits.
        let report = db.collect_graveyard().unwrap();
        assert_eq!(report.trackers_purged, 1);
    }
}
