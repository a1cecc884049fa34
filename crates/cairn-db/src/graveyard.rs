use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::entry::update;
use crate::error::DbResult;
use crate::table::{AnyTable, TableMeta};
use crate::txn::Txn;

/// Outcome of one collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Tables locked by the pass.
    pub tables: usize,
    /// Tombstones removed.
    pub collected: usize,
    /// Closed delete trackers detached.
    pub trackers_purged: usize,
    /// The batch limit was hit with collectable tombstones left over.
    pub remaining: bool,
}

/// Lock handle for a table known only by its metadata.
struct MetaRef(Arc<TableMeta>);

impl AnyTable for MetaRef {
    fn meta(&self) -> &Arc<TableMeta> {
        &self.0
    }
}

/// One pass over every table with tombstones or closed trackers.
///
/// Runs as a write transaction, so the low watermark is computed while the
/// table lock is held and no tracker can attach in between.
pub(crate) fn collect(db: &Db) -> DbResult<GcReport> {
    let metas: Vec<MetaRef> = db
        .read_txn()
        .table_entries()
        .into_iter()
        .filter(|entry| entry.graveyard_len() > 0 || entry.has_closed_trackers())
        .map(|entry| MetaRef(Arc::clone(&entry.meta)))
        .collect();
    if metas.is_empty() {
        return Ok(GcReport::default());
    }

    let locked: Vec<&dyn AnyTable> = metas.iter().map(|m| m as &dyn AnyTable).collect();
    let mut txn = db.write_txn(&locked)?;
    let mut report = GcReport {
        tables: metas.len(),
        ..Default::default()
    };
    let mut budget = db.config().gc_batch_limit;

    for MetaRef(meta) in &metas {
        let start = Instant::now();
        let staged = txn.staged(meta)?;
        let entry = staged.entry;
        let watches = staged.watches;
        let low = entry.low_watermark();

        let mut doomed: Vec<(Vec<u8>, Arc<[u8]>)> = entry
            .graveyard
            .iter()
            .take_while(|(_, tomb)| low.map_or(true, |w| tomb.revision < w))
            .take(budget.saturating_add(1))
            .map(|(key, tomb)| (key.to_vec(), Arc::clone(&tomb.primary_key)))
            .collect();
        if doomed.len() > budget {
            doomed.truncate(budget);
            report.remaining = true;
        }
        budget -= doomed.len();

        if !doomed.is_empty() {
            update(&mut entry.graveyard, watches, |t| {
                for (key, _) in &doomed {
                    t.delete(key);
                }
            });
            update(&mut entry.graveyard_by_key, watches, |t| {
                for (_, primary) in &doomed {
                    t.delete(primary);
                }
            });
        }

        let closed: Vec<Vec<u8>> = entry
            .delete_trackers
            .iter()
            .filter(|(_, state)| state.is_closed())
            .map(|(key, _)| key.to_vec())
            .collect();
        if !closed.is_empty() {
            update(&mut entry.delete_trackers, watches, |t| {
                for key in &closed {
                    t.delete(key);
                }
            });
        }

        let metrics = db.metrics();
        let name = meta.name();
        metrics.graveyard_low_watermark(name, low.unwrap_or(entry.revision + 1));
        metrics.graveyard_cleaning_duration(name, start.elapsed());
        metrics.graveyard_object_count(name, entry.graveyard.len());
        metrics.delete_tracker_count(name, entry.delete_trackers.len());
        debug!(
            table = name,
            collected = doomed.len(),
            trackers_purged = closed.len(),
            low_watermark = ?low,
            "collected graveyard"
        );
        report.collected += doomed.len();
        report.trackers_purged += closed.len();
    }

    txn.commit();
    Ok(report)
}

/// Worker loop: wait for a trigger, collect, then sleep for the interval.
pub(crate) async fn run(db: Db, mut shutdown: watch::Receiver<bool>) {
    let interval = db.config().gc_interval();
    info!(handle = db.name(), "graveyard worker running");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = db.gc_triggered() => {}
        }

        let pass = db.clone();
        match tokio::task::spawn_blocking(move || pass.collect_graveyard()).await {
            Ok(Ok(report)) => {
                if report.remaining {
                    db.trigger_gc();
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "graveyard collection failed, will retry");
                db.trigger_gc();
            }
            Err(err) => {
                warn!(error = %err, "graveyard collection panicked, will retry");
                db.trigger_gc();
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(handle = db.name(), "graveyard worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::index::Index;
    use crate::key::{Key, KeySet};
    use crate::table::Table;
    use proptest::prelude::*;
    use serde::Serialize;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Serialize)]
    struct User {
        id: u64,
        name: String,
    }

    fn user(id: u64) -> User {
        User {
            id,
            name: format!("u{id}"),
        }
    }

    fn by_id() -> Index<User, u64> {
        Index::new("id", |u: &User| KeySet::single(u.id), |id: &u64| Key::from(*id))
    }

    fn setup(config: DbConfig) -> (Db, Table<User>) {
        let users = Table::new("users", by_id());
        let db = Db::new(config).unwrap();
        db.register_table(&users).unwrap();
        (db, users)
    }

    fn graveyard_len(db: &Db, users: &Table<User>) -> usize {
        db.read_txn().table_entry(users.meta()).unwrap().graveyard_len()
    }

    fn insert_then_delete(db: &Db, users: &Table<User>, ids: std::ops::Range<u64>) {
        let mut txn = db.write_txn(&[users]).unwrap();
        for id in ids.clone() {
            users.insert(&mut txn, user(id)).unwrap();
        }
        txn.commit();
        let mut txn = db.write_txn(&[users]).unwrap();
        for id in ids {
            users.delete(&mut txn, &user(id)).unwrap();
        }
        txn.commit();
    }

    #[test]
    fn without_trackers_everything_is_collected() {
        let (db, users) = setup(DbConfig::default());
        insert_then_delete(&db, &users, 0..5);
        assert_eq!(graveyard_len(&db, &users), 5);

        let report = db.collect_graveyard().unwrap();
        assert_eq!(report.collected, 5);
        assert!(!report.remaining);
        assert_eq!(graveyard_len(&db, &users), 0);

        // Nothing left to do.
        assert_eq!(db.collect_graveyard().unwrap(), GcReport::default());
    }

    #[test]
    fn one_pass_collects_every_table() {
        let (db, users) = setup(DbConfig::default());
        let admins = Table::new("admins", by_id());
        db.register_table(&admins).unwrap();
        insert_then_delete(&db, &users, 0..3);
        insert_then_delete(&db, &admins, 0..2);

        let report = db.collect_graveyard().unwrap();
        assert_eq!(report.tables, 2);
        assert_eq!(report.collected, 5);
        assert_eq!(graveyard_len(&db, &users), 0);
        assert_eq!(graveyard_len(&db, &admins), 0);
    }

    #[test]
    fn delete_track_collect_scenario() {
        let (db, users) = setup(DbConfig::default());
        let mut txn = db.write_txn(&[&users]).unwrap();
        let tracker = users.delete_tracker(&mut txn, "scenario").unwrap();
        users.insert(&mut txn, user(1)).unwrap();
        txn.commit();

        let mut txn = db.write_txn(&[&users]).unwrap();
        users.delete(&mut txn, &user(1)).unwrap();
        txn.commit();

        // The tracker is at watermark 0, so the tombstone survives.
        assert_eq!(db.collect_graveyard().unwrap().collected, 0);
        let (tombs, next) = tracker.process(&db.read_txn(), 100).unwrap();
        assert_eq!(tombs.len(), 1);
        assert_eq!(tombs[0].object.id, 1);

        tracker.mark(next);
        assert_eq!(db.collect_graveyard().unwrap().collected, 1);
        assert_eq!(graveyard_len(&db, &users), 0);
    }

    #[test]
    fn closed_trackers_are_purged() {
        let (db, users) = setup(DbConfig::default());
        let mut txn = db.write_txn(&[&users]).unwrap();
        let tracker = users.delete_tracker(&mut txn, "gone").unwrap();
        txn.commit();
        insert_then_delete(&db, &users, 0..3);

        drop(tracker);
        let report = db.collect_graveyard().unwrap();
        assert_eq!(report.trackers_purged, 1);
        assert_eq!(report.collected, 3);
        let rtxn = db.read_txn();
        assert_eq!(rtxn.table_entry(users.meta()).unwrap().info().delete_trackers, 0);
    }

    #[test]
    fn batch_limit_reports_remaining() {
        let (db, users) = setup(DbConfig {
            gc_batch_limit: 4,
            ..Default::default()
        });
        insert_then_delete(&db, &users, 0..10);

        let report = db.collect_graveyard().unwrap();
        assert_eq!(report.collected, 4);
        assert!(report.remaining);
        let report = db.collect_graveyard().unwrap();
        assert_eq!(report.collected, 4);
        let report = db.collect_graveyard().unwrap();
        assert_eq!(report.collected, 2);
        assert!(!report.remaining);
    }

    #[test]
    fn collection_records_metrics() {
        let (db, users) = setup(DbConfig::default());
        insert_then_delete(&db, &users, 0..2);
        db.collect_graveyard().unwrap();
        let snap = db.metrics().snapshot().unwrap();
        let stats = &snap.tables["users"];
        assert_eq!(stats.graveyard_objects, 0);
        assert_eq!(stats.graveyard_passes, 1);
        assert_eq!(stats.graveyard_low_watermark, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_collects_after_delete() {
        let (db, users) = setup(DbConfig {
            gc_interval_ms: 10,
            ..Default::default()
        });
        db.start().unwrap();
        insert_then_delete(&db, &users, 0..3);

        let deadline = Instant::now() + Duration::from_secs(5);
        while graveyard_len(&db, &users) > 0 {
            assert!(Instant::now() < deadline, "worker did not collect");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        db.stop().await.unwrap();
    }

    proptest! {
        #[test]
        fn tombstones_at_or_above_watermark_survive(
            deletes in 1u64..40,
            watermark in 0u64..90,
        ) {
            let (db, users) = setup(DbConfig::default());
            let mut txn = db.write_txn(&[&users]).unwrap();
            let tracker = users.delete_tracker(&mut txn, "prop").unwrap();
            txn.commit();
            insert_then_delete(&db, &users, 0..deletes);

            tracker.mark(watermark);
            db.collect_graveyard().unwrap();

            let rtxn = db.read_txn();
            let entry = rtxn.table_entry(users.meta()).unwrap();
            let survivors: Vec<u64> = entry.graveyard.iter().map(|(_, t)| t.revision).collect();
            // Deletions occupy revisions deletes+1 ..= 2*deletes.
            let expected: Vec<u64> = (deletes + 1..=2 * deletes).filter(|&r| r >= watermark).collect();
            prop_assert_eq!(survivors, expected);
        }
    }
}
