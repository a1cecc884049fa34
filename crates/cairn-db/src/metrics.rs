//! Database metrics.
//!
//! Every sink except [`NoopMetrics`] publishes through the `metrics` facade,
//! so whatever recorder the process installs (Prometheus exporter, test
//! recorder) receives the data. Names follow `cairn_{subsystem}_{name}_{unit}`
//! and carry `handle` and/or `table` labels.

use std::collections::BTreeMap;
use std::time::Duration;

use ::metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;

use crate::object::Revision;

// =============================================================================
// Metric Names
// =============================================================================

const TABLE_LOCK_WAIT: &str = "cairn_write_txn_table_lock_wait_seconds";
const TOTAL_LOCK_WAIT: &str = "cairn_write_txn_lock_wait_seconds";
const WRITE_TXNS_TOTAL: &str = "cairn_write_txns_total";
const WRITE_TXN_HELD: &str = "cairn_write_txn_held_seconds";
const GRAVEYARD_LOW_WATERMARK: &str = "cairn_graveyard_low_watermark";
const GRAVEYARD_CLEANING: &str = "cairn_graveyard_cleaning_seconds";
const GRAVEYARD_OBJECTS: &str = "cairn_graveyard_objects";
const TABLE_OBJECTS: &str = "cairn_table_objects";
const TABLE_REVISION: &str = "cairn_table_revision";
const DELETE_TRACKERS: &str = "cairn_delete_trackers";

/// Sink for database metrics.
///
/// Only lock acquisition has to be recorded; everything else defaults to a
/// no-op. `handle` is the name of the [`Db`](crate::Db) handle that ran the
/// transaction.
pub trait Metrics: Send + Sync {
    /// Time spent waiting for one table's lock.
    fn write_txn_table_acquisition(&self, handle: &str, table: &str, wait: Duration);

    /// Time spent acquiring every lock of a write transaction.
    fn write_txn_total_acquisition(&self, handle: &str, tables: &[&str], wait: Duration);

    /// Time a write transaction held its locks.
    fn write_txn_duration(&self, _handle: &str, _tables: &[&str], _held: Duration) {}

    fn graveyard_low_watermark(&self, _table: &str, _watermark: Revision) {}

    fn graveyard_cleaning_duration(&self, _table: &str, _took: Duration) {}

    fn graveyard_object_count(&self, _table: &str, _count: usize) {}

    fn object_count(&self, _table: &str, _count: usize) {}

    fn revision(&self, _table: &str, _revision: Revision) {}

    fn delete_tracker_count(&self, _table: &str, _count: usize) {}

    /// Current values, for sinks that keep them.
    fn snapshot(&self) -> Option<MetricsSnapshot> {
        None
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn write_txn_table_acquisition(&self, _: &str, _: &str, _: Duration) {}

    fn write_txn_total_acquisition(&self, _: &str, _: &[&str], _: Duration) {}
}

/// Publishes to the installed `metrics` recorder and keeps nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecorderMetrics;

impl Metrics for RecorderMetrics {
    fn write_txn_table_acquisition(&self, handle: &str, table: &str, wait: Duration) {
        histogram!(TABLE_LOCK_WAIT, "handle" => handle.to_string(), "table" => table.to_string())
            .record(wait.as_secs_f64());
    }

    fn write_txn_total_acquisition(&self, handle: &str, _tables: &[&str], wait: Duration) {
        counter!(WRITE_TXNS_TOTAL, "handle" => handle.to_string()).increment(1);
        histogram!(TOTAL_LOCK_WAIT, "handle" => handle.to_string()).record(wait.as_secs_f64());
    }

    fn write_txn_duration(&self, handle: &str, _tables: &[&str], held: Duration) {
        histogram!(WRITE_TXN_HELD, "handle" => handle.to_string()).record(held.as_secs_f64());
    }

    fn graveyard_low_watermark(&self, table: &str, watermark: Revision) {
        gauge!(GRAVEYARD_LOW_WATERMARK, "table" => table.to_string()).set(watermark as f64);
    }

    fn graveyard_cleaning_duration(&self, table: &str, took: Duration) {
        histogram!(GRAVEYARD_CLEANING, "table" => table.to_string()).record(took.as_secs_f64());
    }

    fn graveyard_object_count(&self, table: &str, count: usize) {
        gauge!(GRAVEYARD_OBJECTS, "table" => table.to_string()).set(count as f64);
    }

    fn object_count(&self, table: &str, count: usize) {
        gauge!(TABLE_OBJECTS, "table" => table.to_string()).set(count as f64);
    }

    fn revision(&self, table: &str, revision: Revision) {
        gauge!(TABLE_REVISION, "table" => table.to_string()).set(revision as f64);
    }

    fn delete_tracker_count(&self, table: &str, count: usize) {
        gauge!(DELETE_TRACKERS, "table" => table.to_string()).set(count as f64);
    }
}

/// The default sink: publishes like [`RecorderMetrics`] and also keeps a
/// [`MetricsSnapshot`] for introspection.
#[derive(Debug, Default)]
pub struct LocalMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl LocalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: &str, f: impl FnOnce(&mut TableStats)) {
        let mut inner = self.inner.lock();
        f(inner.tables.entry(table.to_string()).or_default());
    }

    fn handle(&self, handle: &str, f: impl FnOnce(&mut HandleStats)) {
        let mut inner = self.inner.lock();
        f(inner.handles.entry(handle.to_string()).or_default());
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl Metrics for LocalMetrics {
    fn write_txn_table_acquisition(&self, handle: &str, table: &str, wait: Duration) {
        RecorderMetrics.write_txn_table_acquisition(handle, table, wait);
        self.table(table, |t| {
            t.lock_acquisitions += 1;
            t.lock_wait_us += micros(wait);
            t.lock_wait_max_us = t.lock_wait_max_us.max(micros(wait));
        });
    }

    fn write_txn_total_acquisition(&self, handle: &str, tables: &[&str], wait: Duration) {
        RecorderMetrics.write_txn_total_acquisition(handle, tables, wait);
        self.handle(handle, |h| {
            h.write_txns += 1;
            h.acquisition_us += micros(wait);
        });
    }

    fn write_txn_duration(&self, handle: &str, tables: &[&str], held: Duration) {
        RecorderMetrics.write_txn_duration(handle, tables, held);
        self.handle(handle, |h| {
            h.held_us += micros(held);
            h.held_max_us = h.held_max_us.max(micros(held));
        });
    }

    fn graveyard_low_watermark(&self, table: &str, watermark: Revision) {
        RecorderMetrics.graveyard_low_watermark(table, watermark);
        self.table(table, |t| t.graveyard_low_watermark = watermark);
    }

    fn graveyard_cleaning_duration(&self, table: &str, took: Duration) {
        RecorderMetrics.graveyard_cleaning_duration(table, took);
        self.table(table, |t| {
            t.graveyard_passes += 1;
            t.graveyard_cleaning_us += micros(took);
        });
    }

    fn graveyard_object_count(&self, table: &str, count: usize) {
        RecorderMetrics.graveyard_object_count(table, count);
        self.table(table, |t| t.graveyard_objects = count);
    }

    fn object_count(&self, table: &str, count: usize) {
        RecorderMetrics.object_count(table, count);
        self.table(table, |t| t.objects = count);
    }

    fn revision(&self, table: &str, revision: Revision) {
        RecorderMetrics.revision(table, revision);
        self.table(table, |t| t.revision = revision);
    }

    fn delete_tracker_count(&self, table: &str, count: usize) {
        RecorderMetrics.delete_tracker_count(table, count);
        self.table(table, |t| t.delete_trackers = count);
    }

    fn snapshot(&self) -> Option<MetricsSnapshot> {
        Some(self.inner.lock().clone())
    }
}

/// Point-in-time copy of [`LocalMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tables: BTreeMap<String, TableStats>,
    pub handles: BTreeMap<String, HandleStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub lock_acquisitions: u64,
    pub lock_wait_us: u64,
    pub lock_wait_max_us: u64,
    pub objects: usize,
    pub revision: Revision,
    pub graveyard_objects: usize,
    pub graveyard_low_watermark: Revision,
    pub graveyard_passes: u64,
    pub graveyard_cleaning_us: u64,
    pub delete_trackers: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HandleStats {
    pub write_txns: u64,
    pub acquisition_us: u64,
    pub held_us: u64,
    pub held_max_us: u64,
}

#[cfg(test)]
mod tests {
    use ::metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};

    use super::*;

    #[test]
    fn noop_has_no_snapshot() {
        let m = NoopMetrics;
        m.write_txn_table_acquisition("db", "users", Duration::from_millis(1));
        m.object_count("users", 3);
        assert!(m.snapshot().is_none());
    }

    #[test]
    fn local_metrics_aggregate() {
        let m = LocalMetrics::new();
        m.write_txn_table_acquisition("db", "users", Duration::from_micros(10));
        m.write_txn_table_acquisition("api", "users", Duration::from_micros(30));
        m.write_txn_total_acquisition("db", &["users"], Duration::from_micros(12));
        m.write_txn_duration("db", &["users"], Duration::from_micros(100));
        m.object_count("users", 7);
        m.revision("users", 9);

        let snap = m.snapshot().unwrap();
        let users = &snap.tables["users"];
        assert_eq!(users.lock_acquisitions, 2);
        assert_eq!(users.lock_wait_us, 40);
        assert_eq!(users.lock_wait_max_us, 30);
        assert_eq!(users.objects, 7);
        assert_eq!(users.revision, 9);

        let db = &snap.handles["db"];
        assert_eq!(db.write_txns, 1);
        assert_eq!(db.held_max_us, 100);
        assert!(!snap.handles.contains_key("api"));
    }

    /// Records the name and labels of every metric registered through it.
    #[derive(Default)]
    struct CaptureRecorder {
        seen: Mutex<Vec<String>>,
    }

    impl CaptureRecorder {
        fn capture(&self, key: &Key) {
            let labels: Vec<String> = key
                .labels()
                .map(|l| format!("{}={}", l.key(), l.value()))
                .collect();
            self.seen
                .lock()
                .push(format!("{}{{{}}}", key.name(), labels.join(",")));
        }
    }

    impl Recorder for CaptureRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            self.capture(key);
            Counter::noop()
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            self.capture(key);
            Gauge::noop()
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            self.capture(key);
            Histogram::noop()
        }
    }

    #[test]
    fn local_metrics_publish_with_labels() {
        let recorder = CaptureRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            let m = LocalMetrics::new();
            m.write_txn_table_acquisition("api", "users", Duration::from_micros(5));
            m.write_txn_total_acquisition("api", &["users"], Duration::from_micros(5));
            m.object_count("users", 3);
            m.graveyard_low_watermark("users", 4);
        });
        let seen = recorder.seen.lock().clone();
        assert!(seen.contains(&format!("{TABLE_LOCK_WAIT}{{handle=api,table=users}}")));
        assert!(seen.contains(&format!("{WRITE_TXNS_TOTAL}{{handle=api}}")));
        assert!(seen.contains(&format!("{TABLE_OBJECTS}{{table=users}}")));
        assert!(seen.contains(&format!("{GRAVEYARD_LOW_WATERMARK}{{table=users}}")));
    }

    #[test]
    fn recorder_metrics_keep_no_snapshot() {
        let recorder = CaptureRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            RecorderMetrics.revision("users", 2);
            assert!(RecorderMetrics.snapshot().is_none());
        });
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn metrics_dont_panic_without_recorder() {
        RecorderMetrics.write_txn_duration("db", &["users"], Duration::from_millis(1));
        RecorderMetrics.delete_tracker_count("users", 1);
    }

    #[test]
    fn snapshot_serializes() {
        let m = LocalMetrics::new();
        m.graveyard_object_count("users", 2);
        let json = serde_json::to_value(m.snapshot().unwrap()).unwrap();
        assert_eq!(json["tables"]["users"]["graveyard_objects"], 2);
    }
}
