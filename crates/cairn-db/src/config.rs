use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Database tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Minimum pause between graveyard collection passes.
    pub gc_interval_ms: u64,
    /// Maximum tombstones removed per pass; a pass that hits the limit
    /// schedules another.
    pub gc_batch_limit: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: 1000,
            gc_batch_limit: 5000,
        }
    }
}

impl DbConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.gc_interval_ms == 0 {
            return Err(DbError::Config("gc_interval_ms must be positive".into()));
        }
        if self.gc_batch_limit == 0 {
            return Err(DbError::Config("gc_batch_limit must be positive".into()));
        }
        Ok(())
    }
}
