//! Batch result persistence.
//!
//! When a batch run ends, the sealed snapshot it ran against and the results
//! it produced are handed to a [`BatchPersistence`] store for later audit and
//! reproduction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TraitError;
use crate::ids::{BatchId, SnapshotId, ViewCycleId};
use crate::value::{ComputedValue, DataValue, MarketDataKey, ValueSpecification};

/// Everything recorded for one ended batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResultRecord {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Attempt number (1 for the first run, bumped on restart)
    pub attempt: u32,
    /// Snapshot the batch ran against
    pub snapshot_id: SnapshotId,
    /// Cycle that produced the results, if one was run
    pub cycle_id: Option<ViewCycleId>,
    /// Snapshot contents at sealing
    pub snapshot_values: Vec<(MarketDataKey, DataValue)>,
    /// Published results
    pub results: Vec<ComputedValue>,
    /// Per-specification failures, rendered
    pub failures: Vec<(ValueSpecification, String)>,
    /// When the batch (attempt) started
    pub started_at: DateTime<Utc>,
    /// When the batch ended
    pub ended_at: DateTime<Utc>,
}

/// Store for ended batch runs.
#[async_trait]
pub trait BatchPersistence: Send + Sync {
    /// Persist a batch record. A later attempt replaces an earlier one.
    async fn save_batch_result(&self, record: BatchResultRecord) -> Result<(), TraitError>;

    /// Load the latest record for a batch.
    async fn load_batch_result(
        &self,
        batch_id: &BatchId,
    ) -> Result<Option<BatchResultRecord>, TraitError>;
}
