//! Batch runs.
//!
//! A batch is a deferred cycle executed against a named snapshot that is
//! populated, sealed and then persisted together with the results so the run
//! can be audited or reproduced later.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use lattice_traits::{
    BatchId, BatchPersistence, BatchResultRecord, DataValue, MarketDataKey, SnapshotId,
    TraitError, ViewProcessId,
};

use crate::cycle::{CycleFailure, ViewCycle};
use crate::definition::{ViewCycleExecutionOptions, ViewDefinition};
use crate::error::{EngineError, EngineResult};
use crate::executor::DependencyGraphExecutor;
use crate::graph::GraphCompiler;
use crate::snapshot::{Snapshot, SnapshotState};

// =============================================================================
// BATCH RUNS
// =============================================================================

/// Request to run a batch against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobRun {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Snapshot the batch runs against
    pub snapshot_id: SnapshotId,
    /// Valuation time the cycle uses
    pub valuation_time: DateTime<Utc>,
}

impl BatchJobRun {
    /// Run valued now.
    pub fn new(batch_id: BatchId, snapshot_id: SnapshotId) -> Self {
        Self {
            batch_id,
            snapshot_id,
            valuation_time: Utc::now(),
        }
    }

    /// Set the valuation time.
    pub fn with_valuation_time(mut self, valuation_time: DateTime<Utc>) -> Self {
        self.valuation_time = valuation_time;
        self
    }
}

/// Bookkeeping status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Started, not yet ended
    Running,
    /// Ended and persisted
    Ended,
}

#[derive(Debug)]
struct BatchRun {
    run: BatchJobRun,
    attempt: u32,
    status: BatchStatus,
    // Set while `end_batch` awaits persistence.
    ending: bool,
    started_at: DateTime<Utc>,
    cycle: Option<Arc<ViewCycle>>,
}

/// In-memory batch bookkeeping over named snapshots.
pub struct BatchRunManager {
    compiler: Arc<GraphCompiler>,
    executor: Arc<dyn DependencyGraphExecutor>,
    persistence: Arc<dyn BatchPersistence>,
    snapshots: DashMap<SnapshotId, Arc<Snapshot>>,
    batches: DashMap<BatchId, BatchRun>,
}

impl BatchRunManager {
    /// Create a manager.
    pub fn new(
        compiler: Arc<GraphCompiler>,
        executor: Arc<dyn DependencyGraphExecutor>,
        persistence: Arc<dyn BatchPersistence>,
    ) -> Self {
        Self {
            compiler,
            executor,
            persistence,
            snapshots: DashMap::new(),
            batches: DashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Batch bookkeeping
    // -------------------------------------------------------------------------

    /// Start a batch, or restart an ended one. Returns the attempt number.
    pub fn start_batch(&self, run: BatchJobRun) -> EngineResult<u32> {
        let batch_id = run.batch_id.clone();
        let attempt = match self.batches.entry(batch_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if existing.status == BatchStatus::Running {
                    return Err(EngineError::InvalidStateTransition {
                        from: "RUNNING".into(),
                        to: "RUNNING".into(),
                    });
                }
                existing.attempt += 1;
                existing.status = BatchStatus::Running;
                existing.started_at = Utc::now();
                existing.cycle = None;
                existing.run = run;
                existing.attempt
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(BatchRun {
                    run,
                    attempt: 1,
                    status: BatchStatus::Running,
                    ending: false,
                    started_at: Utc::now(),
                    cycle: None,
                });
                1
            }
        };
        info!(batch = %batch_id, attempt, "Batch started");
        Ok(attempt)
    }

    /// Status of a batch.
    pub fn batch_status(&self, batch_id: &BatchId) -> EngineResult<BatchStatus> {
        self.batches
            .get(batch_id)
            .map(|b| b.status)
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.clone()))
    }

    /// Current attempt of a batch.
    pub fn batch_attempt(&self, batch_id: &BatchId) -> EngineResult<u32> {
        self.batches
            .get(batch_id)
            .map(|b| b.attempt)
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.clone()))
    }

    /// Cycle run by the current attempt, if any.
    pub fn batch_cycle(&self, batch_id: &BatchId) -> EngineResult<Option<Arc<ViewCycle>>> {
        self.batches
            .get(batch_id)
            .map(|b| b.cycle.clone())
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.clone()))
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Open a snapshot. An existing snapshot is returned unchanged.
    pub fn create_snapshot(&self, snapshot_id: SnapshotId) -> Arc<Snapshot> {
        self.snapshots
            .entry(snapshot_id.clone())
            .or_insert_with(|| {
                debug!(snapshot = %snapshot_id, "Snapshot created");
                Arc::new(Snapshot::new(snapshot_id.clone()))
            })
            .clone()
    }

    /// Look up a snapshot.
    pub fn snapshot(&self, snapshot_id: &SnapshotId) -> EngineResult<Arc<Snapshot>> {
        self.snapshots
            .get(snapshot_id)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::SnapshotNotFound(snapshot_id.clone()))
    }

    /// Record the as-of time of a snapshot.
    pub fn fix_snapshot_time(&self, snapshot_id: &SnapshotId, as_of: DateTime<Utc>) -> EngineResult<()> {
        self.snapshot(snapshot_id)?.fix_time(as_of)
    }

    /// Add values to a snapshot.
    pub fn add_values_to_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        values: impl IntoIterator<Item = (MarketDataKey, DataValue)>,
    ) -> EngineResult<()> {
        self.snapshot(snapshot_id)?.add_values(values)
    }

    /// Seal a snapshot.
    pub fn mark_snapshot_complete(&self, snapshot_id: &SnapshotId) -> EngineResult<()> {
        self.snapshot(snapshot_id)?.mark_complete()
    }

    /// Values recorded so far.
    pub fn get_snapshot_values(
        &self,
        snapshot_id: &SnapshotId,
    ) -> EngineResult<BTreeMap<MarketDataKey, DataValue>> {
        Ok(self.snapshot(snapshot_id)?.values())
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run one cycle of `definition` against the batch's snapshot.
    ///
    /// A snapshot that has not reached `Complete`, or a definition that does
    /// not compile, yields a cycle in `ExecutionFailed`.
    pub fn run_batch(&self, batch_id: &BatchId, definition: &ViewDefinition) -> EngineResult<Arc<ViewCycle>> {
        let run = {
            let batch = self
                .batches
                .get(batch_id)
                .ok_or_else(|| EngineError::BatchNotFound(batch_id.clone()))?;
            if batch.status == BatchStatus::Ended {
                return Err(EngineError::InvalidStateTransition {
                    from: "ENDED".into(),
                    to: "RUNNING".into(),
                });
            }
            batch.run.clone()
        };
        let snapshot = self.snapshot(&run.snapshot_id)?;

        let cycle = Arc::new(ViewCycle::new(
            ViewProcessId::new(format!("Batch~{}", batch_id)),
            ViewCycleExecutionOptions::at(run.valuation_time),
            definition.result_model,
        ));

        if snapshot.state() < SnapshotState::Complete {
            cycle.fail(CycleFailure::NoSnapshot(format!(
                "snapshot {} is {:?}",
                snapshot.id(),
                snapshot.state()
            )))?;
        } else {
            match self.compiler.compile(definition, snapshot.as_ref()) {
                Ok(graph) => {
                    cycle.execute(self.executor.as_ref(), snapshot, graph)?;
                }
                Err(e) => cycle.fail(CycleFailure::Compilation(e.to_string()))?,
            }
        }

        if let Some(mut batch) = self.batches.get_mut(batch_id) {
            batch.cycle = Some(cycle.clone());
        }
        info!(batch = %batch_id, cycle = %cycle.id(), state = %cycle.state(), "Batch cycle run");
        Ok(cycle)
    }

    /// End a batch and persist its snapshot and results.
    ///
    /// Fails if the batch's snapshot is not sealed, or if the batch has
    /// already ended or is ending. A failed save leaves the batch running so
    /// it can be ended again.
    pub async fn end_batch(&self, batch_id: &BatchId) -> EngineResult<BatchResultRecord> {
        let (run, attempt, started_at, cycle, snapshot) = {
            let mut batch = self
                .batches
                .get_mut(batch_id)
                .ok_or_else(|| EngineError::BatchNotFound(batch_id.clone()))?;
            if batch.status == BatchStatus::Ended || batch.ending {
                let from = if batch.ending { "ENDING" } else { "ENDED" };
                return Err(EngineError::InvalidStateTransition {
                    from: from.into(),
                    to: "ENDED".into(),
                });
            }

            let snapshot = self.snapshot(&batch.run.snapshot_id)?;
            if !snapshot.is_sealed() {
                return Err(EngineError::InvalidSnapshotState {
                    snapshot: batch.run.snapshot_id.clone(),
                    message: "batch cannot end before its snapshot is sealed".into(),
                });
            }
            batch.ending = true;
            (
                batch.run.clone(),
                batch.attempt,
                batch.started_at,
                batch.cycle.clone(),
                snapshot,
            )
        };

        let model = cycle.as_ref().and_then(|c| c.result_model());
        let record = BatchResultRecord {
            batch_id: batch_id.clone(),
            attempt,
            snapshot_id: run.snapshot_id.clone(),
            cycle_id: cycle.as_ref().map(|c| c.id().clone()),
            snapshot_values: snapshot.values().into_iter().collect(),
            results: model
                .as_ref()
                .map(|m| m.all_values().cloned().collect())
                .unwrap_or_default(),
            failures: model
                .as_ref()
                .map(|m| {
                    m.failures()
                        .iter()
                        .map(|(spec, reason)| (spec.clone(), reason.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            started_at,
            ended_at: Utc::now(),
        };

        let saved = self.persistence.save_batch_result(record.clone()).await;
        if let Some(mut batch) = self.batches.get_mut(batch_id) {
            batch.ending = false;
            if saved.is_ok() {
                batch.status = BatchStatus::Ended;
            }
        }
        saved?;
        info!(
            batch = %batch_id,
            attempt,
            results = record.results.len(),
            failures = record.failures.len(),
            "Batch ended"
        );
        Ok(record)
    }
}

impl std::fmt::Debug for BatchRunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunManager")
            .field("snapshots", &self.snapshots.len())
            .field("batches", &self.batches.len())
            .finish()
    }
}

// =============================================================================
// IN-MEMORY PERSISTENCE
// =============================================================================

/// Keeps the latest record of every batch in memory.
#[derive(Debug, Default)]
pub struct InMemoryBatchPersistence {
    records: RwLock<HashMap<BatchId, BatchResultRecord>>,
}

impl InMemoryBatchPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored batches.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if nothing was stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl BatchPersistence for InMemoryBatchPersistence {
    async fn save_batch_result(&self, record: BatchResultRecord) -> Result<(), TraitError> {
        self.records.write().insert(record.batch_id.clone(), record);
        Ok(())
    }

    async fn load_batch_result(
        &self,
        batch_id: &BatchId,
    ) -> Result<Option<BatchResultRecord>, TraitError> {
        Ok(self.records.read().get(batch_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lattice_traits::{ComputationTarget, ComputationTargetKind};

    use crate::cycle::ViewCycleState;
    use crate::executor::SingleThreadedExecutor;
    use crate::function::{FnCalculationFunction, FunctionRepository};

    struct FailingPersistence;

    #[async_trait]
    impl BatchPersistence for FailingPersistence {
        async fn save_batch_result(&self, _record: BatchResultRecord) -> Result<(), TraitError> {
            Err(TraitError::PersistenceError("disk full".into()))
        }

        async fn load_batch_result(
            &self,
            _batch_id: &BatchId,
        ) -> Result<Option<BatchResultRecord>, TraitError> {
            Ok(None)
        }
    }

    fn manager(persistence: Arc<dyn BatchPersistence>) -> BatchRunManager {
        let repo = FunctionRepository::new()
            .with_function(
                FnCalculationFunction::new("pv", [ComputationTargetKind::Position], ["PV"])
                    .with_inputs(["Price"])
                    .with_value_fn(|_, inputs, _| {
                        Ok(DataValue::Float(inputs.f64_by_name("Price")? * 2.0))
                    }),
            )
            .unwrap();
        BatchRunManager::new(
            Arc::new(GraphCompiler::new(Arc::new(repo), 4)),
            Arc::new(SingleThreadedExecutor::new()),
            persistence,
        )
    }

    fn snapshot_id() -> SnapshotId {
        SnapshotId::new(NaiveDate::from_ymd_opt(2024, 3, 28).unwrap(), "LDN_CLOSE")
    }

    fn price(id: &str) -> MarketDataKey {
        MarketDataKey::new(ComputationTarget::position(id), "Price")
    }

    fn definition() -> ViewDefinition {
        ViewDefinition::new("eod")
            .with_targets([ComputationTarget::position("A"), ComputationTarget::position("B")])
            .requesting("PV")
    }

    #[test]
    fn test_create_snapshot_is_idempotent() {
        let manager = manager(Arc::new(InMemoryBatchPersistence::new()));
        let first = manager.create_snapshot(snapshot_id());
        first.add_value(price("A"), DataValue::Float(1.0)).unwrap();
        let second = manager.create_snapshot(snapshot_id());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.get_snapshot_values(&snapshot_id()).unwrap().len(), 1);
    }

    #[test]
    fn test_sealed_snapshot_rejects_values() {
        let manager = manager(Arc::new(InMemoryBatchPersistence::new()));
        let id = snapshot_id();
        manager.create_snapshot(id.clone());
        manager
            .add_values_to_snapshot(&id, [(price("A"), DataValue::Float(1.0))])
            .unwrap();
        manager
            .add_values_to_snapshot(&id, [(price("B"), DataValue::Float(2.0))])
            .unwrap();
        assert_eq!(manager.get_snapshot_values(&id).unwrap().len(), 2);

        manager.mark_snapshot_complete(&id).unwrap();
        assert!(matches!(
            manager.add_values_to_snapshot(&id, [(price("C"), DataValue::Float(3.0))]),
            Err(EngineError::SnapshotSealed(_))
        ));
        assert!(manager.mark_snapshot_complete(&id).is_err());
        assert!(matches!(
            manager.fix_snapshot_time(&snapshot_id(), Utc::now()),
            Err(EngineError::InvalidSnapshotState { .. })
        ));
    }

    #[test]
    fn test_unknown_snapshot() {
        let manager = manager(Arc::new(InMemoryBatchPersistence::new()));
        assert!(matches!(
            manager.get_snapshot_values(&snapshot_id()),
            Err(EngineError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_full_batch_lifecycle() {
        let store = Arc::new(InMemoryBatchPersistence::new());
        let manager = manager(store.clone());
        let batch_id = BatchId::new("EOD-1");
        let id = snapshot_id();

        assert_eq!(manager.start_batch(BatchJobRun::new(batch_id.clone(), id.clone())).unwrap(), 1);
        manager.create_snapshot(id.clone());
        manager
            .add_values_to_snapshot(
                &id,
                [
                    (price("A"), DataValue::Float(10.0)),
                    (price("B"), DataValue::Float(20.0)),
                ],
            )
            .unwrap();
        manager.fix_snapshot_time(&id, Utc::now()).unwrap();
        manager.mark_snapshot_complete(&id).unwrap();

        let cycle = manager.run_batch(&batch_id, &definition()).unwrap();
        assert_eq!(cycle.state(), ViewCycleState::Executed);

        let record = manager.end_batch(&batch_id).await.unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(record.results.len(), 2);
        assert_eq!(record.snapshot_values.len(), 2);
        assert_eq!(record.cycle_id.as_ref(), Some(cycle.id()));
        assert_eq!(manager.batch_status(&batch_id).unwrap(), BatchStatus::Ended);

        let loaded = store.load_batch_result(&batch_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);

        assert_eq!(manager.start_batch(BatchJobRun::new(batch_id.clone(), id)).unwrap(), 2);
        assert!(manager.batch_cycle(&batch_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ended_batch_cannot_end_again() {
        let store = Arc::new(InMemoryBatchPersistence::new());
        let manager = manager(store.clone());
        let batch_id = BatchId::new("EOD-4");
        let id = snapshot_id();

        manager.start_batch(BatchJobRun::new(batch_id.clone(), id.clone())).unwrap();
        manager.create_snapshot(id.clone());
        manager
            .add_values_to_snapshot(
                &id,
                [
                    (price("A"), DataValue::Float(10.0)),
                    (price("B"), DataValue::Float(20.0)),
                ],
            )
            .unwrap();
        manager.mark_snapshot_complete(&id).unwrap();
        manager.run_batch(&batch_id, &definition()).unwrap();

        let first = manager.end_batch(&batch_id).await.unwrap();
        assert!(matches!(
            manager.end_batch(&batch_id).await,
            Err(EngineError::InvalidStateTransition { .. })
        ));

        let stored = store.load_batch_result(&batch_id).await.unwrap().unwrap();
        assert_eq!(stored.ended_at, first.ended_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_end_requires_sealed_snapshot() {
        let manager = manager(Arc::new(InMemoryBatchPersistence::new()));
        let batch_id = BatchId::new("EOD-2");
        manager.start_batch(BatchJobRun::new(batch_id.clone(), snapshot_id())).unwrap();
        manager.create_snapshot(snapshot_id());

        let cycle = manager.run_batch(&batch_id, &definition()).unwrap();
        assert!(matches!(cycle.failure(), Some(CycleFailure::NoSnapshot(_))));

        assert!(matches!(
            manager.end_batch(&batch_id).await,
            Err(EngineError::InvalidSnapshotState { .. })
        ));
        assert_eq!(manager.batch_status(&batch_id).unwrap(), BatchStatus::Running);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_batch_running() {
        let manager = manager(Arc::new(FailingPersistence));
        let batch_id = BatchId::new("EOD-3");
        manager.start_batch(BatchJobRun::new(batch_id.clone(), snapshot_id())).unwrap();
        manager.create_snapshot(snapshot_id());
        manager.mark_snapshot_complete(&snapshot_id()).unwrap();

        assert!(matches!(
            manager.end_batch(&batch_id).await,
            Err(EngineError::Persistence(_))
        ));
        assert_eq!(manager.batch_status(&batch_id).unwrap(), BatchStatus::Running);
        assert!(matches!(
            manager.end_batch(&batch_id).await,
            Err(EngineError::Persistence(_))
        ));
        assert!(manager
            .start_batch(BatchJobRun::new(batch_id, snapshot_id()))
            .is_err());
    }
}
