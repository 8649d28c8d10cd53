//! View cycles.
//!
//! A cycle is one execution of a compiled graph against one snapshot. Its
//! state only moves forward:
//!
//! ```text
//! AwaitingExecution -> Executing -> Executed
//!         |                |
//!         +----------------+-----> ExecutionFailed
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use lattice_traits::{
    ComputationTarget, ComputedValue, SnapshotId, ValueSpecification, ViewCycleId, ViewProcessId,
};

use crate::cache::ComputationCache;
use crate::definition::{ResultModelDefinition, ViewCycleExecutionOptions};
use crate::error::{EngineError, EngineResult};
use crate::executor::{DependencyGraphExecutor, ExecutionControl, ExecutionOutcome, ExecutionStatistics};
use crate::graph::DependencyGraph;
use crate::result::ResultModel;
use crate::snapshot::Snapshot;

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle state of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewCycleState {
    /// Created, not yet dispatched
    AwaitingExecution,
    /// Running
    Executing,
    /// Executor returned, possibly with node failures
    Executed,
    /// Structural failure or cancellation
    ExecutionFailed,
}

impl ViewCycleState {
    /// Returns true for `Executed` and `ExecutionFailed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::ExecutionFailed)
    }

    /// Uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingExecution => "AWAITING_EXECUTION",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
        }
    }

    fn can_move_to(&self, to: ViewCycleState) -> bool {
        matches!(
            (self, to),
            (Self::AwaitingExecution, Self::Executing)
                | (Self::AwaitingExecution, Self::ExecutionFailed)
                | (Self::Executing, Self::Executed)
                | (Self::Executing, Self::ExecutionFailed)
        )
    }
}

impl fmt::Display for ViewCycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cycle ended in `ExecutionFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleFailure {
    /// No usable snapshot
    NoSnapshot(String),
    /// Graph compilation failed
    Compilation(String),
    /// Other structural failure
    Structural(String),
    /// Cancelled while awaiting or during execution
    Cancelled,
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSnapshot(m) => write!(f, "no snapshot: {}", m),
            Self::Compilation(m) => write!(f, "compilation failed: {}", m),
            Self::Structural(m) => write!(f, "structural failure: {}", m),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

// =============================================================================
// VIEW CYCLE
// =============================================================================

#[derive(Default)]
struct CycleInner {
    failure: Option<CycleFailure>,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    snapshot: Option<Arc<Snapshot>>,
    graph: Option<Arc<DependencyGraph>>,
    cache: Option<Arc<ComputationCache>>,
    result: Option<Arc<ResultModel>>,
    statistics: Option<ExecutionStatistics>,
}

/// One execution of a view.
pub struct ViewCycle {
    id: ViewCycleId,
    process_id: ViewProcessId,
    options: ViewCycleExecutionOptions,
    result_definition: ResultModelDefinition,
    control: ExecutionControl,
    state: RwLock<ViewCycleState>,
    inner: RwLock<CycleInner>,
}

impl ViewCycle {
    /// New cycle awaiting execution.
    pub fn new(
        process_id: ViewProcessId,
        options: ViewCycleExecutionOptions,
        result_definition: ResultModelDefinition,
    ) -> Self {
        Self {
            id: ViewCycleId::generate(),
            process_id,
            options,
            result_definition,
            control: ExecutionControl::new(),
            state: RwLock::new(ViewCycleState::AwaitingExecution),
            inner: RwLock::new(CycleInner::default()),
        }
    }

    /// Unique id.
    pub fn id(&self) -> &ViewCycleId {
        &self.id
    }

    /// Owning process.
    pub fn process_id(&self) -> &ViewProcessId {
        &self.process_id
    }

    /// Current state.
    pub fn state(&self) -> ViewCycleState {
        *self.state.read()
    }

    /// Failure reason once `ExecutionFailed`.
    pub fn failure(&self) -> Option<CycleFailure> {
        self.inner.read().failure.clone()
    }

    /// Time spent executing: running while `Executing`, final once terminal,
    /// `None` before execution started.
    pub fn duration(&self) -> Option<Duration> {
        let inner = self.inner.read();
        inner
            .duration
            .or_else(|| inner.started.map(|s| s.elapsed()))
    }

    /// Wall-clock start of execution.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().started_at
    }

    /// Valuation time.
    pub fn valuation_time(&self) -> DateTime<Utc> {
        self.options.valuation_time
    }

    /// Cycle time options.
    pub fn execution_options(&self) -> &ViewCycleExecutionOptions {
        &self.options
    }

    /// Compiled graph, once dispatched.
    pub fn graph(&self) -> Option<Arc<DependencyGraph>> {
        self.inner.read().graph.clone()
    }

    /// Snapshot identifier, once dispatched.
    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.inner.read().snapshot.as_ref().map(|s| s.id().clone())
    }

    /// Result model, once `Executed`.
    pub fn result_model(&self) -> Option<Arc<ResultModel>> {
        self.inner.read().result.clone()
    }

    /// Execution counters, once the executor returned.
    pub fn statistics(&self) -> Option<ExecutionStatistics> {
        self.inner.read().statistics
    }

    /// Cancellation handle passed to the executor.
    pub fn control(&self) -> &ExecutionControl {
        &self.control
    }

    /// Cancel the cycle. A cycle still awaiting execution fails immediately;
    /// a running one stops dispatching and fails once in-flight nodes drain,
    /// keeping whatever its executor computed.
    pub fn cancel(&self) {
        self.control.cancel();
        // Only a cycle that has not begun fails here; a running one fails in `complete`.
        let failed_waiting = {
            let mut state = self.state.write();
            if *state == ViewCycleState::AwaitingExecution {
                *state = ViewCycleState::ExecutionFailed;
                true
            } else {
                false
            }
        };
        if failed_waiting {
            tracing::warn!(cycle = %self.id, failure = %CycleFailure::Cancelled, "View cycle failed");
            self.inner.write().failure = Some(CycleFailure::Cancelled);
        } else {
            tracing::debug!(cycle = %self.id, state = %self.state(), "Cancel requested after execution began");
        }
    }

    // -------------------------------------------------------------------------
    // Cache queries
    // -------------------------------------------------------------------------

    /// Cached values for a target.
    pub fn query_target(&self, target: &ComputationTarget) -> Vec<ComputedValue> {
        self.cache()
            .map(|c| c.values_for_target(target))
            .unwrap_or_default()
    }

    /// Cached values for specifications; absent ones are skipped.
    pub fn query_specifications(&self, specifications: &[ValueSpecification]) -> Vec<ComputedValue> {
        self.cache()
            .map(|c| c.get_many(specifications))
            .unwrap_or_default()
    }

    /// Cached values whose target matches the predicate.
    pub fn query<F>(&self, predicate: F) -> Vec<ComputedValue>
    where
        F: Fn(&ComputationTarget) -> bool,
    {
        self.cache().map(|c| c.query(predicate)).unwrap_or_default()
    }

    fn cache(&self) -> Option<Arc<ComputationCache>> {
        self.inner.read().cache.clone()
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn transition(&self, to: ViewCycleState) -> EngineResult<()> {
        let mut state = self.state.write();
        if !state.can_move_to(to) {
            return Err(EngineError::InvalidStateTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    /// `AwaitingExecution -> Executing` with the chosen snapshot and graph.
    pub fn begin(&self, snapshot: Arc<Snapshot>, graph: Arc<DependencyGraph>) -> EngineResult<()> {
        self.transition(ViewCycleState::Executing)?;
        let mut inner = self.inner.write();
        inner.started = Some(Instant::now());
        inner.started_at = Some(Utc::now());
        tracing::info!(
            cycle = %self.id,
            process = %self.process_id,
            snapshot = %snapshot.id(),
            nodes = graph.len(),
            "View cycle executing"
        );
        inner.snapshot = Some(snapshot);
        inner.graph = Some(graph);
        Ok(())
    }

    /// Record the executor's outcome: `Executed`, or `ExecutionFailed` if cancelled.
    pub fn complete(&self, outcome: ExecutionOutcome) -> EngineResult<ViewCycleState> {
        let graph = self
            .graph()
            .ok_or_else(|| EngineError::Internal(format!("cycle {} has no graph", self.id)))?;
        let cancelled = outcome.cancelled;
        let to = if cancelled {
            ViewCycleState::ExecutionFailed
        } else {
            ViewCycleState::Executed
        };
        self.transition(to)?;

        let mut inner = self.inner.write();
        inner.duration = inner.started.map(|s| s.elapsed());
        inner.statistics = Some(outcome.statistics);
        if cancelled {
            inner.failure = Some(CycleFailure::Cancelled);
        } else {
            inner.result = Some(Arc::new(ResultModel::build(
                self.id.clone(),
                self.options.valuation_time,
                &graph,
                &outcome.cache,
                &outcome.failures,
                self.result_definition,
            )));
        }
        inner.cache = Some(Arc::new(outcome.cache));

        tracing::info!(
            cycle = %self.id,
            state = %to,
            executed = outcome.statistics.executed_nodes,
            failed = outcome.statistics.failed_nodes,
            elapsed_ms = outcome.statistics.elapsed.as_millis() as u64,
            "View cycle finished"
        );
        Ok(to)
    }

    /// Fail the cycle structurally.
    pub fn fail(&self, failure: CycleFailure) -> EngineResult<()> {
        self.transition(ViewCycleState::ExecutionFailed)?;
        let mut inner = self.inner.write();
        inner.duration = inner.started.map(|s| s.elapsed());
        tracing::warn!(cycle = %self.id, failure = %failure, "View cycle failed");
        inner.failure = Some(failure);
        Ok(())
    }

    /// Begin, run the executor, and record its outcome.
    pub fn execute(
        &self,
        executor: &dyn DependencyGraphExecutor,
        snapshot: Arc<Snapshot>,
        graph: Arc<DependencyGraph>,
    ) -> EngineResult<ViewCycleState> {
        if self.control.is_cancelled() {
            self.fail(CycleFailure::Cancelled)?;
            return Ok(ViewCycleState::ExecutionFailed);
        }
        self.begin(snapshot.clone(), graph.clone())?;
        let outcome = executor.execute(&graph, &snapshot, &self.control);
        self.complete(outcome)
    }
}

impl fmt::Debug for ViewCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewCycle")
            .field("id", &self.id)
            .field("process_id", &self.process_id)
            .field("state", &self.state())
            .finish()
    }
}
