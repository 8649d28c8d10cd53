//! Dependency graph executors.
//!
//! Every strategy implements [`DependencyGraphExecutor`]: run a compiled graph
//! against a snapshot, writing into a fresh [`ComputationCache`], and report
//! per-specification failures instead of returning early.
//!
//! - [`SingleThreadedExecutor`]: topological order on the calling thread
//! - [`NodeParallelExecutor`]: ready nodes on a bounded `rayon` pool
//! - [`JobDispatchExecutor`]: self-contained jobs for long-lived calculation nodes

mod dispatch;
mod parallel;
mod single;

pub use dispatch::{CalculationJob, JobDispatchExecutor, JobResult};
pub use parallel::NodeParallelExecutor;
pub use single::SingleThreadedExecutor;

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lattice_traits::{
    CalculationFunction, ComputationTarget, ComputedValue, ExecutorStrategy, FunctionInputs,
    MarketDataKey, ValueSpecification,
};

use crate::cache::ComputationCache;
use crate::error::EngineResult;
use crate::graph::{DependencyGraph, DependencyNode, NodeId, NodeKind};
use crate::snapshot::Snapshot;

// =============================================================================
// EXECUTOR CONTRACT
// =============================================================================

/// Strategy for running a compiled graph.
pub trait DependencyGraphExecutor: Send + Sync {
    /// Strategy name for logging.
    fn name(&self) -> &'static str;

    /// Run `graph` against `snapshot`.
    ///
    /// Node failures are recorded in the outcome; this never fails as a whole.
    fn execute(
        &self,
        graph: &DependencyGraph,
        snapshot: &Snapshot,
        control: &ExecutionControl,
    ) -> ExecutionOutcome;
}

/// Build the executor selected by configuration.
pub fn executor_for(strategy: &ExecutorStrategy) -> EngineResult<Arc<dyn DependencyGraphExecutor>> {
    Ok(match *strategy {
        ExecutorStrategy::SingleThreaded => Arc::new(SingleThreadedExecutor::new()),
        ExecutorStrategy::NodeParallel { workers } => Arc::new(NodeParallelExecutor::new(workers)?),
        ExecutorStrategy::JobDispatch { calc_nodes } => {
            Arc::new(JobDispatchExecutor::new(calc_nodes)?)
        }
    })
}

/// Cancellation handle shared between a cycle and its executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutionControl {
    cancelled: Arc<AtomicBool>,
}

impl ExecutionControl {
    /// Fresh, uncancelled control.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. No further nodes are dispatched once observed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Why a specification has no value.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum FailureReason {
    /// The producing function returned an error or panicked
    #[error("function error: {0}")]
    FunctionError(String),

    /// The snapshot has no value for the key
    #[error("missing market data: {0}")]
    MissingMarketData(MarketDataKey),

    /// A declared input was absent from the cache
    #[error("missing input: {0}")]
    MissingInput(ValueSpecification),

    /// The function did not produce a declared output
    #[error("missing output: {0}")]
    MissingOutput(ValueSpecification),

    /// Something this value depends on failed
    #[error("upstream failure: {upstream}")]
    UpstreamFailure {
        /// Specification of the failing producer
        upstream: ValueSpecification,
    },

    /// The cache already held a value for the output
    #[error("duplicate value: {0}")]
    DuplicateValue(ValueSpecification),
}

/// Counters gathered while executing a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    /// Nodes in the graph
    pub total_nodes: usize,
    /// Nodes that ran and wrote all outputs
    pub executed_nodes: usize,
    /// Nodes that failed or were skipped because of an upstream failure
    pub failed_nodes: usize,
    /// Nodes never started because execution was cancelled
    pub not_started_nodes: usize,
    /// Wall time
    pub elapsed: Duration,
}

/// Everything an execution produced.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// Values computed, scoped to this execution
    pub cache: ComputationCache,
    /// Per-specification failures
    pub failures: BTreeMap<ValueSpecification, FailureReason>,
    /// Counters
    pub statistics: ExecutionStatistics,
    /// Whether cancellation stopped dispatch
    pub cancelled: bool,
}

// =============================================================================
// RUN STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStatus {
    NotStarted,
    Running,
    Executed,
    Failed,
}

/// Ready-set bookkeeping shared by the strategies.
pub(crate) struct RunState<'g> {
    graph: &'g DependencyGraph,
    pending: Vec<usize>,
    ready: VecDeque<NodeId>,
    status: Vec<NodeStatus>,
    failures: BTreeMap<ValueSpecification, FailureReason>,
    started: Instant,
}

impl<'g> RunState<'g> {
    pub(crate) fn new(graph: &'g DependencyGraph) -> Self {
        let pending: Vec<usize> = graph
            .nodes()
            .iter()
            .map(|n| graph.dependencies_of(n.id).len())
            .collect();
        let ready = graph
            .topological_order()
            .iter()
            .copied()
            .filter(|id| pending[id.0] == 0)
            .collect();
        Self {
            graph,
            pending,
            ready,
            status: vec![NodeStatus::NotStarted; graph.len()],
            failures: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    /// Next node whose inputs are all present, marked running.
    pub(crate) fn next_ready(&mut self) -> Option<NodeId> {
        while let Some(id) = self.ready.pop_front() {
            if self.status[id.0] == NodeStatus::NotStarted {
                self.status[id.0] = NodeStatus::Running;
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn is_failed(&self, id: NodeId) -> bool {
        self.status[id.0] == NodeStatus::Failed
    }

    pub(crate) fn mark_running(&mut self, id: NodeId) {
        self.status[id.0] = NodeStatus::Running;
    }

    /// Record a node's success and release consumers whose inputs are now all present.
    pub(crate) fn complete(&mut self, id: NodeId) {
        self.status[id.0] = NodeStatus::Executed;
        for &dependent in self.graph.dependents_of(id) {
            self.pending[dependent.0] -= 1;
            if self.pending[dependent.0] == 0 && self.status[dependent.0] == NodeStatus::NotStarted
            {
                self.ready.push_back(dependent);
            }
        }
    }

    /// Record a node's failure and fail everything downstream of it.
    pub(crate) fn fail(&mut self, id: NodeId, reason: FailureReason) {
        let node = self.graph.node(id);
        tracing::warn!(node = %node.label(), reason = %reason, "Node failed");

        self.status[id.0] = NodeStatus::Failed;
        for output in &node.outputs {
            self.failures.insert(output.clone(), reason.clone());
        }

        let Some(upstream) = node.outputs.first().cloned() else {
            return;
        };
        for dependent in self.graph.transitive_dependents(id) {
            if self.status[dependent.0] != NodeStatus::NotStarted {
                continue;
            }
            self.status[dependent.0] = NodeStatus::Failed;
            for output in &self.graph.node(dependent).outputs {
                self.failures
                    .entry(output.clone())
                    .or_insert_with(|| FailureReason::UpstreamFailure {
                        upstream: upstream.clone(),
                    });
            }
        }
    }

    pub(crate) fn finish(self, cache: ComputationCache, cancelled: bool) -> ExecutionOutcome {
        let mut statistics = ExecutionStatistics {
            total_nodes: self.graph.len(),
            elapsed: self.started.elapsed(),
            ..Default::default()
        };
        for status in &self.status {
            match status {
                NodeStatus::Executed => statistics.executed_nodes += 1,
                NodeStatus::Failed => statistics.failed_nodes += 1,
                NodeStatus::NotStarted | NodeStatus::Running => statistics.not_started_nodes += 1,
            }
        }
        ExecutionOutcome {
            cache,
            failures: self.failures,
            statistics,
            cancelled,
        }
    }
}

// =============================================================================
// NODE SEMANTICS
// =============================================================================

/// Values of a node's declared outputs, computed without writing the cache.
pub(crate) fn compute_node(
    node: &DependencyNode,
    cache: &ComputationCache,
    snapshot: &Snapshot,
) -> Result<Vec<ComputedValue>, FailureReason> {
    match &node.kind {
        NodeKind::MarketData(key) => read_market_data(node, key, snapshot),
        NodeKind::Function(function) => {
            let inputs = gather_inputs(node, cache)?;
            invoke(function.as_ref(), &node.target, &inputs, &node.outputs)
        }
    }
}

/// Compute a node and write its outputs.
pub(crate) fn execute_node(
    node: &DependencyNode,
    cache: &ComputationCache,
    snapshot: &Snapshot,
) -> Result<(), FailureReason> {
    let start = Instant::now();
    let values = compute_node(node, cache, snapshot)?;
    let elapsed_us = start.elapsed().as_micros() as u64;
    write_outputs(cache, values, elapsed_us)?;
    tracing::trace!(node = %node.label(), elapsed_us, "Node executed");
    Ok(())
}

fn read_market_data(
    node: &DependencyNode,
    key: &MarketDataKey,
    snapshot: &Snapshot,
) -> Result<Vec<ComputedValue>, FailureReason> {
    match snapshot.get(key) {
        Some(value) if !value.is_missing() => Ok(node
            .outputs
            .iter()
            .map(|spec| ComputedValue::new(spec.clone(), value.clone()))
            .collect()),
        _ => Err(FailureReason::MissingMarketData(key.clone())),
    }
}

pub(crate) fn gather_inputs(
    node: &DependencyNode,
    cache: &ComputationCache,
) -> Result<FunctionInputs, FailureReason> {
    let values = cache.get_many(&node.inputs);
    if values.len() != node.inputs.len() {
        let missing = node
            .inputs
            .iter()
            .find(|spec| !cache.contains(spec))
            .cloned()
            .unwrap_or_else(|| node.inputs[0].clone());
        return Err(FailureReason::MissingInput(missing));
    }
    Ok(FunctionInputs::new(values))
}

/// Run a function, isolating panics and checking its declared outputs.
pub(crate) fn invoke(
    function: &dyn CalculationFunction,
    target: &ComputationTarget,
    inputs: &FunctionInputs,
    outputs: &[ValueSpecification],
) -> Result<Vec<ComputedValue>, FailureReason> {
    let produced = panic::catch_unwind(AssertUnwindSafe(|| {
        function.execute(target, inputs, outputs)
    }))
    .map_err(|payload| {
        FailureReason::FunctionError(format!(
            "{} panicked: {}",
            function.function_id(),
            panic_message(payload.as_ref())
        ))
    })?
    .map_err(|e| FailureReason::FunctionError(format!("{}: {}", function.function_id(), e)))?;

    let mut by_spec: BTreeMap<ValueSpecification, ComputedValue> = produced
        .into_iter()
        .map(|v| (v.specification.clone(), v))
        .collect();
    outputs
        .iter()
        .map(|spec| match by_spec.remove(spec) {
            Some(value) if !value.value.is_missing() => Ok(value),
            _ => Err(FailureReason::MissingOutput(spec.clone())),
        })
        .collect()
}

/// Write a node's outputs. Nothing is written if any output is already cached.
pub(crate) fn write_outputs(
    cache: &ComputationCache,
    values: Vec<ComputedValue>,
    elapsed_us: u64,
) -> Result<(), FailureReason> {
    if let Some(existing) = values.iter().find(|v| cache.contains(&v.specification)) {
        return Err(FailureReason::DuplicateValue(existing.specification.clone()));
    }
    for value in values {
        let spec = value.specification.clone();
        cache
            .put_value(value, elapsed_us)
            .map_err(|_| FailureReason::DuplicateValue(spec))?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
