//! Node-parallel executor.
//!
//! The calling thread runs the dispatch loop: it hands every node whose
//! inputs are all present to a bounded `rayon` pool, then blocks on a
//! completion channel. A completion is sent only after the node's outputs
//! are in the cache, so releasing consumers on receipt keeps every consumer
//! behind its producers.

use crossbeam::channel;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::cache::ComputationCache;
use crate::error::{EngineError, EngineResult};
use crate::graph::{DependencyGraph, NodeId};
use crate::snapshot::Snapshot;

use super::{
    execute_node, DependencyGraphExecutor, ExecutionControl, ExecutionOutcome, FailureReason,
    RunState,
};

/// Runs independent nodes concurrently on a worker pool.
pub struct NodeParallelExecutor {
    pool: ThreadPool,
    workers: usize,
}

impl NodeParallelExecutor {
    /// Create an executor with `workers` pool threads.
    pub fn new(workers: usize) -> EngineResult<Self> {
        if workers == 0 {
            return Err(EngineError::ConfigError(
                "node-parallel executor needs at least one worker".into(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("lattice-node-{}", i))
            .build()
            .map_err(|e| EngineError::ConfigError(format!("worker pool: {}", e)))?;
        Ok(Self { pool, workers })
    }

    /// Pool size.
    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl std::fmt::Debug for NodeParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeParallelExecutor")
            .field("workers", &self.workers)
            .finish()
    }
}

impl DependencyGraphExecutor for NodeParallelExecutor {
    fn name(&self) -> &'static str {
        "node_parallel"
    }

    fn execute(
        &self,
        graph: &DependencyGraph,
        snapshot: &Snapshot,
        control: &ExecutionControl,
    ) -> ExecutionOutcome {
        let cache = ComputationCache::new();
        let mut state = RunState::new(graph);
        let mut cancelled = false;
        let (done_tx, done_rx) = channel::unbounded::<(NodeId, Result<(), FailureReason>)>();

        self.pool.in_place_scope(|scope| {
            let mut in_flight = 0usize;
            loop {
                if control.is_cancelled() {
                    cancelled = true;
                } else {
                    while let Some(id) = state.next_ready() {
                        let node = graph.node(id);
                        let cache = &cache;
                        let done_tx = done_tx.clone();
                        in_flight += 1;
                        scope.spawn(move |_| {
                            let result = execute_node(node, cache, snapshot);
                            let _ = done_tx.send((node.id, result));
                        });
                    }
                }

                if in_flight == 0 {
                    break;
                }

                let Ok((id, result)) = done_rx.recv() else {
                    break;
                };
                in_flight -= 1;
                match result {
                    Ok(()) => state.complete(id),
                    Err(reason) => state.fail(id, reason),
                }
            }
        });

        tracing::trace!(workers = self.workers, cancelled, "Parallel dispatch loop finished");
        state.finish(cache, cancelled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use lattice_traits::{ComputationTarget, ComputationTargetKind, DataValue, ValueSpecification};

    use super::*;
    use crate::definition::ViewDefinition;
    use crate::function::{FnCalculationFunction, FunctionRepository};
    use crate::graph::GraphCompiler;

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            NodeParallelExecutor::new(0),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_concurrency_bounded_by_pool() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut repo = FunctionRepository::new();
        for i in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            repo.register(
                FnCalculationFunction::new(
                    format!("slow-{}", i),
                    [ComputationTargetKind::Position],
                    [format!("V{}", i)],
                )
                .with_value_fn(move |_, _, _| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(DataValue::Float(1.0))
                }),
            )
            .unwrap();
        }

        let mut def = ViewDefinition::new("slow").with_target(ComputationTarget::position("A"));
        for i in 0..12 {
            def = def.requesting(format!("V{}", i));
        }
        let snapshot = Snapshot::open_live();
        snapshot.mark_complete().unwrap();
        let graph = GraphCompiler::new(Arc::new(repo), 1)
            .compile_uncached(&def, &snapshot)
            .unwrap();

        let outcome = NodeParallelExecutor::new(2)
            .unwrap()
            .execute(&graph, &snapshot, &ExecutionControl::new());

        assert_eq!(outcome.statistics.executed_nodes, 12);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(outcome
            .cache
            .contains(&ValueSpecification::new(ComputationTarget::position("A"), "V11")));
    }

    #[test]
    fn test_cancel_mid_flight_drains() {
        let control = ExecutionControl::new();
        let mut repo = FunctionRepository::new();
        let trigger = control.clone();
        repo.register(
            FnCalculationFunction::new("first", [ComputationTargetKind::Position], ["First"])
                .with_value_fn(move |_, _, _| {
                    trigger.cancel();
                    Ok(DataValue::Float(1.0))
                }),
        )
        .unwrap();
        repo.register(
            FnCalculationFunction::new("second", [ComputationTargetKind::Position], ["Second"])
                .with_inputs(["First"])
                .with_value_fn(|_, _, _| Ok(DataValue::Float(2.0))),
        )
        .unwrap();

        let def = ViewDefinition::new("cancel")
            .with_target(ComputationTarget::position("A"))
            .requesting("Second");
        let snapshot = Snapshot::open_live();
        snapshot.mark_complete().unwrap();
        let graph = GraphCompiler::new(Arc::new(repo), 1)
            .compile_uncached(&def, &snapshot)
            .unwrap();

        let outcome = NodeParallelExecutor::new(2)
            .unwrap()
            .execute(&graph, &snapshot, &control);

        assert!(outcome.cancelled);
        assert_eq!(outcome.statistics.executed_nodes, 1);
        assert_eq!(outcome.statistics.not_started_nodes, 1);
        assert_eq!(outcome.cache.len(), 1);
    }
}
