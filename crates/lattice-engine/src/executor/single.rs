//! Sequential executor.

use crate::cache::ComputationCache;
use crate::graph::DependencyGraph;
use crate::snapshot::Snapshot;

use super::{execute_node, DependencyGraphExecutor, ExecutionControl, ExecutionOutcome, RunState};

/// Runs nodes one at a time in the graph's topological order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleThreadedExecutor;

impl SingleThreadedExecutor {
    /// Create the executor.
    pub fn new() -> Self {
        Self
    }
}

impl DependencyGraphExecutor for SingleThreadedExecutor {
    fn name(&self) -> &'static str {
        "single_threaded"
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

        for &id in graph.topological_order() {
            if control.is_cancelled() {
                cancelled = true;
                break;
            }
            if state.is_failed(id) {
                continue;
            }
            state.mark_running(id);
            match execute_node(graph.node(id), &cache, snapshot) {
                Ok(()) => state.complete(id),
                Err(reason) => state.fail(id, reason),
            }
        }

        state.finish(cache, cancelled)
    }
}
