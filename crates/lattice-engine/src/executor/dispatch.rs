//! Job-dispatching executor.
//!
//! A fixed set of long-lived calculation-node threads consume
//! [`CalculationJob`]s from a shared MPMC queue. A job carries everything
//! needed to run one function invocation: the function, its target, copies
//! of its input values and the outputs expected back. Calculation nodes never
//! see the cache; the dispatcher writes their results and resolves
//! market-data nodes itself.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};

use lattice_traits::{
    CalculationFunction, ComputationTarget, ComputedValue, FunctionInputs, ValueSpecification,
};

use crate::cache::ComputationCache;
use crate::error::{EngineError, EngineResult};
use crate::graph::{DependencyGraph, NodeId, NodeKind};
use crate::snapshot::Snapshot;

use super::{
    compute_node, gather_inputs, invoke, write_outputs, DependencyGraphExecutor, ExecutionControl,
    ExecutionOutcome, FailureReason, RunState,
};

/// One function invocation, detached from the graph and cache.
pub struct CalculationJob {
    /// Node the job was built from
    pub node: NodeId,
    /// Function to invoke
    pub function: Arc<dyn CalculationFunction>,
    /// Target to compute for
    pub target: ComputationTarget,
    /// Input values
    pub inputs: FunctionInputs,
    /// Outputs expected back
    pub outputs: Vec<ValueSpecification>,
    reply: Sender<JobResult>,
}

impl CalculationJob {
    fn run(self) {
        let start = Instant::now();
        let result = invoke(
            self.function.as_ref(),
            &self.target,
            &self.inputs,
            &self.outputs,
        );
        let _ = self.reply.send(JobResult {
            node: self.node,
            result,
            elapsed_us: start.elapsed().as_micros() as u64,
        });
    }
}

/// Result reported by a calculation node.
#[derive(Debug)]
pub struct JobResult {
    /// Node the job was built from
    pub node: NodeId,
    /// Produced values or the failure
    pub result: Result<Vec<ComputedValue>, FailureReason>,
    /// Invocation time
    pub elapsed_us: u64,
}

/// Executes function nodes on a pool of long-lived calculation nodes.
pub struct JobDispatchExecutor {
    jobs: Option<Sender<CalculationJob>>,
    calc_nodes: Vec<JoinHandle<()>>,
}

impl JobDispatchExecutor {
    /// Start `calc_nodes` calculation-node threads.
    pub fn new(calc_nodes: usize) -> EngineResult<Self> {
        if calc_nodes == 0 {
            return Err(EngineError::ConfigError(
                "job-dispatch executor needs at least one calculation node".into(),
            ));
        }

        let (jobs_tx, jobs_rx) = channel::unbounded::<CalculationJob>();
        let mut handles = Vec::with_capacity(calc_nodes);
        for i in 0..calc_nodes {
            let jobs_rx: Receiver<CalculationJob> = jobs_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("lattice-calc-{}", i))
                .spawn(move || {
                    for job in jobs_rx.iter() {
                        job.run();
                    }
                    tracing::trace!(calc_node = i, "Calculation node stopped");
                })
                .map_err(|e| EngineError::Internal(format!("spawn calculation node: {}", e)))?;
            handles.push(handle);
        }

        tracing::debug!(calc_nodes, "Calculation nodes started");
        Ok(Self {
            jobs: Some(jobs_tx),
            calc_nodes: handles,
        })
    }

    /// Number of calculation-node threads.
    pub fn calc_nodes(&self) -> usize {
        self.calc_nodes.len()
    }
}

impl std::fmt::Debug for JobDispatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatchExecutor")
            .field("calc_nodes", &self.calc_nodes.len())
            .finish()
    }
}

impl Drop for JobDispatchExecutor {
    fn drop(&mut self) {
        // Closing the queue ends each calculation node's receive loop.
        self.jobs.take();
        for handle in self.calc_nodes.drain(..) {
            let _ = handle.join();
        }
    }
}

impl DependencyGraphExecutor for JobDispatchExecutor {
    fn name(&self) -> &'static str {
        "job_dispatch"
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
        let (reply_tx, reply_rx) = channel::unbounded::<JobResult>();
        let mut in_flight = 0usize;

        loop {
            if control.is_cancelled() {
                cancelled = true;
            } else {
                while let Some(id) = state.next_ready() {
                    let node = graph.node(id);
                    let function = match &node.kind {
                        NodeKind::MarketData(_) => {
                            let resolved = compute_node(node, &cache, snapshot)
                                .and_then(|values| write_outputs(&cache, values, 0));
                            match resolved {
                                Ok(()) => state.complete(id),
                                Err(reason) => state.fail(id, reason),
                            }
                            continue;
                        }
                        NodeKind::Function(function) => function.clone(),
                    };

                    let inputs = match gather_inputs(node, &cache) {
                        Ok(inputs) => inputs,
                        Err(reason) => {
                            state.fail(id, reason);
                            continue;
                        }
                    };
                    let job = CalculationJob {
                        node: id,
                        function,
                        target: node.target.clone(),
                        inputs,
                        outputs: node.outputs.clone(),
                        reply: reply_tx.clone(),
                    };
                    let sent = self.jobs.as_ref().map(|jobs| jobs.send(job).is_ok());
                    if sent == Some(true) {
                        in_flight += 1;
                    } else {
                        state.fail(
                            id,
                            FailureReason::FunctionError("calculation nodes unavailable".into()),
                        );
                    }
                }
            }

            if in_flight == 0 {
                break;
            }

            let Ok(reply) = reply_rx.recv() else {
                break;
            };
            in_flight -= 1;
            match reply
                .result
                .and_then(|values| write_outputs(&cache, values, reply.elapsed_us))
            {
                Ok(()) => state.complete(reply.node),
                Err(reason) => state.fail(reply.node, reason),
            }
        }

        state.finish(cache, cancelled)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use lattice_traits::{ComputationTarget, ComputationTargetKind, DataValue};
    use parking_lot::Mutex;

    use super::*;
    use crate::definition::ViewDefinition;
    use crate::function::{FnCalculationFunction, FunctionRepository};
    use crate::graph::GraphCompiler;

    #[test]
    fn test_zero_calc_nodes_rejected() {
        assert!(matches!(
            JobDispatchExecutor::new(0),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_jobs_run_on_calc_node_threads() {
        let threads = Arc::new(Mutex::new(HashSet::new()));
        let mut repo = FunctionRepository::new();
        for i in 0..16 {
            let threads = threads.clone();
            repo.register(
                FnCalculationFunction::new(
                    format!("f{}", i),
                    [ComputationTargetKind::Position],
                    [format!("V{}", i)],
                )
                .with_value_fn(move |_, _, _| {
                    let name = std::thread::current().name().unwrap_or("").to_string();
                    threads.lock().insert(name);
                    Ok(DataValue::Float(1.0))
                }),
            )
            .unwrap();
        }
        let mut def = ViewDefinition::new("jobs").with_target(ComputationTarget::position("A"));
        for i in 0..16 {
            def = def.requesting(format!("V{}", i));
        }
        let snapshot = Snapshot::open_live();
        snapshot.mark_complete().unwrap();
        let graph = GraphCompiler::new(Arc::new(repo), 1)
            .compile_uncached(&def, &snapshot)
            .unwrap();

        let executor = JobDispatchExecutor::new(2).unwrap();
        let outcome = executor.execute(&graph, &snapshot, &ExecutionControl::new());
        assert_eq!(outcome.statistics.executed_nodes, 16);
        assert!(threads
            .lock()
            .iter()
            .all(|name| name.starts_with("lattice-calc-")));

        // Reusable across executions.
        let again = executor.execute(&graph, &snapshot, &ExecutionControl::new());
        assert_eq!(again.statistics.executed_nodes, 16);
    }
}
