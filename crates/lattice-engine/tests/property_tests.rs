//! Property-based tests for executor invariants over randomized graphs.
//!
//! For every generated DAG:
//! - Consumers only run once all their inputs are cached
//! - Every specification is written at most once
//! - All strategies produce the same values and failures
//! - A failing node removes exactly itself and its transitive dependents

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use lattice_engine::{
    executor_for, ExecutionControl, ExecutionOutcome, FailureReason, FnCalculationFunction,
    FunctionRepository, GraphCompiler, Snapshot, ViewDefinition,
};
use lattice_traits::{
    ComputationTarget, ComputationTargetKind, DataValue, ExecutorStrategy, FunctionError,
    ValueSpecification,
};

// =============================================================================
// TEST DATA GENERATORS
// =============================================================================

/// Node `i` depends on a subset of nodes `0..i`, so every graph is acyclic.
fn dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..14).prop_flat_map(|n| {
        (0..n)
            .map(|i| proptest::collection::btree_set(0..i.max(1), 0..=i.min(3)))
            .collect::<Vec<_>>()
            .prop_map(|sets: Vec<BTreeSet<usize>>| -> Vec<Vec<usize>> {
                sets.into_iter().map(|deps| deps.into_iter().collect()).collect()
            })
    })
}

fn name(i: usize) -> String {
    format!("V{}", i)
}

fn target() -> ComputationTarget {
    ComputationTarget::security("DAG")
}

/// Each node's value is 1 plus the sum of its inputs. `failing` returns an error instead.
fn repository(deps: &[Vec<usize>], failing: Option<usize>) -> FunctionRepository {
    let mut repo = FunctionRepository::new();
    for (i, inputs) in deps.iter().enumerate() {
        let input_names: Vec<String> = inputs.iter().map(|&d| name(d)).collect();
        let expected_inputs = input_names.len();
        let fails = failing == Some(i);
        repo.register(
            FnCalculationFunction::new(format!("f{}", i), [ComputationTargetKind::Security], [name(i)])
                .with_inputs(input_names)
                .with_value_fn(move |_, inputs, _| {
                    if inputs.len() != expected_inputs {
                        return Err(FunctionError::MissingInput("inputs not ready".into()));
                    }
                    if fails {
                        return Err(FunctionError::Calculation("injected".into()));
                    }
                    let sum: f64 = inputs.iter().filter_map(|(_, v)| v.as_f64()).sum();
                    Ok(DataValue::Float(1.0 + sum))
                }),
        )
        .unwrap();
    }
    repo
}

fn expected_values(deps: &[Vec<usize>]) -> Vec<f64> {
    let mut values: Vec<f64> = Vec::with_capacity(deps.len());
    for inputs in deps {
        let sum: f64 = inputs.iter().map(|&d| values[d]).sum();
        values.push(1.0 + sum);
    }
    values
}

fn dependents_of(deps: &[Vec<usize>], failing: usize) -> BTreeSet<usize> {
    let mut affected = BTreeSet::from([failing]);
    for (i, inputs) in deps.iter().enumerate() {
        if inputs.iter().any(|d| affected.contains(d)) {
            affected.insert(i);
        }
    }
    affected
}

fn run_all(deps: &[Vec<usize>], failing: Option<usize>) -> Vec<ExecutionOutcome> {
    let mut definition = ViewDefinition::new("dag").with_target(target());
    for i in 0..deps.len() {
        definition = definition.requesting(name(i));
    }
    let snapshot = Snapshot::open_live();
    snapshot.mark_complete().unwrap();
    let graph = GraphCompiler::new(Arc::new(repository(deps, failing)), 1)
        .compile_uncached(&definition, &snapshot)
        .unwrap();

    [
        ExecutorStrategy::SingleThreaded,
        ExecutorStrategy::NodeParallel { workers: 4 },
        ExecutorStrategy::JobDispatch { calc_nodes: 3 },
    ]
    .iter()
    .map(|strategy| {
        executor_for(strategy)
            .unwrap()
            .execute(&graph, &snapshot, &ExecutionControl::new())
    })
    .collect()
}

fn value_of(outcome: &ExecutionOutcome, i: usize) -> Option<f64> {
    outcome
        .cache
        .get(&ValueSpecification::new(target(), name(i)))
        .ok()
        .and_then(|v| v.as_f64())
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn property_all_strategies_agree(deps in dag()) {
        let expected = expected_values(&deps);
        for outcome in run_all(&deps, None) {
            prop_assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
            prop_assert_eq!(outcome.cache.len(), deps.len());
            prop_assert_eq!(outcome.statistics.executed_nodes, deps.len());
            for (i, value) in expected.iter().enumerate() {
                prop_assert_eq!(value_of(&outcome, i), Some(*value));
            }
        }
    }

    #[test]
    fn property_failure_removes_exactly_dependents(deps in dag(), pick in any::<prop::sample::Index>()) {
        let failing = pick.index(deps.len());
        let affected = dependents_of(&deps, failing);
        let outcomes = run_all(&deps, Some(failing));

        for outcome in &outcomes {
            prop_assert_eq!(outcome.failures.len(), affected.len());
            prop_assert_eq!(outcome.cache.len(), deps.len() - affected.len());
            for i in 0..deps.len() {
                let spec = ValueSpecification::new(target(), name(i));
                let reason = outcome.failures.get(&spec);
                if i == failing {
                    prop_assert!(matches!(reason, Some(FailureReason::FunctionError(_))));
                } else if affected.contains(&i) {
                    prop_assert!(matches!(reason, Some(FailureReason::UpstreamFailure { .. })), "expected UpstreamFailure, got {:?}", reason);
                } else {
                    prop_assert!(reason.is_none());
                    prop_assert!(outcome.cache.contains(&spec));
                }
            }
        }

        let first = &outcomes[0];
        for other in &outcomes[1..] {
            prop_assert_eq!(&first.failures, &other.failures);
        }
    }
}
