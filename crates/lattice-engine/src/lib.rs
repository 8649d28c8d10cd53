//! # Lattice Engine
//!
//! The view execution engine for Lattice.
//!
//! This crate provides:
//! - [`GraphCompiler`]: Compiles view definitions into dependency graphs, with a compiled-graph cache
//! - [`DependencyGraphExecutor`]: Single-threaded, node-parallel and job-dispatch execution strategies
//! - [`ComputationCache`]: Write-once per-cycle value store
//! - [`Snapshot`] and [`BatchRunManager`]: Market data snapshots and batch runs
//! - [`LiveDataSnapshotProvider`]: Last-known-value live data with tick broadcast
//! - [`ViewCycle`]: One execution of a graph against a snapshot
//! - [`ViewProcess`]: Long-lived producer of cycles
//! - [`ViewProcessor`]: Registry of processes and clients with lifecycle events
//!
//! ## Architecture
//!
//! ```text
//! SnapshotSource ─> ViewProcess ─> GraphCompiler ─> DependencyGraph
//!                        │                               │
//!                        └──> ViewCycle <── Executor <───┘
//!                                 │
//!                                 └─> ResultModel ─> PermissionProvider ─> ViewClient
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let processor = ViewProcessorBuilder::new()
//!     .with_config(EngineConfig::default())
//!     .with_function_registry(Arc::new(repository))
//!     .build()?;
//!
//! processor.start();
//! let process = processor.register_process(definition, live_data, ViewProcessOptions::default())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod builder;
pub mod cache;
pub mod cycle;
pub mod definition;
pub mod error;
pub mod executor;
pub mod function;
pub mod graph;
pub mod live_data;
pub mod permission;
pub mod process;
pub mod processor;
pub mod result;
pub mod snapshot;

// Re-exports
pub use batch::{BatchJobRun, BatchRunManager, BatchStatus, InMemoryBatchPersistence};
pub use builder::ViewProcessorBuilder;
pub use cache::{CachedValue, ComputationCache};
pub use cycle::{CycleFailure, ViewCycle, ViewCycleState};
pub use definition::{RequestedValue, ResultModelDefinition, ViewCycleExecutionOptions, ViewDefinition};
pub use error::{EngineError, EngineResult};
pub use executor::{
    executor_for, DependencyGraphExecutor, ExecutionControl, ExecutionOutcome, ExecutionStatistics,
    FailureReason, JobDispatchExecutor, NodeParallelExecutor, SingleThreadedExecutor,
};
pub use function::{FnCalculationFunction, FunctionRepository};
pub use graph::{
    DependencyGraph, DependencyNode, GraphCompiler, GraphStats, KeySetAvailability,
    MarketDataAvailability, NodeId, NodeKind,
};
pub use live_data::{
    FixedSnapshotSource, LiveDataSnapshotProvider, MarketDataTick, NoSnapshotSource, SnapshotSource,
};
pub use permission::{
    permission_provider_for, EntitlementViewPermissionProvider, PermissiveViewPermissionProvider,
    ViewPermissionProvider,
};
pub use process::{CycleCompleted, CycleTrigger, ProcessResources, ViewProcess, ViewProcessOptions};
pub use processor::{ViewClient, ViewProcessor, ViewProcessorEvent, ViewProcessorEventListener};
pub use result::ResultModel;
pub use snapshot::{Snapshot, SnapshotState};
