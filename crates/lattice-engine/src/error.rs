//! Engine error types.

use lattice_traits::{
    BatchId, MarketDataKey, SnapshotId, TraitError, ValueSpecification, ViewClientId, ViewCycleId,
    ViewProcessId,
};
use thiserror::Error;

/// Engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A requirement depends on itself, directly or indirectly
    #[error("cyclic dependency: {}", format_path(.path))]
    CyclicDependency {
        /// Requirements from the first revisit back to itself
        path: Vec<ValueSpecification>,
    },

    /// No function or market data can satisfy a requirement
    #[error("unsatisfied dependency: {requirement}")]
    UnsatisfiedDependency {
        /// The requirement that could not be resolved
        requirement: ValueSpecification,
    },

    /// A value is unavailable because something it depends on failed
    #[error("upstream failure: {0}")]
    UpstreamFailure(ValueSpecification),

    /// A cache already holds a value for the specification
    #[error("duplicate value: {0}")]
    DuplicateValue(ValueSpecification),

    /// Value not in the cache
    #[error("value not found: {0}")]
    ValueNotFound(ValueSpecification),

    /// Snapshot no longer accepts values
    #[error("snapshot sealed: {0}")]
    SnapshotSealed(SnapshotId),

    /// Snapshot key already has a value
    #[error("duplicate snapshot value: {key} in {snapshot}")]
    DuplicateSnapshotValue {
        /// Snapshot
        snapshot: SnapshotId,
        /// Key that was re-added
        key: MarketDataKey,
    },

    /// Key is not eligible for a fixed snapshot
    #[error("unknown snapshot key: {key} in {snapshot}")]
    UnknownSnapshotKey {
        /// Snapshot
        snapshot: SnapshotId,
        /// Key outside the fixed key set
        key: MarketDataKey,
    },

    /// Snapshot not found
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    /// Snapshot operation not allowed in its current state
    #[error("invalid snapshot state for {snapshot}: {message}")]
    InvalidSnapshotState {
        /// Snapshot
        snapshot: SnapshotId,
        /// What was attempted
        message: String,
    },

    /// Caller may not see a target's values
    #[error("entitlement denied: {user} for {target}")]
    EntitlementDenied {
        /// User name
        user: String,
        /// Target rendered
        target: String,
    },

    /// View cycle state change not permitted
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Execution was cancelled
    #[error("cancelled")]
    Cancelled,

    /// View process not registered
    #[error("view process not found: {0}")]
    ProcessNotFound(ViewProcessId),

    /// View client not registered
    #[error("view client not found: {0}")]
    ClientNotFound(ViewClientId),

    /// Cycle not retained
    #[error("view cycle not found: {0}")]
    CycleNotFound(ViewCycleId),

    /// Batch not started
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Processor is stopped
    #[error("view processor is not running")]
    ProcessorNotRunning,

    /// Collaborator failure
    #[error("persistence error: {0}")]
    Persistence(#[from] TraitError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_path(path: &[ValueSpecification]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
