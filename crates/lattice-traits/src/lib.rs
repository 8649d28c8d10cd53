//! # Lattice Traits
//!
//! Value model and collaborator contracts for the Lattice view execution engine.
//!
//! This crate contains the data types shared between the engine and the
//! components it delegates to, plus the traits those components implement.
//! It carries no executors, channels or storage engines; implementations live
//! in `lattice-engine` or in the embedding application.
//!
//! ## Module Structure
//!
//! - [`ids`]: Unique identifiers for processes, clients, cycles, snapshots and batches
//! - [`target`]: Computation targets (what a value is about)
//! - [`value`]: Value specifications, payloads and computed values (which value)
//! - [`function`]: Calculation function and function registry contracts
//! - [`entitlement`]: Caller identity and the entitlement check consumed by permission providers
//! - [`persistence`]: Batch result persistence
//! - [`config`]: Engine configuration
//!
//! ## Dependency Injection
//!
//! The engine receives its collaborators explicitly:
//!
//! ```ignore
//! ViewProcessorBuilder::new()
//!     .with_config(EngineConfig::default())
//!     .with_function_registry(impl FunctionRegistry)
//!     .with_entitlements(impl EntitlementSource)
//!     .build()
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod entitlement;
pub mod error;
pub mod function;
pub mod ids;
pub mod persistence;
pub mod target;
pub mod value;

// Re-export commonly used types
pub use config::{EngineConfig, ExecutorStrategy, PermissionPolicy};
pub use entitlement::{EntitlementSource, UserPrincipal};
pub use error::TraitError;
pub use function::{CalculationFunction, FunctionError, FunctionInputs, FunctionRegistry};
pub use ids::*;
pub use persistence::{BatchPersistence, BatchResultRecord};
pub use target::{ComputationTarget, ComputationTargetKind};
pub use value::{ComputedValue, DataValue, MarketDataKey, ValueProperties, ValueSpecification};
