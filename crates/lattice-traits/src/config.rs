//! Engine configuration.
//!
//! Configuration contains:
//! - Executor strategy and pool sizes
//! - Cycle retention and compiled-graph cache sizes
//! - Permission policy selection
//!
//! Configuration does NOT contain:
//! - View definitions (supplied by the embedding application)
//! - Market data or entitlement data

use serde::{Deserialize, Serialize};

use crate::error::TraitError;

// =============================================================================
// EXECUTOR STRATEGY
// =============================================================================

/// How a compiled dependency graph is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ExecutorStrategy {
    /// Nodes run one at a time in topological order.
    SingleThreaded,

    /// Eligible nodes run on a bounded worker pool.
    NodeParallel {
        /// Worker threads in the pool
        #[serde(default = "default_workers")]
        workers: usize,
    },

    /// Eligible function nodes are packaged as jobs for long-lived calculation nodes.
    JobDispatch {
        /// Calculation node threads
        #[serde(default = "default_workers")]
        calc_nodes: usize,
    },
}

impl Default for ExecutorStrategy {
    fn default() -> Self {
        ExecutorStrategy::NodeParallel {
            workers: default_workers(),
        }
    }
}

impl ExecutorStrategy {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SingleThreaded => "single_threaded",
            Self::NodeParallel { .. } => "node_parallel",
            Self::JobDispatch { .. } => "job_dispatch",
        }
    }
}

// =============================================================================
// PERMISSION POLICY
// =============================================================================

/// Which permission provider filters client results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicy {
    /// Every caller sees everything.
    #[default]
    Permissive,
    /// Values are filtered per target through an entitlement source.
    Entitlement,
}

// =============================================================================
// ENGINE CONFIG
// =============================================================================

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine instance name
    #[serde(default = "default_name")]
    pub name: String,

    /// Graph execution strategy
    #[serde(default)]
    pub executor: ExecutorStrategy,

    /// Cycles retained per view process
    #[serde(default = "default_cycle_retention")]
    pub cycle_retention: usize,

    /// Compiled graphs kept by the graph compiler
    #[serde(default = "default_graph_cache_size")]
    pub graph_cache_size: usize,

    /// Result permission policy
    #[serde(default)]
    pub permission: PermissionPolicy,

    /// Buffered cycle-completion notices per view process
    #[serde(default = "default_cycle_notice_capacity")]
    pub cycle_notice_capacity: usize,
}

fn default_name() -> String {
    "lattice".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_cycle_retention() -> usize {
    5
}

fn default_graph_cache_size() -> usize {
    16
}

fn default_cycle_notice_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            executor: ExecutorStrategy::default(),
            cycle_retention: default_cycle_retention(),
            graph_cache_size: default_graph_cache_size(),
            permission: PermissionPolicy::default(),
            cycle_notice_capacity: default_cycle_notice_capacity(),
        }
    }
}

impl EngineConfig {
    /// Checks sizes and pool counts.
    pub fn validate(&self) -> Result<(), TraitError> {
        match self.executor {
            ExecutorStrategy::NodeParallel { workers: 0 } => {
                return Err(TraitError::InvalidConfig(
                    "executor.workers must be at least 1".into(),
                ))
            }
            ExecutorStrategy::JobDispatch { calc_nodes: 0 } => {
                return Err(TraitError::InvalidConfig(
                    "executor.calc_nodes must be at least 1".into(),
                ))
            }
            _ => {}
        }
        if self.cycle_retention == 0 {
            return Err(TraitError::InvalidConfig(
                "cycle_retention must be at least 1".into(),
            ));
        }
        if self.graph_cache_size == 0 {
            return Err(TraitError::InvalidConfig(
                "graph_cache_size must be at least 1".into(),
            ));
        }
        if self.cycle_notice_capacity == 0 {
            return Err(TraitError::InvalidConfig(
                "cycle_notice_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
