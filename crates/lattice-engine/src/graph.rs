//! Dependency graph compilation.
//!
//! A view definition is compiled into an immutable [`DependencyGraph`]: one
//! node per function invocation (shared by all outputs the invocation
//! produces) or market-data input, edges from producer to consumer, and a
//! topological order. Compiled graphs are reused across cycles through the
//! [`GraphCompiler`]'s bounded cache.
//!
//! # Example
//!
//! ```rust,ignore
//! let compiler = GraphCompiler::new(Arc::new(repository), 16);
//! let graph = compiler.compile(&definition, &snapshot)?;
//!
//! for id in graph.topological_order() {
//!     println!("{}", graph.node(*id).label());
//! }
//! ```

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use lattice_traits::{
    CalculationFunction, ComputationTarget, FunctionRegistry, MarketDataKey, ValueSpecification,
};

use crate::definition::ViewDefinition;
use crate::error::{EngineError, EngineResult};

// =============================================================================
// MARKET DATA AVAILABILITY
// =============================================================================

/// Answers whether an external input can be sourced for a compile.
pub trait MarketDataAvailability: Send + Sync {
    /// Whether the key can be supplied.
    fn is_available(&self, key: &MarketDataKey) -> bool;

    /// Stable digest of the available key set, used to key compiled graphs.
    fn fingerprint(&self) -> u64;
}

/// Availability backed by a fixed key set.
#[derive(Debug, Clone, Default)]
pub struct KeySetAvailability {
    keys: BTreeSet<MarketDataKey>,
}

impl KeySetAvailability {
    /// Create from keys.
    pub fn new(keys: impl IntoIterator<Item = MarketDataKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

impl MarketDataAvailability for KeySetAvailability {
    fn is_available(&self, key: &MarketDataKey) -> bool {
        self.keys.contains(key)
    }

    fn fingerprint(&self) -> u64 {
        fingerprint_keys(self.keys.iter())
    }
}

/// Digest of an ordered key sequence.
pub(crate) fn fingerprint_keys<'a>(keys: impl Iterator<Item = &'a MarketDataKey>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for key in keys {
        key.hash(&mut hasher);
    }
    hasher.finish()
}

// =============================================================================
// DEPENDENCY NODE
// =============================================================================

/// Index of a node within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Position of the node in [`DependencyGraph::nodes`].
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// What a node does when executed.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Invoke a calculation function.
    Function(Arc<dyn CalculationFunction>),
    /// Read one key from the cycle's snapshot.
    MarketData(MarketDataKey),
}

/// One unit of work in a compiled graph.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    /// Node index
    pub id: NodeId,
    /// Target the node computes for
    pub target: ComputationTarget,
    /// Function or market-data source
    pub kind: NodeKind,
    /// Declared input specifications
    pub inputs: Vec<ValueSpecification>,
    /// Declared output specifications
    pub outputs: Vec<ValueSpecification>,
}

impl DependencyNode {
    /// Function id for function nodes.
    pub fn function_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Function(f) => Some(f.function_id()),
            NodeKind::MarketData(_) => None,
        }
    }

    /// Returns true for market-data nodes.
    pub fn is_market_data(&self) -> bool {
        matches!(self.kind, NodeKind::MarketData(_))
    }

    /// Human-readable label for logs.
    pub fn label(&self) -> String {
        match &self.kind {
            NodeKind::Function(f) => format!("{}({})", f.function_id(), self.target),
            NodeKind::MarketData(key) => format!("md({})", key),
        }
    }
}

// =============================================================================
// DEPENDENCY GRAPH
// =============================================================================

/// Immutable compiled execution plan.
#[derive(Debug)]
pub struct DependencyGraph {
    name: String,
    nodes: Vec<DependencyNode>,
    graph: DiGraph<NodeId, ()>,
    producers: HashMap<ValueSpecification, NodeId>,
    dependencies: Vec<Vec<NodeId>>,
    dependents: Vec<Vec<NodeId>>,
    order: Vec<NodeId>,
    terminal_outputs: Vec<ValueSpecification>,
    market_data_requirements: BTreeSet<MarketDataKey>,
}

impl DependencyGraph {
    /// Name of the view the graph was compiled from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All nodes, indexed by [`NodeId`].
    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    /// A node by id.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph.
    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id.0]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of producer-to-consumer edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Producers of a node's inputs.
    pub fn dependencies_of(&self, id: NodeId) -> &[NodeId] {
        &self.dependencies[id.0]
    }

    /// Consumers of a node's outputs.
    pub fn dependents_of(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id.0]
    }

    /// Node order in which every producer precedes its consumers.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Node producing a specification.
    pub fn producer_of(&self, specification: &ValueSpecification) -> Option<NodeId> {
        self.producers.get(specification).copied()
    }

    /// Requested outputs, in definition order.
    pub fn terminal_outputs(&self) -> &[ValueSpecification] {
        &self.terminal_outputs
    }

    /// External inputs the graph reads.
    pub fn market_data_requirements(&self) -> &BTreeSet<MarketDataKey> {
        &self.market_data_requirements
    }

    /// Every node transitively downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = self.dependents_of(id).iter().copied().collect();
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                out.push(next);
                queue.extend(self.dependents_of(next).iter().copied());
            }
        }
        out
    }

    /// Returns statistics about the graph.
    pub fn stats(&self) -> GraphStats {
        let market_data_nodes = self.nodes.iter().filter(|n| n.is_market_data()).count();
        GraphStats {
            node_count: self.nodes.len(),
            edge_count: self.edge_count(),
            function_nodes: self.nodes.len() - market_data_nodes,
            market_data_nodes,
            terminal_outputs: self.terminal_outputs.len(),
        }
    }
}

// =============================================================================
// GRAPH STATISTICS
// =============================================================================

/// Statistics about a compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Number of nodes.
    pub node_count: usize,
    /// Number of edges (dependencies).
    pub edge_count: usize,
    /// Function nodes.
    pub function_nodes: usize,
    /// Market-data nodes.
    pub market_data_nodes: usize,
    /// Requested outputs.
    pub terminal_outputs: usize,
}

// =============================================================================
// GRAPH BUILDER
// =============================================================================

struct GraphBuilder<'a> {
    registry: &'a dyn FunctionRegistry,
    availability: &'a dyn MarketDataAvailability,
    nodes: Vec<DependencyNode>,
    function_nodes: HashMap<(String, ComputationTarget), NodeId>,
    resolved: HashMap<ValueSpecification, NodeId>,
    stack: Vec<ValueSpecification>,
    in_progress: HashSet<ValueSpecification>,
}

impl<'a> GraphBuilder<'a> {
    fn new(registry: &'a dyn FunctionRegistry, availability: &'a dyn MarketDataAvailability) -> Self {
        Self {
            registry,
            availability,
            nodes: Vec::new(),
            function_nodes: HashMap::new(),
            resolved: HashMap::new(),
            stack: Vec::new(),
            in_progress: HashSet::new(),
        }
    }

    fn resolve(&mut self, requirement: &ValueSpecification) -> EngineResult<NodeId> {
        if let Some(id) = self.resolved.get(requirement) {
            return Ok(*id);
        }
        if self.in_progress.contains(requirement) {
            let start = self
                .stack
                .iter()
                .position(|s| s == requirement)
                .unwrap_or(0);
            let mut path = self.stack[start..].to_vec();
            path.push(requirement.clone());
            return Err(EngineError::CyclicDependency { path });
        }

        let id = if let Some(function) = self.registry.resolve(requirement) {
            let inputs = function.requirements(requirement);

            self.stack.push(requirement.clone());
            self.in_progress.insert(requirement.clone());
            for input in &inputs {
                self.resolve(input)?;
            }
            self.in_progress.remove(requirement);
            self.stack.pop();

            self.function_node(function, requirement, inputs)
        } else if self.availability.is_available(&requirement.market_data_key()) {
            let id = NodeId(self.nodes.len());
            self.nodes.push(DependencyNode {
                id,
                target: requirement.target.clone(),
                kind: NodeKind::MarketData(requirement.market_data_key()),
                inputs: Vec::new(),
                outputs: vec![requirement.clone()],
            });
            id
        } else {
            return Err(EngineError::UnsatisfiedDependency {
                requirement: requirement.clone(),
            });
        };

        self.resolved.insert(requirement.clone(), id);
        Ok(id)
    }

    fn function_node(
        &mut self,
        function: Arc<dyn CalculationFunction>,
        output: &ValueSpecification,
        inputs: Vec<ValueSpecification>,
    ) -> NodeId {
        let key = (function.function_id().to_string(), output.target.clone());
        if let Some(&id) = self.function_nodes.get(&key) {
            let node = &mut self.nodes[id.0];
            if !node.outputs.contains(output) {
                node.outputs.push(output.clone());
            }
            for input in inputs {
                if !node.inputs.contains(&input) {
                    node.inputs.push(input);
                }
            }
            return id;
        }

        let id = NodeId(self.nodes.len());
        let mut unique_inputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            if !unique_inputs.contains(&input) {
                unique_inputs.push(input);
            }
        }
        self.nodes.push(DependencyNode {
            id,
            target: output.target.clone(),
            kind: NodeKind::Function(function),
            inputs: unique_inputs,
            outputs: vec![output.clone()],
        });
        self.function_nodes.insert(key, id);
        id
    }

    fn finish(
        self,
        name: String,
        terminal_outputs: Vec<ValueSpecification>,
    ) -> EngineResult<DependencyGraph> {
        let mut graph = DiGraph::with_capacity(self.nodes.len(), self.nodes.len());
        for node in &self.nodes {
            graph.add_node(node.id);
        }

        let mut dependencies = vec![Vec::new(); self.nodes.len()];
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            let mut producers: Vec<NodeId> = node
                .inputs
                .iter()
                .map(|input| {
                    self.resolved.get(input).copied().ok_or_else(|| {
                        EngineError::Internal(format!("unresolved input {}", input))
                    })
                })
                .collect::<EngineResult<_>>()?;
            producers.sort();
            producers.dedup();
            for producer in &producers {
                graph.add_edge(NodeIndex::new(producer.0), NodeIndex::new(node.id.0), ());
                dependents[producer.0].push(node.id);
            }
            dependencies[node.id.0] = producers;
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let node = &self.nodes[cycle.node_id().index()];
            let mut path = node.outputs.clone();
            path.extend(node.outputs.first().cloned());
            EngineError::CyclicDependency { path }
        })?;
        let order = order.into_iter().map(|idx| graph[idx]).collect();

        let market_data_requirements = self
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::MarketData(key) => Some(key.clone()),
                NodeKind::Function(_) => None,
            })
            .collect();

        let mut producers = HashMap::new();
        for node in &self.nodes {
            for output in &node.outputs {
                producers.insert(output.clone(), node.id);
            }
        }

        Ok(DependencyGraph {
            name,
            nodes: self.nodes,
            graph,
            producers,
            dependencies,
            dependents,
            order,
            terminal_outputs,
            market_data_requirements,
        })
    }
}

// =============================================================================
// GRAPH COMPILER
// =============================================================================

#[derive(Clone, PartialEq, Eq, Hash)]
struct GraphKey {
    definition: ViewDefinition,
    availability: u64,
}

struct CompiledGraphCache {
    capacity: usize,
    order: VecDeque<GraphKey>,
    entries: HashMap<GraphKey, Arc<DependencyGraph>>,
}

/// Compiles view definitions against a function registry, caching the results.
///
/// The cache is bounded and evicts the oldest compiled graph first.
pub struct GraphCompiler {
    registry: Arc<dyn FunctionRegistry>,
    cache: Mutex<CompiledGraphCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GraphCompiler {
    /// Create a compiler keeping at most `cache_size` compiled graphs.
    pub fn new(registry: Arc<dyn FunctionRegistry>, cache_size: usize) -> Self {
        Self {
            registry,
            cache: Mutex::new(CompiledGraphCache {
                capacity: cache_size.max(1),
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The registry functions are resolved from.
    pub fn registry(&self) -> &Arc<dyn FunctionRegistry> {
        &self.registry
    }

    /// Compile through the cache.
    ///
    /// A hit returns the previously compiled graph. Compilation errors are
    /// not cached.
    pub fn compile(
        &self,
        definition: &ViewDefinition,
        availability: &dyn MarketDataAvailability,
    ) -> EngineResult<Arc<DependencyGraph>> {
        let key = GraphKey {
            definition: definition.clone(),
            availability: availability.fingerprint(),
        };

        if let Some(graph) = self.cache.lock().entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(view = %definition.name, "Compiled graph cache hit");
            return Ok(graph.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let graph = Arc::new(self.compile_uncached(definition, availability)?);

        let mut cache = self.cache.lock();
        if let Some(existing) = cache.entries.get(&key) {
            return Ok(existing.clone());
        }
        cache.order.push_back(key.clone());
        cache.entries.insert(key, graph.clone());
        while cache.order.len() > cache.capacity {
            if let Some(evicted) = cache.order.pop_front() {
                cache.entries.remove(&evicted);
            }
        }
        Ok(graph)
    }

    /// Compile without consulting or filling the cache.
    pub fn compile_uncached(
        &self,
        definition: &ViewDefinition,
        availability: &dyn MarketDataAvailability,
    ) -> EngineResult<DependencyGraph> {
        let terminal_outputs = definition.terminal_requirements();
        let mut builder = GraphBuilder::new(self.registry.as_ref(), availability);
        for requirement in &terminal_outputs {
            builder.resolve(requirement)?;
        }
        let graph = builder.finish(definition.name.clone(), terminal_outputs)?;

        tracing::debug!(
            view = %definition.name,
            nodes = graph.len(),
            edges = graph.edge_count(),
            market_data = graph.market_data_requirements().len(),
            "Dependency graph compiled"
        );
        Ok(graph)
    }

    /// Drop every compiled graph.
    pub fn invalidate_all(&self) {
        let mut cache = self.cache.lock();
        let dropped = cache.entries.len();
        cache.entries.clear();
        cache.order.clear();
        tracing::debug!(dropped, "Compiled graph cache invalidated");
    }

    /// Number of cached graphs.
    pub fn cached_graphs(&self) -> usize {
        self.cache.lock().entries.len()
    }

    /// Cache hits and misses so far.
    pub fn cache_counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
