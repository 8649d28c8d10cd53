//! Result models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;

use lattice_traits::{ComputationTarget, ComputedValue, ValueSpecification, ViewCycleId};

use crate::cache::ComputationCache;
use crate::definition::ResultModelDefinition;
use crate::executor::FailureReason;
use crate::graph::{DependencyGraph, NodeKind};

/// Read-only view of what one cycle published.
///
/// Values are grouped by target and keyed by value name, with non-empty
/// properties appended (`PV{currency=USD}`) so distinct specifications never
/// collide. Specifications that failed appear only in [`ResultModel::failures`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResultModel {
    cycle_id: ViewCycleId,
    view_name: String,
    valuation_time: DateTime<Utc>,
    values: BTreeMap<ComputationTarget, BTreeMap<String, ComputedValue>>,
    failures: BTreeMap<ValueSpecification, FailureReason>,
    market_data: Vec<ComputedValue>,
}

impl ResultModel {
    /// Build from an executed cycle.
    pub fn build(
        cycle_id: ViewCycleId,
        valuation_time: DateTime<Utc>,
        graph: &DependencyGraph,
        cache: &ComputationCache,
        failures: &BTreeMap<ValueSpecification, FailureReason>,
        definition: ResultModelDefinition,
    ) -> Self {
        let mut model = Self {
            cycle_id,
            view_name: graph.name().to_string(),
            valuation_time,
            values: BTreeMap::new(),
            failures: failures.clone(),
            market_data: Vec::new(),
        };

        for value in cache.get_many(graph.terminal_outputs()) {
            model.insert(value);
        }

        for node in graph.nodes() {
            match &node.kind {
                NodeKind::Function(_) if definition.include_intermediates => {
                    for value in cache.get_many(&node.outputs) {
                        model.insert(value);
                    }
                }
                NodeKind::MarketData(_) if definition.include_market_data => {
                    model.market_data.extend(cache.get_many(&node.outputs));
                }
                _ => {}
            }
        }
        model
            .market_data
            .sort_by(|a, b| a.specification.cmp(&b.specification));
        model
    }

    fn insert(&mut self, value: ComputedValue) {
        let key = result_key(&value.specification);
        self.values
            .entry(value.specification.target.clone())
            .or_default()
            .insert(key, value);
    }

    /// Cycle that produced the model.
    pub fn cycle_id(&self) -> &ViewCycleId {
        &self.cycle_id
    }

    /// View the cycle ran.
    pub fn view_name(&self) -> &str {
        &self.view_name
    }

    /// Valuation time of the cycle.
    pub fn valuation_time(&self) -> DateTime<Utc> {
        self.valuation_time
    }

    /// Targets with at least one value.
    pub fn targets(&self) -> impl Iterator<Item = &ComputationTarget> {
        self.values.keys()
    }

    /// Values for one target, keyed by value name.
    pub fn values_for(&self, target: &ComputationTarget) -> Option<&BTreeMap<String, ComputedValue>> {
        self.values.get(target)
    }

    /// One value.
    pub fn get(&self, target: &ComputationTarget, value_name: &str) -> Option<&ComputedValue> {
        self.values.get(target).and_then(|v| v.get(value_name))
    }

    /// All published values.
    pub fn all_values(&self) -> impl Iterator<Item = &ComputedValue> {
        self.values.values().flat_map(|v| v.values())
    }

    /// Number of published values.
    pub fn len(&self) -> usize {
        self.values.values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing was published.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Specifications that have no value, and why.
    pub fn failures(&self) -> &BTreeMap<ValueSpecification, FailureReason> {
        &self.failures
    }

    /// Market data the cycle consumed.
    pub fn market_data(&self) -> &[ComputedValue] {
        &self.market_data
    }

    /// Copy keeping only targets for which `keep` holds.
    pub fn retain_targets<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&ComputationTarget) -> bool,
    {
        let values = self
            .values
            .iter()
            .filter(|(target, _)| keep(target))
            .map(|(t, v)| (t.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>();
        let failures = self
            .failures
            .iter()
            .filter(|(spec, _)| keep(&spec.target))
            .map(|(s, r)| (s.clone(), r.clone()))
            .collect();
        let market_data = self
            .market_data
            .iter()
            .filter(|v| keep(&v.specification.target))
            .cloned()
            .collect();
        Self {
            cycle_id: self.cycle_id.clone(),
            view_name: self.view_name.clone(),
            valuation_time: self.valuation_time,
            values,
            failures,
            market_data,
        }
    }

    /// JSON rendering with targets and specifications as string keys.
    pub fn to_json(&self) -> serde_json::Value {
        let values: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(target, values)| {
                let inner: serde_json::Map<String, serde_json::Value> = values
                    .iter()
                    .map(|(name, v)| (name.clone(), serde_json::to_value(&v.value).unwrap_or_default()))
                    .collect();
                (target.to_string(), serde_json::Value::Object(inner))
            })
            .collect();
        let failures: serde_json::Map<String, serde_json::Value> = self
            .failures
            .iter()
            .map(|(spec, reason)| (spec.to_string(), json!(reason.to_string())))
            .collect();
        json!({
            "cycle_id": self.cycle_id.as_str(),
            "view": self.view_name,
            "valuation_time": self.valuation_time.to_rfc3339(),
            "values": values,
            "failures": failures,
            "market_data": self.market_data.len(),
        })
    }
}

fn result_key(specification: &ValueSpecification) -> String {
    if specification.properties.is_empty() {
        specification.value_name.clone()
    } else {
        format!("{}{}", specification.value_name, specification.properties)
    }
}
