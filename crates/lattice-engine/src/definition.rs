//! View definitions and cycle execution options.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lattice_traits::{ComputationTarget, ComputationTargetKind, ValueProperties, ValueSpecification};

/// A value the view asks for on every admitted target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestedValue {
    /// Value name
    pub value_name: String,
    /// Required properties
    #[serde(default)]
    pub properties: ValueProperties,
    /// Target kinds the request applies to; all kinds when absent
    #[serde(default)]
    pub target_kinds: Option<Vec<ComputationTargetKind>>,
}

impl RequestedValue {
    /// Request a value name on every target.
    pub fn new(value_name: impl Into<String>) -> Self {
        Self {
            value_name: value_name.into(),
            properties: ValueProperties::new(),
            target_kinds: None,
        }
    }

    /// Require properties.
    pub fn with_properties(mut self, properties: ValueProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Restrict the request to target kinds.
    pub fn for_kinds(mut self, kinds: impl IntoIterator<Item = ComputationTargetKind>) -> Self {
        self.target_kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Whether the request applies to a target.
    pub fn admits(&self, target: &ComputationTarget) -> bool {
        self.target_kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&target.kind))
    }
}

/// What a cycle's result model publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultModelDefinition {
    /// Publish non-terminal function outputs as well as requested values
    #[serde(default)]
    pub include_intermediates: bool,
    /// Publish the market data the cycle consumed
    #[serde(default = "default_true")]
    pub include_market_data: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ResultModelDefinition {
    fn default() -> Self {
        Self {
            include_intermediates: false,
            include_market_data: true,
        }
    }
}

/// Target universe plus the values requested over it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// View name
    pub name: String,
    /// Targets, in definition order
    pub universe: Vec<ComputationTarget>,
    /// Requested values
    pub requested: Vec<RequestedValue>,
    /// Result publication options
    #[serde(default)]
    pub result_model: ResultModelDefinition,
}

impl ViewDefinition {
    /// Empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            universe: Vec::new(),
            requested: Vec::new(),
            result_model: ResultModelDefinition::default(),
        }
    }

    /// Add a target.
    pub fn with_target(mut self, target: ComputationTarget) -> Self {
        self.universe.push(target);
        self
    }

    /// Add targets.
    pub fn with_targets(mut self, targets: impl IntoIterator<Item = ComputationTarget>) -> Self {
        self.universe.extend(targets);
        self
    }

    /// Add a requested value.
    pub fn with_requested(mut self, requested: RequestedValue) -> Self {
        self.requested.push(requested);
        self
    }

    /// Request a value name on every target.
    pub fn requesting(self, value_name: impl Into<String>) -> Self {
        self.with_requested(RequestedValue::new(value_name))
    }

    /// Set result publication options.
    pub fn with_result_model(mut self, result_model: ResultModelDefinition) -> Self {
        self.result_model = result_model;
        self
    }

    /// Terminal requirements in definition order (targets outer, requests inner), deduplicated.
    pub fn terminal_requirements(&self) -> Vec<ValueSpecification> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for target in &self.universe {
            for requested in self.requested.iter().filter(|r| r.admits(target)) {
                let spec = ValueSpecification::with_properties(
                    target.clone(),
                    requested.value_name.clone(),
                    requested.properties.clone(),
                );
                if seen.insert(spec.clone()) {
                    out.push(spec);
                }
            }
        }
        out
    }
}

/// Time parameters of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewCycleExecutionOptions {
    /// Instant the values are computed for
    pub valuation_time: DateTime<Utc>,
    /// Instant the input data is taken as of
    pub input_data_time: DateTime<Utc>,
}

impl ViewCycleExecutionOptions {
    /// Both times set to now.
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    /// Both times set to `time`.
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            valuation_time: time,
            input_data_time: time,
        }
    }

    /// Override the input-data time.
    pub fn with_input_data_time(mut self, input_data_time: DateTime<Utc>) -> Self {
        self.input_data_time = input_data_time;
        self
    }
}

impl Default for ViewCycleExecutionOptions {
    fn default() -> Self {
        Self::now()
    }
}
