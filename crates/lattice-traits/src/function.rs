//! Calculation function contracts.
//!
//! Functions are capability-tagged: each declares the target kinds it applies
//! to and the value names it produces. The graph compiler selects a function
//! by matching kind and value name, asks it for the inputs a given output
//! requires, and never looks inside it.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::target::{ComputationTarget, ComputationTargetKind};
use crate::value::{ComputedValue, DataValue, ValueSpecification};

// =============================================================================
// FUNCTION ERROR
// =============================================================================

/// Error raised by a calculation function.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FunctionError {
    /// A declared input was not supplied
    #[error("missing input: {0}")]
    MissingInput(String),

    /// An input had an unusable value
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The calculation itself failed
    #[error("calculation failed: {0}")]
    Calculation(String),
}

// =============================================================================
// FUNCTION INPUTS
// =============================================================================

/// Input values handed to a function invocation.
#[derive(Debug, Clone, Default)]
pub struct FunctionInputs {
    values: BTreeMap<ValueSpecification, DataValue>,
}

impl FunctionInputs {
    /// Build from computed values.
    pub fn new(values: impl IntoIterator<Item = ComputedValue>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|v| (v.specification, v.value))
                .collect(),
        }
    }

    /// Gets the input for an exact specification.
    pub fn get(&self, specification: &ValueSpecification) -> Option<&DataValue> {
        self.values.get(specification)
    }

    /// Gets the first input with the given value name.
    pub fn by_name(&self, value_name: &str) -> Option<&DataValue> {
        self.values
            .iter()
            .find(|(spec, _)| spec.value_name == value_name)
            .map(|(_, v)| v)
    }

    /// Numeric input by value name, or a [`FunctionError::MissingInput`].
    pub fn f64_by_name(&self, value_name: &str) -> Result<f64, FunctionError> {
        let value = self
            .by_name(value_name)
            .ok_or_else(|| FunctionError::MissingInput(value_name.to_string()))?;
        value
            .as_f64()
            .ok_or_else(|| FunctionError::InvalidInput(format!("{} is not numeric", value_name)))
    }

    /// Iterates over all inputs.
    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &DataValue)> {
        self.values.iter()
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no inputs.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// =============================================================================
// CALCULATION FUNCTION
// =============================================================================

/// A producer of values for targets of particular kinds.
pub trait CalculationFunction: Send + Sync {
    /// Unique function identifier.
    fn function_id(&self) -> &str;

    /// Target kinds this function applies to.
    fn target_kinds(&self) -> &[ComputationTargetKind];

    /// Value names this function produces.
    fn value_names(&self) -> &[String];

    /// Whether the function can produce values for the target.
    fn can_apply_to(&self, target: &ComputationTarget) -> bool {
        self.target_kinds().contains(&target.kind)
    }

    /// Whether the function produces the value name.
    fn produces(&self, value_name: &str) -> bool {
        self.value_names().iter().any(|n| n == value_name)
    }

    /// Input specifications required to produce `output`.
    fn requirements(&self, output: &ValueSpecification) -> Vec<ValueSpecification>;

    /// Computes `outputs` for `target` from `inputs`.
    ///
    /// May block on external calculation or I/O. Every specification in
    /// `outputs` is expected back; extra values are ignored by the engine.
    fn execute(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        outputs: &[ValueSpecification],
    ) -> Result<Vec<ComputedValue>, FunctionError>;
}

impl std::fmt::Debug for dyn CalculationFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationFunction")
            .field("function_id", &self.function_id())
            .field("target_kinds", &self.target_kinds())
            .field("value_names", &self.value_names())
            .finish()
    }
}

// =============================================================================
// FUNCTION REGISTRY
// =============================================================================

/// Resolves value requirements to the functions that produce them.
pub trait FunctionRegistry: Send + Sync {
    /// Returns the function that produces `requirement`, if any.
    ///
    /// Resolution must be deterministic for a fixed registry.
    fn resolve(&self, requirement: &ValueSpecification) -> Option<Arc<dyn CalculationFunction>>;

    /// All registered functions, in resolution order.
    fn functions(&self) -> Vec<Arc<dyn CalculationFunction>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueSpecification;

    #[test]
    fn test_inputs_lookup_by_name() {
        let target = ComputationTarget::position("P1");
        let inputs = FunctionInputs::new(vec![
            ComputedValue::new(ValueSpecification::new(target.clone(), "DF"), 0.95),
            ComputedValue::new(ValueSpecification::new(target.clone(), "CF"), "bad"),
        ]);

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.f64_by_name("DF"), Ok(0.95));
        assert!(matches!(
            inputs.f64_by_name("CF"),
            Err(FunctionError::InvalidInput(_))
        ));
        assert!(matches!(
            inputs.f64_by_name("FX"),
            Err(FunctionError::MissingInput(_))
        ));
    }
}
