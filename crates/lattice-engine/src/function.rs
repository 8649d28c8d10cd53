//! In-memory function repository and closure-backed functions.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use lattice_traits::{
    CalculationFunction, ComputationTarget, ComputationTargetKind, ComputedValue, DataValue,
    FunctionError, FunctionInputs, FunctionRegistry, ValueSpecification,
};

use crate::error::{EngineError, EngineResult};

type RequirementsFn = dyn Fn(&ValueSpecification) -> Vec<ValueSpecification> + Send + Sync;
type ComputeFn = dyn Fn(&ComputationTarget, &FunctionInputs, &[ValueSpecification]) -> Result<Vec<ComputedValue>, FunctionError>
    + Send
    + Sync;
type AppliesToFn = dyn Fn(&ComputationTarget) -> bool + Send + Sync;

// =============================================================================
// FN CALCULATION FUNCTION
// =============================================================================

/// Calculation function assembled from closures.
///
/// ```ignore
/// let df = FnCalculationFunction::new("discount", [ComputationTargetKind::Position], ["DF"])
///     .with_inputs(["Rate"])
///     .with_value_fn(|_, inputs, _| Ok(DataValue::Float((-inputs.f64_by_name("Rate")?).exp())));
/// ```
pub struct FnCalculationFunction {
    function_id: String,
    target_kinds: Vec<ComputationTargetKind>,
    value_names: Vec<String>,
    requirements: Box<RequirementsFn>,
    compute: Box<ComputeFn>,
    applies_to: Option<Box<AppliesToFn>>,
}

impl FnCalculationFunction {
    /// Function with no inputs whose computation fails until one is supplied.
    pub fn new<K, N, S>(function_id: impl Into<String>, target_kinds: K, value_names: N) -> Self
    where
        K: IntoIterator<Item = ComputationTargetKind>,
        N: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let function_id = function_id.into();
        let missing = function_id.clone();
        Self {
            function_id,
            target_kinds: target_kinds.into_iter().collect(),
            value_names: value_names.into_iter().map(Into::into).collect(),
            requirements: Box::new(|_| Vec::new()),
            compute: Box::new(move |_, _, _| {
                Err(FunctionError::Calculation(format!(
                    "{} has no computation",
                    missing
                )))
            }),
            applies_to: None,
        }
    }

    /// Inputs are the named values on the output's own target.
    pub fn with_inputs<N, S>(self, value_names: N) -> Self
    where
        N: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = value_names.into_iter().map(Into::into).collect();
        self.with_requirements(move |output| {
            names
                .iter()
                .map(|name| ValueSpecification::new(output.target.clone(), name.clone()))
                .collect()
        })
    }

    /// Arbitrary input requirements per output.
    pub fn with_requirements<F>(mut self, f: F) -> Self
    where
        F: Fn(&ValueSpecification) -> Vec<ValueSpecification> + Send + Sync + 'static,
    {
        self.requirements = Box::new(f);
        self
    }

    /// Computation producing all requested outputs at once.
    pub fn with_compute<F>(mut self, f: F) -> Self
    where
        F: Fn(
                &ComputationTarget,
                &FunctionInputs,
                &[ValueSpecification],
            ) -> Result<Vec<ComputedValue>, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.compute = Box::new(f);
        self
    }

    /// Computation invoked once per requested output.
    pub fn with_value_fn<F>(self, f: F) -> Self
    where
        F: Fn(&ComputationTarget, &FunctionInputs, &ValueSpecification) -> Result<DataValue, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.with_compute(move |target, inputs, outputs| {
            outputs
                .iter()
                .map(|output| Ok(ComputedValue::new(output.clone(), f(target, inputs, output)?)))
                .collect()
        })
    }

    /// Narrows applicability beyond the target kind check.
    pub fn with_applies_to<F>(mut self, f: F) -> Self
    where
        F: Fn(&ComputationTarget) -> bool + Send + Sync + 'static,
    {
        self.applies_to = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for FnCalculationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCalculationFunction")
            .field("function_id", &self.function_id)
            .field("target_kinds", &self.target_kinds)
            .field("value_names", &self.value_names)
            .finish()
    }
}

impl CalculationFunction for FnCalculationFunction {
    fn function_id(&self) -> &str {
        &self.function_id
    }

    fn target_kinds(&self) -> &[ComputationTargetKind] {
        &self.target_kinds
    }

    fn value_names(&self) -> &[String] {
        &self.value_names
    }

    fn can_apply_to(&self, target: &ComputationTarget) -> bool {
        self.target_kinds.contains(&target.kind)
            && self.applies_to.as_ref().map_or(true, |f| f(target))
    }

    fn requirements(&self, output: &ValueSpecification) -> Vec<ValueSpecification> {
        (self.requirements)(output)
    }

    fn execute(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        outputs: &[ValueSpecification],
    ) -> Result<Vec<ComputedValue>, FunctionError> {
        (self.compute)(target, inputs, outputs)
    }
}

// =============================================================================
// FUNCTION REPOSITORY
// =============================================================================

/// Ordered in-memory function registry.
///
/// Resolution picks the first registered function that applies to the
/// requirement's target and produces its value name.
#[derive(Default)]
pub struct FunctionRepository {
    functions: Vec<Arc<dyn CalculationFunction>>,
    ids: HashSet<String>,
}

impl FunctionRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. Function ids must be unique.
    pub fn register(&mut self, function: impl CalculationFunction + 'static) -> EngineResult<()> {
        self.register_arc(Arc::new(function))
    }

    /// Register a shared function.
    pub fn register_arc(&mut self, function: Arc<dyn CalculationFunction>) -> EngineResult<()> {
        if !self.ids.insert(function.function_id().to_string()) {
            return Err(EngineError::ConfigError(format!(
                "duplicate function id: {}",
                function.function_id()
            )));
        }
        self.functions.push(function);
        Ok(())
    }

    /// Builder-style registration.
    pub fn with_function(mut self, function: impl CalculationFunction + 'static) -> EngineResult<Self> {
        self.register(function)?;
        Ok(self)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FunctionRegistry for FunctionRepository {
    fn resolve(&self, requirement: &ValueSpecification) -> Option<Arc<dyn CalculationFunction>> {
        self.functions
            .iter()
            .find(|f| f.can_apply_to(&requirement.target) && f.produces(&requirement.value_name))
            .cloned()
    }

    fn functions(&self) -> Vec<Arc<dyn CalculationFunction>> {
        self.functions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv_function(id: &str) -> FnCalculationFunction {
        FnCalculationFunction::new(id, [ComputationTargetKind::Position], ["PV"])
            .with_inputs(["DF", "CF"])
            .with_value_fn(|_, inputs, _| {
                Ok(DataValue::Float(
                    inputs.f64_by_name("DF")? * inputs.f64_by_name("CF")?,
                ))
            })
    }

    #[test]
    fn test_resolve_by_kind_and_name() {
        let repo = FunctionRepository::new().with_function(pv_function("pv")).unwrap();

        let position = ValueSpecification::new(ComputationTarget::position("P1"), "PV");
        let security = ValueSpecification::new(ComputationTarget::security("S1"), "PV");
        let other = ValueSpecification::new(ComputationTarget::position("P1"), "DV01");

        assert_eq!(repo.resolve(&position).unwrap().function_id(), "pv");
        assert!(repo.resolve(&security).is_none());
        assert!(repo.resolve(&other).is_none());
    }

    #[test]
    fn test_first_registered_wins() {
        let mut repo = FunctionRepository::new();
        repo.register(pv_function("first")).unwrap();
        repo.register(pv_function("second")).unwrap();

        let spec = ValueSpecification::new(ComputationTarget::position("P1"), "PV");
        assert_eq!(repo.resolve(&spec).unwrap().function_id(), "first");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut repo = FunctionRepository::new();
        repo.register(pv_function("pv")).unwrap();
        assert!(matches!(
            repo.register(pv_function("pv")),
            Err(EngineError::ConfigError(_))
        ));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_requirements_and_execute() {
        let f = pv_function("pv");
        let target = ComputationTarget::position("P1");
        let output = ValueSpecification::new(target.clone(), "PV");

        let reqs = f.requirements(&output);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].value_name, "DF");

        let inputs = FunctionInputs::new(vec![
            ComputedValue::new(reqs[0].clone(), 0.5),
            ComputedValue::new(reqs[1].clone(), 100.0),
        ]);
        let out = f.execute(&target, &inputs, &[output.clone()]).unwrap();
        assert_eq!(out, vec![ComputedValue::new(output, 50.0)]);
    }

    #[test]
    fn test_applies_to_narrows() {
        let f = pv_function("pv").with_applies_to(|t| t.id.as_str().starts_with("BOND"));
        assert!(f.can_apply_to(&ComputationTarget::position("BOND-1")));
        assert!(!f.can_apply_to(&ComputationTarget::position("FX-1")));
    }
}
