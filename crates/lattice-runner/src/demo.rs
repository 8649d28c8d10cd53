//! Demo functions and market data for the runner.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use lattice_engine::{EngineResult, FnCalculationFunction, FunctionRepository, ViewDefinition};
use lattice_traits::{
    ComputationTarget, ComputationTargetKind, DataValue, FunctionError, MarketDataKey,
};

/// DF from the position's rate and maturity, CF from notional and coupon, PV = DF * CF.
pub fn demo_repository() -> EngineResult<FunctionRepository> {
    FunctionRepository::new()
        .with_function(
            FnCalculationFunction::new("discount-factor", [ComputationTargetKind::Position], ["DF"])
                .with_inputs(["Rate", "Maturity"])
                .with_value_fn(|_, inputs, _| {
                    let rate = inputs.f64_by_name("Rate")?;
                    let maturity = inputs.f64_by_name("Maturity")?;
                    if rate <= -1.0 {
                        return Err(FunctionError::InvalidInput(format!("rate {} out of range", rate)));
                    }
                    Ok(DataValue::Float((1.0 + rate).powf(-maturity)))
                }),
        )?
        .with_function(
            FnCalculationFunction::new("cashflow", [ComputationTargetKind::Position], ["CF"])
                .with_inputs(["Notional", "Coupon"])
                .with_value_fn(|_, inputs, _| {
                    let notional = decimal_input(inputs.by_name("Notional"), "Notional")?;
                    let coupon = decimal_input(inputs.by_name("Coupon"), "Coupon")?;
                    Ok(DataValue::Decimal(notional * coupon))
                }),
        )?
        .with_function(
            FnCalculationFunction::new("present-value", [ComputationTargetKind::Position], ["PV"])
                .with_inputs(["DF", "CF"])
                .with_value_fn(|_, inputs, _| {
                    let df = Decimal::from_f64(inputs.f64_by_name("DF")?)
                        .ok_or_else(|| FunctionError::InvalidInput("DF is not finite".into()))?;
                    let cf = decimal_input(inputs.by_name("CF"), "CF")?;
                    Ok(DataValue::Decimal((df * cf).round_dp(2)))
                }),
        )
}

fn decimal_input(value: Option<&DataValue>, name: &str) -> Result<Decimal, FunctionError> {
    value
        .ok_or_else(|| FunctionError::MissingInput(name.to_string()))?
        .as_decimal()
        .ok_or_else(|| FunctionError::InvalidInput(format!("{} is not numeric", name)))
}

/// Demo position `P{i}`.
pub fn position(i: usize) -> ComputationTarget {
    ComputationTarget::position(format!("P{}", i))
}

/// PV and CF for `positions` positions.
pub fn demo_definition(positions: usize) -> ViewDefinition {
    ViewDefinition::new("demo-pv")
        .with_targets((1..=positions).map(position))
        .requesting("PV")
        .requesting("CF")
}

/// Market data for every demo position, with `rate_bump` added to each rate.
pub fn demo_market_data(positions: usize, rate_bump: f64) -> Vec<(MarketDataKey, DataValue)> {
    (1..=positions)
        .flat_map(|i| {
            let target = position(i);
            vec![
                (
                    MarketDataKey::new(target.clone(), "Rate"),
                    DataValue::Float(0.04 + 0.0025 * (i - 1) as f64 + rate_bump),
                ),
                (
                    MarketDataKey::new(target.clone(), "Maturity"),
                    DataValue::Float(i as f64),
                ),
                (
                    MarketDataKey::new(target.clone(), "Notional"),
                    DataValue::Decimal(Decimal::from(1_000_000 * i as u64)),
                ),
                (
                    MarketDataKey::new(target, "Coupon"),
                    DataValue::Decimal(Decimal::new(5, 2)),
                ),
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lattice_engine::{
        DependencyGraphExecutor, ExecutionControl, GraphCompiler, SingleThreadedExecutor, Snapshot,
    };
    use lattice_traits::ValueSpecification;
    use rust_decimal_macros::dec;

    #[test]
    fn test_demo_graph_values() {
        let snapshot = Snapshot::open_live();
        snapshot.add_values(demo_market_data(2, 0.0)).unwrap();
        snapshot.mark_complete().unwrap();

        let graph = GraphCompiler::new(Arc::new(demo_repository().unwrap()), 1)
            .compile(&demo_definition(2), &snapshot)
            .unwrap();
        // 3 functions and 4 market data nodes per position
        assert_eq!(graph.len(), 14);

        let outcome = SingleThreadedExecutor::new().execute(&graph, &snapshot, &ExecutionControl::new());
        assert!(outcome.failures.is_empty());

        let cf = outcome
            .cache
            .get(&ValueSpecification::new(position(2), "CF"))
            .unwrap();
        assert_eq!(cf.as_decimal(), Some(dec!(100000.00)));

        let pv = outcome
            .cache
            .get(&ValueSpecification::new(position(1), "PV"))
            .unwrap()
            .as_f64()
            .unwrap();
        assert!((pv - 50_000.0 / 1.04).abs() < 0.01);
    }

    #[test]
    fn test_market_data_shape() {
        let data = demo_market_data(3, 0.01);
        assert_eq!(data.len(), 12);
        let rate = data[0].1.as_f64().unwrap();
        assert!((rate - 0.05).abs() < 1e-12);
    }
}
