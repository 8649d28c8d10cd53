//! Value model: specifications, payloads and computed values.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::target::ComputationTarget;

// =============================================================================
// VALUE PROPERTIES
// =============================================================================

/// Ordered set of key/value constraints on a value (e.g. `currency=USD`).
#[derive(Debug, Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueProperties(BTreeMap<String, String>);

impl ValueProperties {
    /// Empty property set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a property, replacing any previous value for the key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Gets a property value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns true if no properties are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates properties in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ValueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        f.write_str("}")
    }
}

// =============================================================================
// VALUE SPECIFICATION
// =============================================================================

/// Identifies exactly one value: target, value name and properties.
///
/// Two specifications are equal iff all fields match. Within one cycle's
/// cache a specification holds at most one value.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ValueSpecification {
    /// What the value is about
    pub target: ComputationTarget,
    /// Value name (e.g. "PV", "DiscountFactor")
    pub value_name: String,
    /// Property constraints
    pub properties: ValueProperties,
}

impl ValueSpecification {
    /// Create a specification with no properties.
    pub fn new(target: ComputationTarget, value_name: impl Into<String>) -> Self {
        Self {
            target,
            value_name: value_name.into(),
            properties: ValueProperties::new(),
        }
    }

    /// Create a specification with properties.
    pub fn with_properties(
        target: ComputationTarget,
        value_name: impl Into<String>,
        properties: ValueProperties,
    ) -> Self {
        Self {
            target,
            value_name: value_name.into(),
            properties,
        }
    }

    /// The external input key this specification would be sourced from.
    pub fn market_data_key(&self) -> MarketDataKey {
        MarketDataKey::new(self.target.clone(), self.value_name.clone())
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)?;
        if !self.properties.is_empty() {
            write!(f, "{}", self.properties)?;
        }
        Ok(())
    }
}

// =============================================================================
// MARKET DATA KEY
// =============================================================================

/// External input identifier: a field of a target (e.g. `MarketValue` of a ticker).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MarketDataKey {
    /// Target the field belongs to
    pub target: ComputationTarget,
    /// Field name
    pub field: String,
}

impl MarketDataKey {
    /// Create a new key.
    pub fn new(target: ComputationTarget, field: impl Into<String>) -> Self {
        Self {
            target,
            field: field.into(),
        }
    }

    /// The value specification under which the key is published into a cache.
    pub fn to_specification(&self) -> ValueSpecification {
        ValueSpecification::new(self.target.clone(), self.field.clone())
    }
}

impl fmt::Display for MarketDataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.field)
    }
}

// =============================================================================
// DATA VALUE
// =============================================================================

/// Opaque value payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    /// Decimal value (prices, amounts)
    Decimal(Decimal),
    /// Floating point value (factors, sensitivities)
    Float(f64),
    /// Text value
    Text(String),
    /// Structured value
    Json(serde_json::Value),
    /// Sentinel for an external input that was expected but not available.
    Missing,
}

impl DataValue {
    /// Returns true for the missing-input sentinel.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Decimal(d) => d.to_f64(),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Decimal view of the value, if it has one.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            Self::Float(f) => Decimal::from_f64_retain(*f),
            _ => None,
        }
    }
}

impl From<Decimal> for DataValue {
    fn from(d: Decimal) -> Self {
        Self::Decimal(d)
    }
}

impl From<f64> for DataValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decimal(d) => write!(f, "{}", d),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => f.write_str(s),
            Self::Json(v) => write!(f, "{}", v),
            Self::Missing => f.write_str("<missing>"),
        }
    }
}

// =============================================================================
// COMPUTED VALUE
// =============================================================================

/// A value together with the specification it satisfies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    /// Which value
    pub specification: ValueSpecification,
    /// The payload
    pub value: DataValue,
}

impl ComputedValue {
    /// Create a new computed value.
    pub fn new(specification: ValueSpecification, value: impl Into<DataValue>) -> Self {
        Self {
            specification,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_specification_equality_includes_properties() {
        let target = ComputationTarget::position("P1");
        let usd = ValueSpecification::with_properties(
            target.clone(),
            "PV",
            ValueProperties::new().with("currency", "USD"),
        );
        let eur = ValueSpecification::with_properties(
            target.clone(),
            "PV",
            ValueProperties::new().with("currency", "EUR"),
        );
        assert_ne!(usd, eur);
        assert_eq!(usd, usd.clone());
        assert_eq!(usd.to_string(), "PV[POSITION:P1]{currency=USD}");
    }

    #[test]
    fn test_market_data_key_round_trip() {
        let key = MarketDataKey::new(ComputationTarget::primitive("USD.SOFR.2Y"), "MarketValue");
        let spec = key.to_specification();
        assert_eq!(spec.market_data_key(), key);
    }

    #[test]
    fn test_data_value_numeric_views() {
        assert_eq!(DataValue::from(dec!(1.5)).as_f64(), Some(1.5));
        assert_eq!(DataValue::Float(2.0).as_decimal(), Some(dec!(2)));
        assert_eq!(DataValue::from("x").as_f64(), None);
        assert!(DataValue::Missing.is_missing());
    }
}
