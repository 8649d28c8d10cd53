//! Per-cycle computation cache.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use lattice_traits::{ComputationTarget, ComputedValue, DataValue, ValueSpecification};

use crate::error::{EngineError, EngineResult};

/// Cached value with timing metadata.
#[derive(Debug, Clone)]
pub struct CachedValue {
    /// The cached value
    pub value: DataValue,
    /// When this was computed
    pub computed_at: DateTime<Utc>,
    /// Time spent producing it, in microseconds
    pub compute_time_us: u64,
}

/// Write-once store of the values computed by one view cycle.
///
/// A cache belongs to exactly one cycle. Concurrent writers of the same
/// specification race on the map entry; exactly one of them succeeds.
#[derive(Debug, Default)]
pub struct ComputationCache {
    values: DashMap<ValueSpecification, CachedValue>,
}

impl ComputationCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value. Fails with [`EngineError::DuplicateValue`] if the
    /// specification already holds one.
    pub fn put(
        &self,
        specification: ValueSpecification,
        value: DataValue,
        compute_time_us: u64,
    ) -> EngineResult<()> {
        if value.is_missing() {
            return Err(EngineError::Internal(format!(
                "refusing to cache missing sentinel for {}",
                specification
            )));
        }
        match self.values.entry(specification) {
            Entry::Occupied(entry) => Err(EngineError::DuplicateValue(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(CachedValue {
                    value,
                    computed_at: Utc::now(),
                    compute_time_us,
                });
                Ok(())
            }
        }
    }

    /// Store a computed value.
    pub fn put_value(&self, value: ComputedValue, compute_time_us: u64) -> EngineResult<()> {
        self.put(value.specification, value.value, compute_time_us)
    }

    /// Get a value.
    pub fn get(&self, specification: &ValueSpecification) -> EngineResult<DataValue> {
        self.values
            .get(specification)
            .map(|c| c.value.clone())
            .ok_or_else(|| EngineError::ValueNotFound(specification.clone()))
    }

    /// Get a value with its metadata.
    pub fn get_cached(&self, specification: &ValueSpecification) -> Option<CachedValue> {
        self.values.get(specification).map(|c| c.clone())
    }

    /// Check whether a specification has a value.
    pub fn contains(&self, specification: &ValueSpecification) -> bool {
        self.values.contains_key(specification)
    }

    /// Values for the given specifications; absent ones are skipped.
    pub fn get_many(&self, specifications: &[ValueSpecification]) -> Vec<ComputedValue> {
        specifications
            .iter()
            .filter_map(|spec| {
                self.values
                    .get(spec)
                    .map(|c| ComputedValue::new(spec.clone(), c.value.clone()))
            })
            .collect()
    }

    /// All values computed for one target, ordered by specification.
    pub fn values_for_target(&self, target: &ComputationTarget) -> Vec<ComputedValue> {
        self.query(|t| t == target)
    }

    /// All values whose target matches the predicate, ordered by specification.
    pub fn query<F>(&self, predicate: F) -> Vec<ComputedValue>
    where
        F: Fn(&ComputationTarget) -> bool,
    {
        let mut out: Vec<ComputedValue> = self
            .values
            .iter()
            .filter(|entry| predicate(&entry.key().target))
            .map(|entry| ComputedValue::new(entry.key().clone(), entry.value().value.clone()))
            .collect();
        out.sort_by(|a, b| a.specification.cmp(&b.specification));
        out
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing has been cached.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(target: &str, name: &str) -> ValueSpecification {
        ValueSpecification::new(ComputationTarget::position(target), name)
    }

    #[test]
    fn test_put_is_write_once() {
        let cache = ComputationCache::new();
        cache.put(spec("P1", "PV"), DataValue::Float(1.0), 5).unwrap();

        let err = cache.put(spec("P1", "PV"), DataValue::Float(2.0), 5);
        assert!(matches!(err, Err(EngineError::DuplicateValue(_))));
        assert_eq!(cache.get(&spec("P1", "PV")).unwrap(), DataValue::Float(1.0));
        assert_eq!(cache.get_cached(&spec("P1", "PV")).unwrap().compute_time_us, 5);
    }

    #[test]
    fn test_missing_sentinel_never_cached() {
        let cache = ComputationCache::new();
        assert!(cache.put(spec("P1", "PV"), DataValue::Missing, 0).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let cache = ComputationCache::new();
        assert!(matches!(
            cache.get(&spec("P1", "PV")),
            Err(EngineError::ValueNotFound(_))
        ));
    }

    #[test]
    fn test_queries() {
        let cache = ComputationCache::new();
        cache.put(spec("P1", "PV"), DataValue::Float(1.0), 0).unwrap();
        cache.put(spec("P1", "DV01"), DataValue::Float(0.1), 0).unwrap();
        cache.put(spec("P2", "PV"), DataValue::Float(2.0), 0).unwrap();

        let p1 = cache.values_for_target(&ComputationTarget::position("P1"));
        assert_eq!(p1.len(), 2);
        assert_eq!(p1[0].specification.value_name, "DV01");

        let many = cache.get_many(&[spec("P2", "PV"), spec("P3", "PV")]);
        assert_eq!(many.len(), 1);

        assert_eq!(cache.query(|_| true).len(), 3);
    }

    #[test]
    fn test_concurrent_writers_one_wins() {
        let cache = ComputationCache::new();
        let wins = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for i in 0..8 {
                let cache = &cache;
                let wins = &wins;
                s.spawn(move || {
                    if cache
                        .put(spec("P1", "PV"), DataValue::Float(i as f64), 0)
                        .is_ok()
                    {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }
}
