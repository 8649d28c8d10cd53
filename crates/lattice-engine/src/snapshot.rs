//! Market data snapshots.
//!
//! A snapshot moves through `Open -> Fixed -> Complete -> Sealed`:
//!
//! - `Open`: any key may be added
//! - `Fixed`: the as-of time is recorded and the eligible key set frozen
//! - `Complete`: every eligible key has a value (entered automatically)
//! - `Sealed`: no further additions
//!
//! Writes go through the snapshot's own lock, so additions from one feed are
//! serialised; readers always see the most recent values.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use lattice_traits::{DataValue, MarketDataKey, SnapshotId};

use crate::error::{EngineError, EngineResult};
use crate::graph::{fingerprint_keys, MarketDataAvailability};

/// Lifecycle state of a snapshot. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SnapshotState {
    /// Accepting any key
    Open,
    /// As-of time fixed; only eligible keys accepted
    Fixed,
    /// Every eligible key has a value
    Complete,
    /// Closed for additions
    Sealed,
}

#[derive(Debug, Default)]
struct SnapshotInner {
    values: BTreeMap<MarketDataKey, DataValue>,
    expected: BTreeSet<MarketDataKey>,
    eligible: Option<BTreeSet<MarketDataKey>>,
    as_of: Option<DateTime<Utc>>,
}

impl SnapshotInner {
    fn all_eligible_valued(&self) -> bool {
        self.eligible
            .as_ref()
            .map_or(false, |keys| keys.iter().all(|k| self.values.contains_key(k)))
    }
}

/// Set of external input values a cycle executes against.
#[derive(Debug)]
pub struct Snapshot {
    id: SnapshotId,
    inner: RwLock<SnapshotInner>,
    state: watch::Sender<SnapshotState>,
}

impl Snapshot {
    /// Open an empty snapshot.
    pub fn new(id: SnapshotId) -> Self {
        let (state, _) = watch::channel(SnapshotState::Open);
        Self {
            id,
            inner: RwLock::new(SnapshotInner::default()),
            state,
        }
    }

    /// Open an empty snapshot labelled for today's live data.
    pub fn open_live() -> Self {
        Self::new(SnapshotId::new(Utc::now().date_naive(), "LIVE"))
    }

    /// A sealed snapshot holding `values`.
    pub fn sealed(
        id: SnapshotId,
        values: impl IntoIterator<Item = (MarketDataKey, DataValue)>,
    ) -> EngineResult<Self> {
        let snapshot = Self::new(id);
        snapshot.add_values(values)?;
        snapshot.mark_complete()?;
        Ok(snapshot)
    }

    /// Snapshot identifier.
    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> SnapshotState {
        *self.state.borrow()
    }

    /// Returns true once sealed.
    pub fn is_sealed(&self) -> bool {
        self.state() == SnapshotState::Sealed
    }

    /// As-of time recorded by [`Snapshot::fix_time`].
    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.inner.read().as_of
    }

    /// Declare keys expected to arrive. Only allowed while open.
    pub fn expect_keys(&self, keys: impl IntoIterator<Item = MarketDataKey>) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if self.state() != SnapshotState::Open {
            return Err(self.invalid_state("expect keys after fixing"));
        }
        inner.expected.extend(keys);
        Ok(())
    }

    /// Add one value.
    pub fn add_value(&self, key: MarketDataKey, value: DataValue) -> EngineResult<()> {
        self.add_values([(key, value)])
    }

    /// Add values. Either all are accepted or none are.
    pub fn add_values(
        &self,
        values: impl IntoIterator<Item = (MarketDataKey, DataValue)>,
    ) -> EngineResult<()> {
        let values: Vec<(MarketDataKey, DataValue)> = values.into_iter().collect();
        let mut inner = self.inner.write();
        let state = self.state();

        if state == SnapshotState::Sealed {
            return Err(EngineError::SnapshotSealed(self.id.clone()));
        }
        let mut batch = BTreeSet::new();
        for (key, _) in &values {
            if inner.values.contains_key(key) || !batch.insert(key) {
                return Err(EngineError::DuplicateSnapshotValue {
                    snapshot: self.id.clone(),
                    key: key.clone(),
                });
            }
            if let Some(eligible) = &inner.eligible {
                if !eligible.contains(key) {
                    return Err(EngineError::UnknownSnapshotKey {
                        snapshot: self.id.clone(),
                        key: key.clone(),
                    });
                }
            }
        }

        let added = values.len();
        inner.values.extend(values);
        tracing::trace!(snapshot = %self.id, added, "Snapshot values added");

        if state == SnapshotState::Fixed && inner.all_eligible_valued() {
            self.transition(SnapshotState::Complete);
        }
        Ok(())
    }

    /// Record the as-of time and freeze the eligible key set.
    pub fn fix_time(&self, as_of: DateTime<Utc>) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if self.state() != SnapshotState::Open {
            return Err(self.invalid_state("fix time twice"));
        }
        let mut eligible: BTreeSet<MarketDataKey> = inner.values.keys().cloned().collect();
        eligible.extend(inner.expected.iter().cloned());
        inner.eligible = Some(eligible);
        inner.as_of = Some(as_of);
        self.transition(SnapshotState::Fixed);

        if inner.all_eligible_valued() {
            self.transition(SnapshotState::Complete);
        }
        Ok(())
    }

    /// Seal the snapshot. Marking twice is an error.
    pub fn mark_complete(&self) -> EngineResult<()> {
        let inner = self.inner.write();
        if self.state() == SnapshotState::Sealed {
            return Err(self.invalid_state("mark complete twice"));
        }
        self.transition(SnapshotState::Sealed);
        tracing::debug!(snapshot = %self.id, values = inner.values.len(), "Snapshot sealed");
        Ok(())
    }

    /// Value for a key.
    pub fn get(&self, key: &MarketDataKey) -> Option<DataValue> {
        self.inner.read().values.get(key).cloned()
    }

    /// Everything recorded so far.
    pub fn values(&self) -> BTreeMap<MarketDataKey, DataValue> {
        self.inner.read().values.clone()
    }

    /// Number of recorded values.
    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }

    /// Eligible or expected keys without a value yet.
    pub fn missing_keys(&self) -> Vec<MarketDataKey> {
        let inner = self.inner.read();
        let wanted = inner.eligible.as_ref().unwrap_or(&inner.expected);
        wanted
            .iter()
            .filter(|k| !inner.values.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SnapshotState> {
        self.state.subscribe()
    }

    /// Wait until the snapshot reaches `state` or a later one.
    pub async fn wait_for_state(&self, state: SnapshotState) -> SnapshotState {
        let mut rx = self.state.subscribe();
        let reached = match rx.wait_for(|s| *s >= state).await {
            Ok(s) => *s,
            Err(_) => self.state(),
        };
        reached
    }

    fn transition(&self, to: SnapshotState) {
        let from = self.state.send_replace(to);
        tracing::debug!(snapshot = %self.id, from = ?from, to = ?to, "Snapshot state changed");
    }

    fn invalid_state(&self, message: &str) -> EngineError {
        EngineError::InvalidSnapshotState {
            snapshot: self.id.clone(),
            message: format!("cannot {} in state {:?}", message, self.state()),
        }
    }
}

impl MarketDataAvailability for Snapshot {
    fn is_available(&self, key: &MarketDataKey) -> bool {
        let inner = self.inner.read();
        inner.values.contains_key(key)
            || inner.expected.contains(key)
            || inner.eligible.as_ref().map_or(false, |e| e.contains(key))
    }

    fn fingerprint(&self) -> u64 {
        let inner = self.inner.read();
        let mut keys: BTreeSet<&MarketDataKey> = inner.values.keys().collect();
        keys.extend(inner.expected.iter());
        if let Some(eligible) = &inner.eligible {
            keys.extend(eligible.iter());
        }
        fingerprint_keys(keys.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lattice_traits::ComputationTarget;

    fn id() -> SnapshotId {
        SnapshotId::new(NaiveDate::from_ymd_opt(2024, 3, 28).unwrap(), "LDN_CLOSE")
    }

    fn key(ticker: &str) -> MarketDataKey {
        MarketDataKey::new(ComputationTarget::primitive(ticker), "MarketValue")
    }

    #[test]
    fn test_lifecycle_through_seal() {
        let snapshot = Snapshot::new(id());
        snapshot.expect_keys([key("B")]).unwrap();
        snapshot.add_value(key("A"), DataValue::Float(1.0)).unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Open);

        snapshot.fix_time(Utc::now()).unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Fixed);
        assert_eq!(snapshot.missing_keys(), vec![key("B")]);

        snapshot.add_value(key("B"), DataValue::Float(2.0)).unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Complete);

        snapshot.mark_complete().unwrap();
        assert!(snapshot.is_sealed());
        assert!(matches!(
            snapshot.add_value(key("C"), DataValue::Float(3.0)),
            Err(EngineError::SnapshotSealed(_))
        ));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_additions_are_append_only() {
        let snapshot = Snapshot::new(id());
        snapshot.add_value(key("A"), DataValue::Float(1.0)).unwrap();
        assert!(matches!(
            snapshot.add_value(key("A"), DataValue::Float(9.0)),
            Err(EngineError::DuplicateSnapshotValue { .. })
        ));
        assert_eq!(snapshot.get(&key("A")), Some(DataValue::Float(1.0)));
    }

    #[test]
    fn test_rejected_batch_adds_nothing() {
        let snapshot = Snapshot::new(id());
        let result = snapshot.add_values([
            (key("A"), DataValue::Float(1.0)),
            (key("A"), DataValue::Float(2.0)),
        ]);
        assert!(result.is_err());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_fixed_snapshot_rejects_unknown_keys() {
        let snapshot = Snapshot::new(id());
        snapshot.expect_keys([key("A")]).unwrap();
        snapshot.fix_time(Utc::now()).unwrap();
        assert!(matches!(
            snapshot.add_value(key("Z"), DataValue::Float(1.0)),
            Err(EngineError::UnknownSnapshotKey { .. })
        ));
        assert!(snapshot.expect_keys([key("Z")]).is_err());
    }

    #[test]
    fn test_mark_complete_twice_fails() {
        let snapshot = Snapshot::new(id());
        snapshot.mark_complete().unwrap();
        assert!(matches!(
            snapshot.mark_complete(),
            Err(EngineError::InvalidSnapshotState { .. })
        ));
    }

    #[test]
    fn test_fix_with_nothing_pending_is_complete() {
        let snapshot = Snapshot::new(id());
        snapshot.add_value(key("A"), DataValue::Float(1.0)).unwrap();
        snapshot.fix_time(Utc::now()).unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Complete);
        assert!(snapshot.as_of().is_some());
    }

    #[test]
    fn test_availability_includes_expected_keys() {
        let snapshot = Snapshot::new(id());
        let before = snapshot.fingerprint();
        snapshot.expect_keys([key("A")]).unwrap();
        assert!(snapshot.is_available(&key("A")));
        assert!(!snapshot.is_available(&key("B")));
        assert_ne!(before, snapshot.fingerprint());
    }

    #[tokio::test]
    async fn test_wait_for_state() {
        let snapshot = std::sync::Arc::new(Snapshot::new(id()));
        let waiter = {
            let snapshot = snapshot.clone();
            tokio::spawn(async move { snapshot.wait_for_state(SnapshotState::Complete).await })
        };

        snapshot.add_value(key("A"), DataValue::Float(1.0)).unwrap();
        snapshot.mark_complete().unwrap();

        assert_eq!(waiter.await.unwrap(), SnapshotState::Sealed);
    }
}
