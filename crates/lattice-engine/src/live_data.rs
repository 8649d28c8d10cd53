//! Snapshot sources and the last-known-value live data provider.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use lattice_traits::{DataValue, MarketDataKey, SnapshotId};

use crate::error::{EngineError, EngineResult};
use crate::snapshot::Snapshot;

// =============================================================================
// SNAPSHOT SOURCE
// =============================================================================

/// Supplies the snapshot each cycle of a view process runs against.
pub trait SnapshotSource: Send + Sync {
    /// Snapshot for the next cycle.
    fn snapshot(&self) -> EngineResult<Arc<Snapshot>>;

    /// Tick stream for live-triggered processes, if the source has one.
    fn subscribe_ticks(&self) -> Option<broadcast::Receiver<MarketDataTick>> {
        None
    }
}

/// Always returns the same snapshot.
#[derive(Debug, Clone)]
pub struct FixedSnapshotSource {
    snapshot: Arc<Snapshot>,
}

impl FixedSnapshotSource {
    /// Wrap a snapshot.
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self { snapshot }
    }
}

impl SnapshotSource for FixedSnapshotSource {
    fn snapshot(&self) -> EngineResult<Arc<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}

// =============================================================================
// LIVE DATA
// =============================================================================

/// One live market data update.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataTick {
    /// Updated key
    pub key: MarketDataKey,
    /// New value
    pub value: DataValue,
    /// Provider-local sequence number
    pub sequence: u64,
    /// When the update was received
    pub received_at: DateTime<Utc>,
}

/// Keeps the last known value of every key a feed has pushed.
///
/// Each [`SnapshotSource::snapshot`] call seals a fresh snapshot of the
/// current values, so cycles never observe a value changing under them.
pub struct LiveDataSnapshotProvider {
    values: DashMap<MarketDataKey, DataValue>,
    sequence: AtomicU64,
    snapshots: AtomicU64,
    ticks: broadcast::Sender<MarketDataTick>,
}

impl LiveDataSnapshotProvider {
    /// Create a provider buffering up to `tick_capacity` ticks per subscriber.
    pub fn new(tick_capacity: usize) -> Self {
        let (ticks, _) = broadcast::channel(tick_capacity.max(1));
        Self {
            values: DashMap::new(),
            sequence: AtomicU64::new(0),
            snapshots: AtomicU64::new(0),
            ticks,
        }
    }

    /// Record a value and broadcast it as a tick. Returns the tick's sequence number.
    pub fn publish(&self, key: MarketDataKey, value: DataValue) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.values.insert(key.clone(), value.clone());
        trace!(key = %key, sequence, "Live value published");
        // No subscribers is not an error.
        let _ = self.ticks.send(MarketDataTick {
            key,
            value,
            sequence,
            received_at: Utc::now(),
        });
        sequence
    }

    /// Record several values.
    pub fn publish_many(&self, values: impl IntoIterator<Item = (MarketDataKey, DataValue)>) {
        for (key, value) in values {
            self.publish(key, value);
        }
    }

    /// Forget a key.
    pub fn remove(&self, key: &MarketDataKey) -> Option<DataValue> {
        self.values.remove(key).map(|(_, v)| v)
    }

    /// Last known value of a key.
    pub fn latest(&self, key: &MarketDataKey) -> Option<DataValue> {
        self.values.get(key).map(|v| v.clone())
    }

    /// Number of keys with a value.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing was published.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Subscribe to ticks.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketDataTick> {
        self.ticks.subscribe()
    }

    /// Seal a snapshot of the current values.
    pub fn create_snapshot(&self) -> EngineResult<Snapshot> {
        let n = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        let id = SnapshotId::live(Utc::now().date_naive(), n);
        let values: Vec<(MarketDataKey, DataValue)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let count = values.len();
        let snapshot = Snapshot::sealed(id, values)?;
        debug!(snapshot = %snapshot.id(), values = count, "Live snapshot created");
        Ok(snapshot)
    }
}

impl Default for LiveDataSnapshotProvider {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for LiveDataSnapshotProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveDataSnapshotProvider")
            .field("values", &self.values.len())
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}

impl SnapshotSource for LiveDataSnapshotProvider {
    fn snapshot(&self) -> EngineResult<Arc<Snapshot>> {
        self.create_snapshot().map(Arc::new)
    }

    fn subscribe_ticks(&self) -> Option<broadcast::Receiver<MarketDataTick>> {
        Some(self.subscribe())
    }
}

/// Source that never has a snapshot; cycles fail with `NoSnapshot`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshotSource;

impl SnapshotSource for NoSnapshotSource {
    fn snapshot(&self) -> EngineResult<Arc<Snapshot>> {
        Err(EngineError::Internal("no snapshot source configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotState;
    use lattice_traits::ComputationTarget;

    fn key(ticker: &str) -> MarketDataKey {
        MarketDataKey::new(ComputationTarget::primitive(ticker), "MarketValue")
    }

    #[test]
    fn test_snapshot_holds_last_known_values() {
        let provider = LiveDataSnapshotProvider::default();
        provider.publish(key("A"), DataValue::Float(1.0));
        provider.publish(key("A"), DataValue::Float(2.0));
        provider.publish(key("B"), DataValue::Float(3.0));

        let snapshot = provider.snapshot().unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Sealed);
        assert_eq!(snapshot.get(&key("A")), Some(DataValue::Float(2.0)));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_snapshots_are_independent() {
        let provider = LiveDataSnapshotProvider::default();
        provider.publish(key("A"), DataValue::Float(1.0));
        let first = provider.snapshot().unwrap();
        provider.publish(key("A"), DataValue::Float(5.0));
        let second = provider.snapshot().unwrap();

        assert_eq!(first.get(&key("A")), Some(DataValue::Float(1.0)));
        assert_eq!(second.get(&key("A")), Some(DataValue::Float(5.0)));
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_ticks_broadcast() {
        let provider = LiveDataSnapshotProvider::default();
        let mut rx = provider.subscribe_ticks().unwrap();
        let seq = provider.publish(key("A"), DataValue::Float(1.0));

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.sequence, seq);
        assert_eq!(tick.key, key("A"));
    }

    #[test]
    fn test_fixed_source_has_no_ticks() {
        let source = FixedSnapshotSource::new(Arc::new(Snapshot::open_live()));
        assert!(source.subscribe_ticks().is_none());
        assert!(source.snapshot().is_ok());
    }
}
