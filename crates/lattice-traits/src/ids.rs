//! Identifier types used across the engine.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Defines an opaque string identifier with a scheme prefix for generated values.
macro_rules! unique_id {
    ($(#[$meta:meta])* $name:ident, $scheme:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Scheme prefix used for generated identifiers.
            pub const SCHEME: &'static str = $scheme;

            /// Create an identifier from an existing value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh identifier (`<scheme>~<uuid>`).
            pub fn generate() -> Self {
                Self(format!("{}~{}", $scheme, uuid::Uuid::new_v4()))
            }

            /// Get the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

unique_id!(
    /// Identifier of a long-lived view process.
    ViewProcessId,
    "ViewProcess"
);

unique_id!(
    /// Identifier of a view client (one consumer of view results).
    ViewClientId,
    "ViewClient"
);

unique_id!(
    /// Identifier of a single computation cycle.
    ViewCycleId,
    "ViewCycle"
);

unique_id!(
    /// Identifier of a batch job run.
    BatchId,
    "Batch"
);

unique_id!(
    /// Identifier of a computation target (position id, security ticker, ...).
    TargetId,
    "Target"
);

/// Snapshot identifier: observation date plus observation-time label (e.g. "LDN_CLOSE").
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SnapshotId {
    /// Observation date
    pub observation_date: NaiveDate,
    /// Observation time label
    pub observation_time: String,
}

impl SnapshotId {
    /// Create a new snapshot ID.
    pub fn new(observation_date: NaiveDate, observation_time: impl Into<String>) -> Self {
        Self {
            observation_date,
            observation_time: observation_time.into(),
        }
    }

    /// Snapshot ID for ad-hoc live snapshots, labelled with a sequence number.
    pub fn live(observation_date: NaiveDate, sequence: u64) -> Self {
        Self::new(observation_date, format!("LIVE-{}", sequence))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.observation_date, self.observation_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = ViewClientId::generate();
        let b = ViewClientId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("ViewClient~"));
    }

    #[test]
    fn test_snapshot_id_display() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 28).unwrap();
        let id = SnapshotId::new(date, "LDN_CLOSE");
        assert_eq!(id.to_string(), "2024-03-28/LDN_CLOSE");
        assert_eq!(SnapshotId::live(date, 7).observation_time, "LIVE-7");
    }
}
