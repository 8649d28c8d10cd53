//! Error types for collaborator operations.

use thiserror::Error;

/// Common error type for collaborator operations.
#[derive(Debug, Error)]
pub enum TraitError {
    /// External service not available
    #[error("source not available: {0}")]
    SourceNotAvailable(String),

    /// Persistence backend error
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_collaborator_failure() {
        assert_eq!(
            TraitError::PersistenceError("disk full".into()).to_string(),
            "persistence error: disk full"
        );
        assert_eq!(
            TraitError::SourceNotAvailable("entitlements".into()).to_string(),
            "source not available: entitlements"
        );
    }
}
