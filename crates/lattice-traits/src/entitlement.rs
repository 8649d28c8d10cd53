//! Caller identity and entitlement checks.
//!
//! Entitlement decisions are owned by an external system; the engine only
//! asks "may this user see values for this target?".

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TraitError;
use crate::target::ComputationTarget;

/// Identity of the user on whose behalf results are requested.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct UserPrincipal {
    /// User name
    pub user_name: String,
    /// Host the request originated from
    pub ip_address: String,
}

impl UserPrincipal {
    /// Create a new principal.
    pub fn new(user_name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            ip_address: ip_address.into(),
        }
    }

    /// Principal for in-process callers (tests, batch runs).
    pub fn local(user_name: impl Into<String>) -> Self {
        Self::new(user_name, "127.0.0.1")
    }
}

impl fmt::Display for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_name, self.ip_address)
    }
}

/// External entitlement check.
///
/// Called once per distinct target for each filtered result model, so
/// implementations should answer from local state.
pub trait EntitlementSource: Send + Sync {
    /// Whether `user` may see values computed for `target`.
    fn is_entitled(&self, user: &UserPrincipal, target: &ComputationTarget)
        -> Result<bool, TraitError>;
}

impl<F> EntitlementSource for F
where
    F: Fn(&UserPrincipal, &ComputationTarget) -> Result<bool, TraitError> + Send + Sync,
{
    fn is_entitled(
        &self,
        user: &UserPrincipal,
        target: &ComputationTarget,
    ) -> Result<bool, TraitError> {
        self(user, target)
    }
}
