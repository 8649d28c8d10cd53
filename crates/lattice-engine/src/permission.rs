//! Result permission providers.

use std::collections::HashMap;
use std::sync::Arc;

use lattice_traits::{ComputationTarget, EntitlementSource, PermissionPolicy, UserPrincipal};

use crate::error::{EngineError, EngineResult};
use crate::result::ResultModel;

/// Filters the values a caller may observe.
pub trait ViewPermissionProvider: Send + Sync {
    /// Policy name for logging.
    fn name(&self) -> &'static str;

    /// Copy of `model` without the values `user` may not see.
    fn filter(&self, user: &UserPrincipal, model: &ResultModel) -> ResultModel;
}

/// Every caller sees everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveViewPermissionProvider;

impl ViewPermissionProvider for PermissiveViewPermissionProvider {
    fn name(&self) -> &'static str {
        "permissive"
    }

    fn filter(&self, _user: &UserPrincipal, model: &ResultModel) -> ResultModel {
        model.clone()
    }
}

/// Filters per target through an [`EntitlementSource`].
///
/// The source is asked once per distinct target. Errors deny the target.
pub struct EntitlementViewPermissionProvider {
    source: Arc<dyn EntitlementSource>,
}

impl EntitlementViewPermissionProvider {
    /// Create a provider over an entitlement source.
    pub fn new(source: Arc<dyn EntitlementSource>) -> Self {
        Self { source }
    }

    fn check(&self, user: &UserPrincipal, target: &ComputationTarget) -> bool {
        match self.source.is_entitled(user, target) {
            Ok(true) => true,
            Ok(false) => {
                let denied = EngineError::EntitlementDenied {
                    user: user.user_name.clone(),
                    target: target.to_string(),
                };
                tracing::debug!(error = %denied, "Value filtered");
                false
            }
            Err(e) => {
                tracing::warn!(
                    user = %user,
                    target = %target,
                    error = %e,
                    "Entitlement check failed, denying"
                );
                false
            }
        }
    }
}

impl ViewPermissionProvider for EntitlementViewPermissionProvider {
    fn name(&self) -> &'static str {
        "entitlement"
    }

    fn filter(&self, user: &UserPrincipal, model: &ResultModel) -> ResultModel {
        let mut decisions: HashMap<ComputationTarget, bool> = HashMap::new();
        model.retain_targets(|target| {
            *decisions
                .entry(target.clone())
                .or_insert_with(|| self.check(user, target))
        })
    }
}

/// Provider for a configured policy.
pub fn permission_provider_for(
    policy: PermissionPolicy,
    entitlements: Option<Arc<dyn EntitlementSource>>,
) -> EngineResult<Arc<dyn ViewPermissionProvider>> {
    match (policy, entitlements) {
        (PermissionPolicy::Permissive, _) => Ok(Arc::new(PermissiveViewPermissionProvider)),
        (PermissionPolicy::Entitlement, Some(source)) => {
            Ok(Arc::new(EntitlementViewPermissionProvider::new(source)))
        }
        (PermissionPolicy::Entitlement, None) => Err(EngineError::ConfigError(
            "entitlement permission policy requires an entitlement source".into(),
        )),
    }
}
