//! Entitlement Module
//!
//! Answers "may this user send a chat message right now, and should we warn
//! them?" from the user's role, subscription status and message count.
//!
//! `evaluate()` is the single place that decision is made. It is a pure
//! function; `EntitlementService` only loads its inputs.

use std::sync::Arc;

use lexfam_shared::{Role, SubscriptionStatus};
use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionStore;
use crate::usage::UsageStore;
use crate::users::UserStore;

/// Warning threshold as a fraction of the free limit
pub const WARNING_FRACTION: f64 = 0.75;

/// Which rule granted or denied access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Administrators are never metered
    Admin,
    /// Active or trialing subscription
    Paid,
    /// Metered by the message counter
    Free,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Admin => write!(f, "admin"),
            Tier::Paid => write!(f, "paid"),
            Tier::Free => write!(f, "free"),
        }
    }
}

/// Non-blocking notice that the free limit is close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageWarning {
    pub remaining: i64,
}

/// Decision for one gated request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub allowed: bool,
    pub tier: Tier,
    /// Whether a successful request should increment the counter
    pub counts_usage: bool,
    pub message_count: i64,
    pub limit: i64,
    pub warning: Option<UsageWarning>,
}

impl Entitlement {
    /// Remaining free messages; `None` for unmetered tiers
    pub fn remaining(&self) -> Option<i64> {
        self.counts_usage
            .then(|| (self.limit - self.message_count).max(0))
    }
}

/// Count at which the warning starts, `ceil(limit * 0.75)`
pub fn warning_threshold(limit: i64) -> i64 {
    (limit as f64 * WARNING_FRACTION).ceil() as i64
}

/// Decide access for a request
pub fn evaluate(
    role: Role,
    status: Option<SubscriptionStatus>,
    message_count: i64,
    limit: i64,
) -> Entitlement {
    if role.is_admin() {
        return Entitlement {
            allowed: true,
            tier: Tier::Admin,
            counts_usage: false,
            message_count,
            limit,
            warning: None,
        };
    }

    if status.is_some_and(|s| s.grants_paid_access()) {
        return Entitlement {
            allowed: true,
            tier: Tier::Paid,
            counts_usage: false,
            message_count,
            limit,
            warning: None,
        };
    }

    let allowed = message_count < limit;
    let warning = (limit > 0 && message_count >= warning_threshold(limit)).then(|| UsageWarning {
        remaining: (limit - message_count).max(0),
    });

    Entitlement {
        allowed,
        tier: Tier::Free,
        counts_usage: true,
        message_count,
        limit,
        warning,
    }
}

/// Loads entitlement inputs from the stores
#[derive(Clone)]
pub struct EntitlementService {
    users: Arc<dyn UserStore>,
    usage: Arc<dyn UsageStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl EntitlementService {
    pub fn new(
        users: Arc<dyn UserStore>,
        usage: Arc<dyn UsageStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            users,
            usage,
            subscriptions,
        }
    }

    pub async fn check(&self, user_id: &str, limit: i64) -> BillingResult<Entitlement> {
        let user = self
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        let status = self
            .subscriptions
            .get_current_subscription(user_id)
            .await?
            .map(|s| s.status);
        let message_count = self.usage.get_count(user_id).await?;

        let entitlement = evaluate(user.role, status, message_count, limit);
        tracing::debug!(
            user_id = %user_id,
            tier = %entitlement.tier,
            allowed = entitlement.allowed,
            message_count,
            "Evaluated entitlement"
        );
        Ok(entitlement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_is_never_metered() {
        let e = evaluate(Role::Admin, None, 10_000, 20);
        assert!(e.allowed);
        assert_eq!(e.tier, Tier::Admin);
        assert!(!e.counts_usage);
        assert_eq!(e.warning, None);
        assert_eq!(e.remaining(), None);
    }

    #[test]
    fn test_active_and_trialing_bypass_counter() {
        for status in [SubscriptionStatus::Active, SubscriptionStatus::Trialing] {
            let e = evaluate(Role::User, Some(status), 500, 20);
            assert!(e.allowed);
            assert_eq!(e.tier, Tier::Paid);
            assert!(!e.counts_usage);
        }
    }

    #[test]
    fn test_past_due_falls_back_to_free_rules() {
        let e = evaluate(Role::User, Some(SubscriptionStatus::PastDue), 20, 20);
        assert!(!e.allowed);
        assert_eq!(e.tier, Tier::Free);
    }

    #[test]
    fn test_free_boundaries_and_warning() {
        assert_eq!(warning_threshold(20), 15);
        assert_eq!(warning_threshold(3), 3);

        let e = evaluate(Role::User, None, 14, 20);
        assert!(e.allowed);
        assert_eq!(e.warning, None);

        let e = evaluate(Role::User, None, 15, 20);
        assert!(e.allowed);
        assert_eq!(e.warning, Some(UsageWarning { remaining: 5 }));

        let e = evaluate(Role::User, None, 19, 20);
        assert!(e.allowed);
        assert_eq!(e.remaining(), Some(1));

        let e = evaluate(Role::User, None, 20, 20);
        assert!(!e.allowed);
        assert_eq!(e.warning, Some(UsageWarning { remaining: 0 }));

        let e = evaluate(Role::User, None, 25, 20);
        assert_eq!(e.warning, Some(UsageWarning { remaining: 0 }));
        assert_eq!(e.remaining(), Some(0));
    }

    #[test]
    fn test_decision_carries_count_and_limit() {
        let e = evaluate(Role::User, None, 16, 20);
        assert_eq!(
            e,
            Entitlement {
                allowed: true,
                tier: Tier::Free,
                counts_usage: true,
                message_count: 16,
                limit: 20,
                warning: Some(UsageWarning { remaining: 4 }),
            }
        );
        assert_eq!(e.remaining(), Some(4));
    }

    #[test]
    fn test_zero_limit_blocks_free_usage() {
        let e = evaluate(Role::User, None, 0, 0);
        assert!(!e.allowed);
        assert_eq!(e.warning, None);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Paid.to_string(), "paid");
    }
}
