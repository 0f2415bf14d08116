//! Common types used across Lexfam

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ValidationError;

// =============================================================================
// Accounts
// =============================================================================

/// User role, stored as a typed column on `users`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "ADMIN" => Ok(Role::Admin),
            _ => Err(ValidationError::InvalidRole(s.to_string())),
        }
    }
}

/// How an account authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Password,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Password => "password",
            Provider::Google => "google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "password" | "credentials" => Ok(Provider::Password),
            "google" => Ok(Provider::Google),
            _ => Err(ValidationError::InvalidProvider(s.to_string())),
        }
    }
}

/// An application user
#[derive(Debug, Clone, Serialize)]
pub struct User {
    /// Stable external identifier (the email for password accounts)
    pub identifier: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: Role,
    pub provider: Provider,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub message_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Billing vocabulary
// =============================================================================

/// Subscription lifecycle status as reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// Statuses that make a subscription the user's "current" one
    pub fn is_current(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }

    /// Statuses that bypass the free-tier message limit
    pub fn grants_paid_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    /// SQL literal list of current statuses, for `status IN (...)` filters
    pub const CURRENT_SQL: &'static str = "('active', 'trialing', 'past_due')";
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            // Both spellings appear in provider payloads
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            _ => Err(ValidationError::InvalidStatus(s.to_string())),
        }
    }
}

/// Recurring billing interval of a price
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "month" => Ok(BillingInterval::Month),
            "year" => Ok(BillingInterval::Year),
            _ => Err(ValidationError::InvalidInterval(s.to_string())),
        }
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// One-based page request for listing endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    /// Upper bound on a single page
    pub const MAX_LIMIT: u32 = 200;

    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing_is_case_insensitive() {
        assert_eq!("admin".parse::<Role>(), Ok(Role::Admin));
        assert_eq!(" USER ".parse::<Role>(), Ok(Role::User));
        assert_eq!(
            "owner".parse::<Role>(),
            Err(ValidationError::InvalidRole("owner".to_string()))
        );
    }

    #[test]
    fn test_role_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"ADMIN\"");
    }

    #[test]
    fn test_status_round_trip_and_classes() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }

        assert!(SubscriptionStatus::PastDue.is_current());
        assert!(!SubscriptionStatus::PastDue.grants_paid_access());
        assert!(SubscriptionStatus::Trialing.grants_paid_access());
        assert!(!SubscriptionStatus::Canceled.is_current());
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>(),
            Ok(SubscriptionStatus::Canceled)
        );
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!("year".parse::<BillingInterval>(), Ok(BillingInterval::Year));
        assert!("week".parse::<BillingInterval>().is_err());
    }

    #[test]
    fn test_page_clamps_and_offsets() {
        let page = Page::new(0, 0);
        assert_eq!(page, Page { page: 1, limit: 1 });
        assert_eq!(page.offset(), 0);

        let page = Page::new(3, 50);
        assert_eq!(page.offset(), 100);
        assert_eq!(Page::new(1, 10_000).limit, Page::MAX_LIMIT);
    }

    #[test]
    fn test_user_never_serializes_password_hash() {
        let user = User {
            identifier: "a@b.co".to_string(),
            email: Some("a@b.co".to_string()),
            display_name: None,
            role: Role::User,
            provider: Provider::Password,
            password_hash: Some("$argon2id$secret".to_string()),
            message_count: 3,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2"));
        assert!(json.contains("\"role\":\"USER\""));
    }
}
