//! User accounts: password signup/login and admin role management

use std::sync::Arc;

use async_trait::async_trait;
use lexfam_shared::{normalize_email, validate_email, Page, Provider, Role, SubscriptionStatus, User};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::password::{hash_password, validate_password_strength, verify_password};

/// Fields for a new account
#[derive(Debug, Clone)]
pub struct NewUser {
    pub identifier: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,
    pub role: Role,
    pub provider: Provider,
}

/// Admin listing row
#[derive(Debug, Clone, PartialEq)]
pub struct UserSummary {
    pub identifier: String,
    pub email: Option<String>,
    pub role: Role,
    pub provider: Provider,
    pub created_at: OffsetDateTime,
    /// Status of the current subscription, if any
    pub subscription_status: Option<SubscriptionStatus>,
}

/// Storage port for accounts
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with `AlreadyExists` when the identifier or email is taken
    async fn create_user(&self, user: &NewUser) -> BillingResult<User>;

    async fn get_user(&self, identifier: &str) -> BillingResult<Option<User>>;

    async fn get_user_by_email(&self, email: &str) -> BillingResult<Option<User>>;

    /// Returns false when the user is unknown
    async fn set_role(&self, identifier: &str, role: Role) -> BillingResult<bool>;

    /// Newest accounts first
    async fn list_users(&self, page: Page) -> BillingResult<Vec<UserSummary>>;

    async fn count_users(&self) -> BillingResult<i64>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> BillingResult<()>;
}

/// Account service
#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn UserStore>,
}

impl UserService {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Register a password account with role USER
    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> BillingResult<User> {
        let email = normalize_email(email);
        validate_email(&email)?;
        validate_password_strength(password)?;

        if self.store.get_user_by_email(&email).await?.is_some() {
            return Err(BillingError::AlreadyExists(
                "An account with this email already exists".to_string(),
            ));
        }

        let password_hash = hash_password(password)?;
        let user = self
            .store
            .create_user(&NewUser {
                identifier: email.clone(),
                email: Some(email),
                display_name: display_name.map(str::to_string),
                password_hash: Some(password_hash),
                role: Role::User,
                provider: Provider::Password,
            })
            .await?;

        tracing::info!(user_id = %user.identifier, "Created password account");
        Ok(user)
    }

    /// Check credentials; `None` for unknown email or wrong password
    pub async fn authenticate(&self, email: &str, password: &str) -> BillingResult<Option<User>> {
        let email = normalize_email(email);
        let Some(user) = self.store.get_user_by_email(&email).await? else {
            return Ok(None);
        };

        let Some(hash) = user.password_hash.as_deref() else {
            // OAuth-only account
            return Ok(None);
        };

        if verify_password(password, hash)? {
            Ok(Some(user))
        } else {
            tracing::debug!(user_id = %user.identifier, "Password mismatch");
            Ok(None)
        }
    }

    pub async fn get(&self, identifier: &str) -> BillingResult<Option<User>> {
        self.store.get_user(identifier).await
    }

    /// Fetch a user that must exist
    pub async fn require(&self, identifier: &str) -> BillingResult<User> {
        self.store
            .get_user(identifier)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(identifier.to_string()))
    }

    pub async fn set_role(&self, identifier: &str, role: &str) -> BillingResult<Role> {
        let role: Role = role.parse()?;
        if !self.store.set_role(identifier, role).await? {
            return Err(BillingError::UserNotFound(identifier.to_string()));
        }

        tracing::info!(user_id = %identifier, role = %role, "Updated user role");
        Ok(role)
    }

    pub async fn list(&self, page: Page) -> BillingResult<(Vec<UserSummary>, i64)> {
        let users = self.store.list_users(page).await?;
        let total = self.store.count_users().await?;
        Ok((users, total))
    }

    pub async fn ping(&self) -> BillingResult<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn service() -> UserService {
        UserService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_signup_normalizes_email_and_defaults_role() {
        let users = service();
        let user = users
            .signup(" Parent@Example.com ", "Custody-Plan-77", None)
            .await
            .unwrap();

        assert_eq!(user.identifier, "parent@example.com");
        assert_eq!(user.role, Role::User);
        assert_eq!(user.provider, Provider::Password);
        assert_eq!(user.message_count, 0);
    }

    #[tokio::test]
    async fn test_signup_rejects_duplicates_and_bad_input() {
        let users = service();
        users.signup("a@example.com", "Custody-Plan-77", None).await.unwrap();

        let dup = users.signup("A@example.com", "Custody-Plan-77", None).await;
        assert!(matches!(dup, Err(BillingError::AlreadyExists(_))));

        let bad_email = users.signup("not-an-email", "Custody-Plan-77", None).await;
        assert!(matches!(bad_email, Err(BillingError::InvalidInput(_))));

        let weak = users.signup("b@example.com", "short", None).await;
        assert!(matches!(weak, Err(BillingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let users = service();
        users.signup("a@example.com", "Custody-Plan-77", None).await.unwrap();

        assert!(users.authenticate("a@example.com", "Custody-Plan-77").await.unwrap().is_some());
        assert!(users.authenticate("a@example.com", "wrong").await.unwrap().is_none());
        assert!(users.authenticate("nobody@example.com", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_role() {
        let users = service();
        users.signup("a@example.com", "Custody-Plan-77", None).await.unwrap();

        assert_eq!(users.set_role("a@example.com", "admin").await.unwrap(), Role::Admin);
        assert_eq!(users.require("a@example.com").await.unwrap().role, Role::Admin);

        assert!(matches!(
            users.set_role("a@example.com", "superuser").await,
            Err(BillingError::InvalidInput(_))
        ));
        assert!(matches!(
            users.set_role("ghost@example.com", "ADMIN").await,
            Err(BillingError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_with_total() {
        let users = service();
        for i in 0..3 {
            users
                .signup(&format!("u{i}@example.com"), "Custody-Plan-77", None)
                .await
                .unwrap();
        }

        let (page, total) = users.list(Page::new(1, 2)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 3);
        assert!(page.iter().all(|u| u.subscription_status.is_none()));
    }
}
