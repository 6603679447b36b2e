//! Persistence seams the onboarding core depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::onboarding::{StepPatch, User, VerificationCode};

/// Persistence for user records, keyed by email.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user. A duplicate email is `DatabaseError::Constraint`.
    async fn insert_user(&self, user: &User) -> Result<(), DatabaseError>;

    /// Look up a user by email.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError>;

    /// Apply `patch` only if the user is still on `patch.expected_step()`.
    ///
    /// Single conditional write. Returns `false` when no row matched.
    async fn advance_user(&self, email: &str, patch: &StepPatch) -> Result<bool, DatabaseError>;
}

/// Persistence for single-use verification codes.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Store a newly issued code.
    async fn insert_code(&self, code: &VerificationCode) -> Result<(), DatabaseError>;

    /// Atomically delete one code matching `email` and `code` exactly that was
    /// issued at or after `not_before`. Returns whether a code was deleted.
    async fn redeem_code(
        &self,
        email: &str,
        code: &str,
        not_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Remove every outstanding code for `email`. Returns the number removed.
    async fn delete_codes_for_email(&self, email: &str) -> Result<u64, DatabaseError>;
}
