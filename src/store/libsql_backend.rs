//! libSQL backend implementing `UserStore` and `CodeStore`.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::{OnboardingStep, StepPatch, User, VerificationCode};
use crate::store::migrations;
use crate::store::traits::{CodeStore, UserStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Number of outstanding codes for `email`.
    pub async fn count_codes_for_email(&self, email: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM verification_codes WHERE email = ?1",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_codes_for_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_codes_for_email: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_codes_for_email: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const USER_COLUMNS: &str = "id, email, first_name, last_name, onboarding_step, email_verified, \
                            terms_accepted, terms_accepted_at, created_at";

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn optional_text(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn step_value(step: OnboardingStep) -> i64 {
    i64::from(step.as_u8())
}

/// Map a libsql Row to a User.
///
/// Column order matches USER_COLUMNS.
fn row_to_user(row: &libsql::Row) -> Result<User, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Serialization(format!("user row: {e}"));

    let id_str: String = row.get(0).map_err(col)?;
    let email: String = row.get(1).map_err(col)?;
    let first_name: Option<String> = row.get::<String>(2).ok();
    let last_name: Option<String> = row.get::<String>(3).ok();
    let step_raw: i64 = row.get(4).map_err(col)?;
    let email_verified: i64 = row.get(5).map_err(col)?;
    let terms_accepted: i64 = row.get(6).map_err(col)?;
    let terms_accepted_at: Option<String> = row.get::<String>(7).ok();
    let created_at: String = row.get(8).map_err(col)?;

    Ok(User {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("bad user id {id_str:?}: {e}")))?,
        email,
        first_name,
        last_name,
        onboarding_step: OnboardingStep::try_from(step_raw).map_err(DatabaseError::Serialization)?,
        email_verified: email_verified != 0,
        terms_accepted: terms_accepted != 0,
        terms_accepted_at: terms_accepted_at.as_deref().map(parse_datetime).transpose()?,
        created_at: parse_datetime(&created_at)?,
    })
}

// ── UserStore ───────────────────────────────────────────────────────

#[async_trait]
impl UserStore for LibSqlBackend {
    async fn insert_user(&self, user: &User) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO users ({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    user.id.to_string(),
                    user.email.clone(),
                    optional_text(&user.first_name),
                    optional_text(&user.last_name),
                    step_value(user.onboarding_step),
                    i64::from(user.email_verified),
                    i64::from(user.terms_accepted),
                    optional_text(&user.terms_accepted_at.as_ref().map(format_datetime)),
                    format_datetime(&user.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_user", e))?;

        debug!(user_id = %user.id, email = %user.email, "User inserted");
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_user_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_user_by_email: {e}"))),
        }
    }

    async fn advance_user(&self, email: &str, patch: &StepPatch) -> Result<bool, DatabaseError> {
        let Some(target) = patch.target_step() else {
            return Ok(false);
        };
        let expected = step_value(patch.expected_step());
        let target = step_value(target);

        let count = match patch {
            StepPatch::VerifyEmail => {
                self.conn()
                    .execute(
                        "UPDATE users SET email_verified = 1, onboarding_step = ?2
                         WHERE email = ?1 AND onboarding_step = ?3",
                        params![email, target, expected],
                    )
                    .await
            }
            StepPatch::SetProfile {
                first_name,
                last_name,
            } => {
                self.conn()
                    .execute(
                        "UPDATE users SET first_name = ?2, last_name = ?3, onboarding_step = ?4
                         WHERE email = ?1 AND onboarding_step = ?5",
                        params![email, first_name.clone(), last_name.clone(), target, expected],
                    )
                    .await
            }
            StepPatch::AcceptTerms { accepted_at } => {
                self.conn()
                    .execute(
                        "UPDATE users SET terms_accepted = 1, terms_accepted_at = ?2, onboarding_step = ?3
                         WHERE email = ?1 AND onboarding_step = ?4",
                        params![email, format_datetime(accepted_at), target, expected],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("advance_user: {e}")))?;

        debug!(email, expected, target, matched = count, "Conditional step update");
        Ok(count > 0)
    }
}

// ── CodeStore ───────────────────────────────────────────────────────

#[async_trait]
impl CodeStore for LibSqlBackend {
    async fn insert_code(&self, code: &VerificationCode) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO verification_codes (id, email, code, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
                params![
                    code.id.to_string(),
                    code.email.clone(),
                    code.code.clone(),
                    code.created_at.timestamp_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_code", e))?;

        debug!(email = %code.email, "Verification code stored");
        Ok(())
    }

    async fn redeem_code(
        &self,
        email: &str,
        code: &str,
        not_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        // One statement: concurrent redemptions of the same code serialize here.
        let count = self
            .conn()
            .execute(
                "DELETE FROM verification_codes WHERE id = (
                    SELECT id FROM verification_codes
                    WHERE email = ?1 AND code = ?2 AND created_at_ms >= ?3
                    LIMIT 1
                )",
                params![email, code, not_before.timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("redeem_code: {e}")))?;

        Ok(count > 0)
    }

    async fn delete_codes_for_email(&self, email: &str) -> Result<u64, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM verification_codes WHERE email = ?1",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_codes_for_email: {e}")))?;

        if count > 0 {
            debug!(email, count, "Outstanding verification codes removed");
        }
        Ok(count)
    }
}
