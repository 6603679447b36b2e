//! Error types for the onboarding service.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libsql failure, splitting out unique-key violations.
    pub(crate) fn from_libsql(context: &str, e: libsql::Error) -> Self {
        let message = e.to_string();
        if message.contains("UNIQUE constraint failed") {
            Self::Constraint(format!("{context}: {message}"))
        } else {
            Self::Query(format!("{context}: {message}"))
        }
    }
}

/// Outbound notification errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Transport failed: {0}")]
    Transport(String),
}

/// Credential signing and verification errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Token signature mismatch")]
    BadSignature,

    #[error("Invalid token claims: {0}")]
    InvalidClaims(String),

    #[error("Token expired at {0}")]
    Expired(i64),

    #[error("Signing key rejected: {0}")]
    Key(String),
}

/// Failures surfaced by the onboarding state machine.
///
/// The HTTP boundary maps each variant to a distinct status and message.
#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("Missing or invalid field(s): {0}")]
    InvalidInput(String),

    #[error("Email already exists")]
    Conflict,

    #[error("Invalid code")]
    InvalidCode,

    #[error("Invalid onboarding step: expected {expected}, credential shows {actual}")]
    InvalidStep { expected: u8, actual: u8 },

    #[error("Onboarding step changed concurrently; expected step {expected}")]
    StepConflict { expected: u8 },

    #[error("User not found: {email}")]
    NotFound { email: String },

    #[error("Error sending verification email: {0}")]
    NotificationFailure(#[from] NotifyError),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] DatabaseError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Error creating token: {0}")]
    Credential(#[from] CredentialError),
}
