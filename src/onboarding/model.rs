//! User and verification code data models.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::OnboardingStep;

/// Characters used in verification codes. Omits 0/O, 1/I/L.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Length of a verification code.
pub const CODE_LENGTH: usize = 6;

static EMAIL_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+$").expect("email regex is valid"));

/// A registered user and their onboarding progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub onboarding_step: OnboardingStep,
    pub email_verified: bool,
    pub terms_accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A freshly registered, unverified user.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            first_name: None,
            last_name: None,
            onboarding_step: OnboardingStep::Registered,
            email_verified: false,
            terms_accepted: false,
            terms_accepted_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the flags agree with the step.
    pub fn is_consistent(&self) -> bool {
        self.email_verified == (self.onboarding_step >= OnboardingStep::EmailVerified)
            && self.terms_accepted == (self.onboarding_step >= OnboardingStep::TermsAccepted)
            && self.terms_accepted == self.terms_accepted_at.is_some()
    }
}

/// Field changes applied together with a step transition.
#[derive(Debug, Clone, PartialEq)]
pub enum StepPatch {
    /// Leaves step 1.
    VerifyEmail,
    /// Leaves step 2.
    SetProfile { first_name: String, last_name: String },
    /// Leaves step 3.
    AcceptTerms { accepted_at: DateTime<Utc> },
}

impl StepPatch {
    /// Step the user must currently be on for this patch to apply.
    pub fn expected_step(&self) -> OnboardingStep {
        match self {
            Self::VerifyEmail => OnboardingStep::Registered,
            Self::SetProfile { .. } => OnboardingStep::EmailVerified,
            Self::AcceptTerms { .. } => OnboardingStep::ProfileSet,
        }
    }

    /// Step the user is on after this patch applies.
    pub fn target_step(&self) -> Option<OnboardingStep> {
        self.expected_step().next()
    }
}

/// A single-use code proving control of an email address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCode {
    pub id: Uuid,
    pub email: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

impl VerificationCode {
    /// Issue a new random code for `email`.
    pub fn generate(email: impl Into<String>) -> Self {
        Self::with_code(email, generate_code())
    }

    pub fn with_code(email: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            code: code.into(),
            created_at: Utc::now(),
        }
    }
}

/// Random human-typeable code of `CODE_LENGTH` characters.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Rough `local@domain` shape check.
pub fn is_plausible_email(email: &str) -> bool {
    EMAIL_SHAPE.is_match(email)
}
