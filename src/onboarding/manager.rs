//! OnboardingManager: validates step preconditions, applies transitions,
//! and re-issues the credential.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::credential::{Claims, CredentialIssuer};
use crate::error::{DatabaseError, OnboardingError};
use crate::notify::{Notifier, VERIFY_SUBJECT, verification_body};
use crate::store::{CodeStore, UserStore};

use super::model::{StepPatch, User, VerificationCode, is_plausible_email};
use super::state::OnboardingStep;

/// Coordinates the registration flow: user and code persistence, code
/// delivery, step transitions, and credential issuance.
pub struct OnboardingManager {
    users: Arc<dyn UserStore>,
    codes: Arc<dyn CodeStore>,
    notifier: Arc<dyn Notifier>,
    issuer: CredentialIssuer,
    code_ttl: Duration,
}

impl OnboardingManager {
    pub fn new(
        users: Arc<dyn UserStore>,
        codes: Arc<dyn CodeStore>,
        notifier: Arc<dyn Notifier>,
        issuer: CredentialIssuer,
        code_ttl: Duration,
    ) -> Self {
        Self {
            users,
            codes,
            notifier,
            issuer,
            code_ttl,
        }
    }

    /// Register `email` at step 1 and send it a verification code.
    ///
    /// The user and code are persisted before dispatch. A dispatch failure is
    /// reported as `NotificationFailure` and leaves both in place; `resend_code`
    /// is the recovery path.
    pub async fn initiate(&self, email: &str) -> Result<(), OnboardingError> {
        let email = normalize_email(email)?;

        if self.users.find_user_by_email(email).await?.is_some() {
            warn!(email, "Registration rejected: email already exists");
            return Err(OnboardingError::Conflict);
        }

        let user = User::new(email);
        self.users.insert_user(&user).await.map_err(|e| match e {
            DatabaseError::Constraint(_) => OnboardingError::Conflict,
            other => OnboardingError::PersistenceFailure(other),
        })?;
        info!(user_id = %user.id, email, "User registered");

        self.issue_code(email).await
    }

    /// Replace any outstanding codes for a step-1 user with a fresh one.
    pub async fn resend_code(&self, email: &str) -> Result<(), OnboardingError> {
        let email = normalize_email(email)?;

        let user = self
            .users
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| OnboardingError::NotFound {
                email: email.to_string(),
            })?;
        if user.onboarding_step != OnboardingStep::Registered {
            return Err(OnboardingError::InvalidStep {
                expected: OnboardingStep::Registered.as_u8(),
                actual: user.onboarding_step.as_u8(),
            });
        }

        self.codes.delete_codes_for_email(email).await?;
        self.issue_code(email).await
    }

    /// Redeem a verification code and advance 1 → 2.
    pub async fn verify(&self, email: &str, code: &str) -> Result<String, OnboardingError> {
        let email = email.trim();
        let code = code.trim();
        match (email.is_empty(), code.is_empty()) {
            (true, true) => return Err(OnboardingError::InvalidInput("email, code".into())),
            (true, false) => return Err(OnboardingError::InvalidInput("email".into())),
            (false, true) => return Err(OnboardingError::InvalidInput("code".into())),
            (false, false) => {}
        }

        if !self.codes.redeem_code(email, code, self.code_cutoff()).await? {
            warn!(email, "Verification rejected: no matching code");
            return Err(OnboardingError::InvalidCode);
        }

        self.advance(email, StepPatch::VerifyEmail).await
    }

    /// Record the user's names and advance 2 → 3.
    pub async fn set_profile(
        &self,
        claims: &Claims,
        first_name: &str,
        last_name: &str,
    ) -> Result<String, OnboardingError> {
        let first_name = first_name.trim();
        let last_name = last_name.trim();
        let missing: Vec<&str> = [("firstName", first_name), ("lastName", last_name)]
            .into_iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(field, _)| field)
            .collect();
        if !missing.is_empty() {
            return Err(OnboardingError::InvalidInput(missing.join(", ")));
        }

        require_step(claims, OnboardingStep::EmailVerified)?;

        let patch = StepPatch::SetProfile {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        };
        self.advance(&claims.email, patch).await
    }

    /// Accept the terms and advance 3 → 4.
    pub async fn accept_terms(
        &self,
        claims: &Claims,
        accepted: bool,
    ) -> Result<String, OnboardingError> {
        if !accepted {
            return Err(OnboardingError::InvalidInput("termsAccepted".into()));
        }

        require_step(claims, OnboardingStep::ProfileSet)?;

        let patch = StepPatch::AcceptTerms {
            accepted_at: Utc::now(),
        };
        self.advance(&claims.email, patch).await
    }

    /// Verify a presented bearer token.
    pub fn authenticate(&self, token: &str) -> Result<Claims, OnboardingError> {
        self.issuer.decode(token).map_err(|e| {
            warn!(error = %e, "Credential rejected");
            OnboardingError::Unauthorized(e.to_string())
        })
    }

    /// Conditional transition, then re-read and mint a fresh credential.
    async fn advance(&self, email: &str, patch: StepPatch) -> Result<String, OnboardingError> {
        let expected = patch.expected_step();

        if !self.users.advance_user(email, &patch).await? {
            return match self.users.find_user_by_email(email).await? {
                None => {
                    warn!(email, "Transition target missing");
                    Err(OnboardingError::NotFound {
                        email: email.to_string(),
                    })
                }
                Some(current) => {
                    warn!(
                        email,
                        expected = %expected,
                        current = %current.onboarding_step,
                        "Step changed concurrently"
                    );
                    Err(OnboardingError::StepConflict {
                        expected: expected.as_u8(),
                    })
                }
            };
        }

        let user = self
            .users
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| OnboardingError::NotFound {
                email: email.to_string(),
            })?;
        info!(user_id = %user.id, email, step = %user.onboarding_step, "Onboarding step advanced");

        Ok(self.issuer.issue(&user)?)
    }

    async fn issue_code(&self, email: &str) -> Result<(), OnboardingError> {
        let code = VerificationCode::generate(email);
        self.codes.insert_code(&code).await?;

        if let Err(e) = self
            .notifier
            .send(email, VERIFY_SUBJECT, &verification_body(&code.code))
            .await
        {
            warn!(email, notifier = self.notifier.name(), error = %e, "Verification email failed");
            return Err(OnboardingError::NotificationFailure(e));
        }
        Ok(())
    }

    /// Codes issued before this instant have expired.
    fn code_cutoff(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.code_ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn normalize_email(email: &str) -> Result<&str, OnboardingError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(OnboardingError::InvalidInput("email".into()));
    }
    if !is_plausible_email(email) {
        return Err(OnboardingError::InvalidInput(format!("email ({email:?} is malformed)")));
    }
    Ok(email)
}

fn require_step(claims: &Claims, expected: OnboardingStep) -> Result<(), OnboardingError> {
    if claims.onboarding_step != expected {
        warn!(
            email = %claims.email,
            expected = %expected,
            actual = %claims.onboarding_step,
            "Credential at wrong onboarding step"
        );
        return Err(OnboardingError::InvalidStep {
            expected: expected.as_u8(),
            actual: claims.onboarding_step.as_u8(),
        });
    }
    Ok(())
}
