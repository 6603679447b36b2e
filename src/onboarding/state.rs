//! Onboarding state machine: which step the user is on.

use serde::{Deserialize, Serialize};

/// The steps of registration.
///
/// Progresses linearly: Registered → EmailVerified → ProfileSet →
/// TermsAccepted. Serialized as the bare integer 1-4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OnboardingStep {
    Registered = 1,
    EmailVerified = 2,
    ProfileSet = 3,
    TermsAccepted = 4,
}

impl OnboardingStep {
    /// The only step reachable from this one. `None` once onboarding is done.
    pub fn next(&self) -> Option<OnboardingStep> {
        use OnboardingStep::*;
        match self {
            Registered => Some(EmailVerified),
            EmailVerified => Some(ProfileSet),
            ProfileSet => Some(TermsAccepted),
            TermsAccepted => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl From<OnboardingStep> for u8 {
    fn from(step: OnboardingStep) -> Self {
        step.as_u8()
    }
}

impl TryFrom<u8> for OnboardingStep {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Registered),
            2 => Ok(Self::EmailVerified),
            3 => Ok(Self::ProfileSet),
            4 => Ok(Self::TermsAccepted),
            other => Err(format!("onboarding step must be 1-4, got {other}")),
        }
    }
}

impl TryFrom<i64> for OnboardingStep {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| format!("onboarding step must be 1-4, got {value}"))
            .and_then(Self::try_from)
    }
}

impl std::fmt::Display for OnboardingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::EmailVerified => "email_verified",
            Self::ProfileSet => "profile_set",
            Self::TermsAccepted => "terms_accepted",
        };
        write!(f, "{s}")
    }
}
