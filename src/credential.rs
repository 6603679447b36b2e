//! Credential issuer: signed, stateless onboarding tokens.
//!
//! Tokens are compact HS256 JWS strings (`header.claims.signature`, each
//! part base64url without padding). The claims carry a full snapshot of the
//! user at issuance, so the step a caller may perform next travels with the
//! token and nothing is stored server-side.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::CredentialConfig;
use crate::error::CredentialError;
use crate::onboarding::{OnboardingStep, User};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Claims embedded in an onboarding credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub onboarding_step: OnboardingStep,
    pub email_verified: bool,
    pub terms_accepted: bool,
    pub terms_accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    fn snapshot(user: &User, iat: i64, exp: Option<i64>) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            onboarding_step: user.onboarding_step,
            email_verified: user.email_verified,
            terms_accepted: user.terms_accepted,
            terms_accepted_at: user.terms_accepted_at,
            created_at: user.created_at,
            iat,
            exp,
        }
    }
}

/// Signs and verifies onboarding credentials with a shared secret.
#[derive(Clone)]
pub struct CredentialIssuer {
    secret: SecretString,
    lifetime: Option<Duration>,
}

impl std::fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl CredentialIssuer {
    pub fn new(config: &CredentialConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            lifetime: config.lifetime,
        }
    }

    /// Mint a token for the user's current state.
    pub fn issue(&self, user: &User) -> Result<String, CredentialError> {
        self.issue_at(user, Utc::now())
    }

    pub fn issue_at(&self, user: &User, now: DateTime<Utc>) -> Result<String, CredentialError> {
        let iat = now.timestamp();
        let exp = self.lifetime.map(|lifetime| {
            let secs = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
            iat.saturating_add(secs)
        });
        let claims = Claims::snapshot(user, iat, exp);

        let header = Header {
            alg: ALGORITHM.to_string(),
            typ: Some("JWT".to_string()),
        };
        let header_json = serde_json::to_vec(&header)
            .map_err(|e| CredentialError::Malformed(format!("header: {e}")))?;
        let claims_json = serde_json::to_vec(&claims)
            .map_err(|e| CredentialError::InvalidClaims(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let signature = self.sign(signing_input.as_bytes())?;

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Verify a token and recover its claims.
    pub fn decode(&self, token: &str) -> Result<Claims, CredentialError> {
        self.decode_at(token, Utc::now())
    }

    pub fn decode_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, CredentialError> {
        let mut parts = token.trim().split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CredentialError::Malformed("expected three segments".into()));
        };

        let header_bytes = decode_segment("header", header_b64)?;
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| CredentialError::Malformed(format!("header: {e}")))?;
        if header.alg != ALGORITHM {
            return Err(CredentialError::UnsupportedAlgorithm(header.alg));
        }

        let signature = decode_segment("signature", signature_b64)?;
        let signing_input = &token.trim()[..header_b64.len() + 1 + claims_b64.len()];
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CredentialError::BadSignature)?;

        let claims_bytes = decode_segment("claims", claims_b64)?;
        let claims: Claims = serde_json::from_slice(&claims_bytes)
            .map_err(|e| CredentialError::InvalidClaims(e.to_string()))?;

        if let Some(exp) = claims.exp {
            if exp <= now.timestamp() {
                return Err(CredentialError::Expired(exp));
            }
        }

        Ok(claims)
    }

    fn mac(&self) -> Result<HmacSha256, CredentialError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| CredentialError::Key(e.to_string()))
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let mut mac = self.mac()?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn decode_segment(name: &str, segment: &str) -> Result<Vec<u8>, CredentialError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| CredentialError::Malformed(format!("{name}: {e}")))
}
