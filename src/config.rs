//! Configuration types.
//!
//! Built once at startup and handed to each component that needs it.

use std::time::Duration;

use axum::http::HeaderValue;
use secrecy::SecretString;

use crate::error::ConfigError;

/// Deployment environment, selected by the `ENV` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

/// Outbound SMTP settings for the verification mailer.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub sender: String,
}

/// Credential signing settings.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Shared HS256 secret.
    pub secret: SecretString,
    /// Token lifetime; `None` issues tokens without an `exp` claim.
    pub lifetime: Option<Duration>,
}

/// Per-client request budget for the registration endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per client and endpoint in each window.
    pub requests: u32,
    pub window: Duration,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub environment: Environment,
    pub database_path: String,
    pub bind_addr: String,
    pub credential: CredentialConfig,
    /// How long a verification code stays redeemable.
    pub code_ttl: Duration,
    /// `None` selects the console notifier.
    pub smtp: Option<SmtpConfig>,
    /// Empty means any origin.
    pub cors_allowed_origins: Vec<HeaderValue>,
    /// `None` disables throttling.
    pub auth_rate_limit: Option<RateLimitConfig>,
}

impl ServiceConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match var("ENV").as_deref() {
            Some("prod") => Environment::Prod,
            _ => Environment::Dev,
        };

        let database_path =
            var("DATABASE_PATH").unwrap_or_else(|| "./data/onboarding.db".to_string());
        let bind_addr = var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let secret = match (var("JWT_SECRET"), environment) {
            (Some(secret), _) => secret,
            (None, Environment::Dev) => "secret".to_string(),
            (None, Environment::Prod) => {
                return Err(ConfigError::MissingEnvVar("JWT_SECRET".into()));
            }
        };

        let lifetime = match var("JWT_EXPIRATION") {
            Some(raw) => parse_duration("JWT_EXPIRATION", &raw)?,
            None => Duration::from_secs(30 * 60),
        };
        let lifetime = (!lifetime.is_zero()).then_some(lifetime);

        let code_ttl = match var("CODE_TTL") {
            Some(raw) => parse_duration("CODE_TTL", &raw)?,
            None => Duration::from_secs(15 * 60),
        };
        if code_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "CODE_TTL".into(),
                message: "must be greater than zero".into(),
            });
        }

        let smtp = match var("SMTP_HOST") {
            Some(host) => {
                let port = match var("SMTP_PORT") {
                    Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                        key: "SMTP_PORT".into(),
                        message: format!("{e}"),
                    })?,
                    None => 587,
                };
                let username = var("SMTP_USERNAME").unwrap_or_default();
                let sender = var("MAIL_SENDER")
                    .or_else(|| (!username.is_empty()).then(|| username.clone()))
                    .ok_or_else(|| ConfigError::MissingEnvVar("MAIL_SENDER".into()))?;
                Some(SmtpConfig {
                    host,
                    port,
                    username,
                    password: SecretString::from(var("SMTP_PASSWORD").unwrap_or_default()),
                    sender,
                })
            }
            None if environment == Environment::Prod => {
                return Err(ConfigError::MissingEnvVar("SMTP_HOST".into()));
            }
            None => None,
        };

        let cors_allowed_origins = var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_origin)
            .collect::<Result<Vec<_>, _>>()?;

        let requests = match var("AUTH_RATE_LIMIT") {
            Some(raw) => raw.parse::<u32>().map_err(|e| ConfigError::InvalidValue {
                key: "AUTH_RATE_LIMIT".into(),
                message: format!("{e}"),
            })?,
            None => 5,
        };
        let window = match var("AUTH_RATE_WINDOW") {
            Some(raw) => parse_duration("AUTH_RATE_WINDOW", &raw)?,
            None => Duration::from_secs(60),
        };
        if window.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "AUTH_RATE_WINDOW".into(),
                message: "must be greater than zero".into(),
            });
        }
        let auth_rate_limit = (requests > 0).then_some(RateLimitConfig { requests, window });

        Ok(Self {
            environment,
            database_path,
            bind_addr,
            credential: CredentialConfig {
                secret: SecretString::from(secret),
                lifetime,
            },
            code_ttl,
            smtp,
            cors_allowed_origins,
            auth_rate_limit,
        })
    }
}

/// An origin is `http://` or `https://` followed by a host, with no path.
fn parse_origin(origin: &str) -> Result<HeaderValue, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "CORS_ALLOWED_ORIGINS".into(),
        message: format!("{origin:?} {message}"),
    };

    let host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .ok_or_else(|| invalid("must start with http:// or https://"))?;
    if host.is_empty() || host.contains(['/', ' ']) {
        return Err(invalid("must be a bare scheme://host[:port]"));
    }
    HeaderValue::from_str(origin).map_err(|_| invalid("is not a valid header value"))
}

/// Parse durations like `30m`, `1h`, `45s`, `2d`. A bare number is seconds.
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| invalid(format!("expected a duration like 30m, got {raw:?}")))?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => return Err(invalid(format!("unknown duration unit {other:?}"))),
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid(format!("duration {raw:?} is too large")))
}
