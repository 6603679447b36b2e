use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::ServiceExt;
use axum::extract::Request;

use onboarding_service::config::ServiceConfig;
use onboarding_service::credential::CredentialIssuer;
use onboarding_service::notify::{ConsoleNotifier, Notifier, SmtpNotifier};
use onboarding_service::onboarding::{OnboardingManager, OnboardingRouteState, service_router};
use onboarding_service::ratelimit::RateLimiter;
use onboarding_service::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.database_path))
            .await
            .with_context(|| format!("Failed to open database at {}", config.database_path))?,
    );

    // ── Notifier ─────────────────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match config.smtp.clone() {
        Some(smtp) => Arc::new(SmtpNotifier::new(smtp).context("Invalid SMTP settings")?),
        None => {
            tracing::warn!("SMTP_HOST not set; verification codes will be logged, not sent");
            Arc::new(ConsoleNotifier::new())
        }
    };

    // ── Onboarding ───────────────────────────────────────────────────────
    let issuer = CredentialIssuer::new(&config.credential);
    let manager = Arc::new(OnboardingManager::new(
        db.clone(),
        db,
        notifier.clone(),
        issuer,
        config.code_ttl,
    ));

    let limiter = config.auth_rate_limit.map(RateLimiter::new);
    if limiter.is_none() {
        tracing::warn!("AUTH_RATE_LIMIT is 0; registration endpoints are not throttled");
    }

    let app = service_router(
        OnboardingRouteState { manager, limiter },
        &config.cors_allowed_origins,
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %config.bind_addr,
        env = %config.environment,
        notifier = notifier.name(),
        credential_lifetime = ?config.credential.lifetime,
        rate_limit = ?config.auth_rate_limit,
        "Onboarding service started"
    );

    // Client addresses feed the per-IP rate limiter
    let service = ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(app);
    axum::serve(listener, service).await.context("Server error")?;

    tracing::info!("Server shutting down");
    Ok(())
}
