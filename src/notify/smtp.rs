//! SMTP notifier via lettre.

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use super::Notifier;
use crate::config::SmtpConfig;
use crate::error::NotifyError;

/// Sends HTML mail through an authenticated SMTP relay.
pub struct SmtpNotifier {
    config: SmtpConfig,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, NotifyError> {
        let from = parse_mailbox(&config.sender)?;
        Ok(Self { config, from })
    }

    fn build_message(&self, to: &str, subject: &str, body_html: &str) -> Result<Message, NotifyError> {
        Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body_html.to_string())
            .map_err(|e| NotifyError::Build(e.to_string()))
    }

    fn transport(&self) -> Result<SmtpTransport, NotifyError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        Ok(SmtpTransport::relay(&self.config.host)
            .map_err(|e| NotifyError::Transport(format!("SMTP relay error: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .build())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|e| NotifyError::InvalidAddress {
        address: address.to_string(),
        reason: format!("{e}"),
    })
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), NotifyError> {
        let email = self.build_message(to, subject, body_html)?;
        let transport = self.transport()?;

        // lettre's SmtpTransport is blocking
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| NotifyError::Transport(format!("send task failed: {e}")))?
            .map_err(|e| NotifyError::Transport(format!("SMTP send failed: {e}")))?;

        tracing::info!(to = %to, "Email sent");
        Ok(())
    }
}
