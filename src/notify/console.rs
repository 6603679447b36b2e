//! Console notifier for development: logs instead of sending.

use async_trait::async_trait;

use super::Notifier;
use crate::error::NotifyError;

/// Notifier that writes messages to the log.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), NotifyError> {
        if to.trim().is_empty() {
            return Err(NotifyError::InvalidAddress {
                address: to.to_string(),
                reason: "empty".into(),
            });
        }
        tracing::info!(to = %to, subject = %subject, body = %body_html, "Console notification");
        Ok(())
    }
}
