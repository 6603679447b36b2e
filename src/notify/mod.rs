//! Outbound notifications: delivering verification codes.

pub mod console;
pub mod smtp;

use async_trait::async_trait;

use crate::error::NotifyError;

pub use console::ConsoleNotifier;
pub use smtp::SmtpNotifier;

/// Subject line for verification emails.
pub const VERIFY_SUBJECT: &str = "Verify your email";

/// Fire-and-forget delivery of a message to an address.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Deliver an HTML message. Returns once the transport accepts or rejects it.
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), NotifyError>;
}

/// HTML body for a verification email.
pub fn verification_body(code: &str) -> String {
    format!("<p>Your verification code is <strong>{code}</strong></p>")
}
