//! Email sender seam. The notifier wires in the Resend-backed sender; without
//! an API key everything goes through [`LogEmailSender`].

use async_trait::async_trait;

use beacon_common::error::AppError;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AppError>;
}

/// Writes outgoing mail to the log instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AppError> {
        tracing::info!(
            to,
            subject,
            body_len = body.len(),
            "Email sending disabled, logging message instead"
        );
        Ok(())
    }
}
