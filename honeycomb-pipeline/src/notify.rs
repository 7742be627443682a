//! Operator notifications.
//!
//! Delivery is strictly best-effort: the pipeline never fails because a
//! message could not be sent. Missing mail configuration downgrades every
//! call to a logged warning.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{info, warn};

use crate::error::PipelineError;

/// Env vars holding the SMTP relay coordinates.
const SMTP_SERVER_ENV: &str = "HONEYCOMB_SMTP_SERVER";
const SMTP_PORT_ENV: &str = "HONEYCOMB_SMTP_PORT";

/// Sender address for pipeline mail.
const FROM_ADDRESS: &str = "honeycomb@utah.gov";

/// A channel for progress and milestone messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message. Failures are logged by the implementation and
    /// never surface to the caller.
    async fn notify(&self, subject: &str, body: &str);
}

/// SMTP notifier honoring the `send_emails` kill switch.
#[derive(Debug, Clone)]
pub struct SmtpNotifier {
    recipients: Vec<String>,
    send_emails: bool,
}

impl SmtpNotifier {
    pub fn new(recipients: Vec<String>, send_emails: bool) -> Self {
        Self {
            recipients,
            send_emails,
        }
    }

    fn smtp_coordinates() -> Option<(String, u16)> {
        let server = std::env::var(SMTP_SERVER_ENV).ok()?;
        let port = std::env::var(SMTP_PORT_ENV).ok()?.parse().ok()?;
        Some((server, port))
    }

    fn build_message(&self, subject: &str, body: &str) -> Result<Message, PipelineError> {
        let mut builder = Message::builder()
            .from(
                FROM_ADDRESS
                    .parse()
                    .map_err(|err| PipelineError::notification(format!("bad from address: {}", err)))?,
            )
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);

        for recipient in &self.recipients {
            builder = builder.to(recipient
                .parse()
                .map_err(|err| PipelineError::notification(format!("bad recipient {}: {}", recipient, err)))?);
        }

        builder
            .body(body.to_string())
            .map_err(|err| PipelineError::notification(err.to_string()))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        let Some((server, port)) = Self::smtp_coordinates() else {
            warn!(
                "{} / {} are not set; no email sent for: {}",
                SMTP_SERVER_ENV, SMTP_PORT_ENV, subject
            );
            return;
        };

        if !self.send_emails {
            info!("send_emails is off; suppressed: {}", subject);
            return;
        }

        let message = match self.build_message(subject, body) {
            Ok(message) => message,
            Err(err) => {
                warn!("could not build notification: {}", err);
                return;
            }
        };

        let subject = subject.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let transport = SmtpTransport::builder_dangerous(server.as_str()).port(port).build();
            transport.send(&message)
        })
        .await;

        match result {
            Ok(Ok(_)) => info!("sent notification: {}", subject),
            Ok(Err(err)) => warn!("notification failed for {}: {}", subject, err),
            Err(err) => warn!("notification task failed for {}: {}", subject, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_message() {
        let notifier = SmtpNotifier::new(vec!["ops@utah.gov".to_string()], true);
        let message = notifier.build_message("Cache Update (Terrain)", "Levels 0-17 completed.");
        assert!(message.is_ok());
    }

    #[test]
    fn test_build_message_bad_recipient() {
        let notifier = SmtpNotifier::new(vec!["not an address".to_string()], true);
        let result = notifier.build_message("subject", "body");
        assert!(matches!(result, Err(PipelineError::Notification(_))));
    }

    #[tokio::test]
    async fn test_notify_without_env_is_silent() {
        // No SMTP env in the test environment: must log and return.
        let notifier = SmtpNotifier::new(vec!["ops@utah.gov".to_string()], true);
        notifier.notify("subject", "body").await;
    }
}
