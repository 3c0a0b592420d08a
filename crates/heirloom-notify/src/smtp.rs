//! SMTP email delivery

use crate::config::{ContactDirectory, EmailConfig};
use crate::templates::{render, NotificationMessage};
use crate::{NotificationGateway, NotifyError};
use heirloom_core::Notification;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

/// Sends notifications by email to addresses from a [`ContactDirectory`].
///
/// Users without a directory entry are skipped with a warning and the
/// notification counts as delivered; retrying cannot help them.
pub struct SmtpGateway {
    from: Mailbox,
    contacts: ContactDirectory,
    transport: SmtpTransport,
}

impl SmtpGateway {
    pub fn new(config: &EmailConfig, contacts: ContactDirectory) -> Result<Self, NotifyError> {
        if !config.enabled {
            return Err(NotifyError::Config("email notifications are disabled".into()));
        }
        let from = config
            .from_address
            .parse()
            .map_err(|e| NotifyError::Config(format!("Invalid from address: {}", e)))?;
        Ok(Self {
            from,
            contacts,
            transport: build_transport(config)?,
        })
    }
}

impl NotificationGateway for SmtpGateway {
    fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        let Some(to) = self.contacts.email_for(&notification.user_id) else {
            log::warn!(
                "No email contact for user {}; dropping notification {}",
                notification.user_id,
                notification.id
            );
            return Ok(());
        };

        let message = render(notification);
        let email = build_message(&self.from, to, &message)?;

        self.transport
            .send(&email)
            .map_err(|e| NotifyError::EmailFailed(format!("SMTP send failed: {}", e)))?;

        log::info!(
            "Email notification sent to {} (kind: {})",
            to,
            notification.kind
        );
        Ok(())
    }
}

/// Build a `lettre::Message` from addresses and rendered content.
fn build_message(
    from: &Mailbox,
    to: &str,
    message: &NotificationMessage,
) -> Result<Message, NotifyError> {
    Message::builder()
        .from(from.clone())
        .to(to
            .parse()
            .map_err(|e| NotifyError::EmailFailed(format!("Invalid to address: {}", e)))?)
        .subject(&message.subject)
        .body(message.body.clone())
        .map_err(|e| NotifyError::EmailFailed(format!("Failed to build email: {}", e)))
}

/// Build a blocking SMTP transport from config.
fn build_transport(config: &EmailConfig) -> Result<SmtpTransport, NotifyError> {
    let creds = Credentials::new(config.smtp_user.clone(), config.smtp_password.clone());

    Ok(SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| NotifyError::Config(format!("SMTP relay error: {}", e)))?
        .credentials(creds)
        .port(config.smtp_port)
        .build())
}
