//! Heirloom Notification Service
//!
//! Delivers engine-produced [`Notification`] records to people.
//!
//! # Delivery Methods
//!
//! - **Log**: writes each notification to the log (default)
//! - **Email**: SMTP, recipient resolved through the contact directory
//!
//! The engine never calls a gateway while it holds a database transaction.
//! Notifications are recorded first and drained later by the outbox
//! dispatcher, which calls [`NotificationGateway::publish`] and retries on
//! error. A gateway should therefore fail loudly rather than swallow errors it
//! could recover from on a retry.
//!
//! # Example
//!
//! ```ignore
//! use heirloom_notify::{ContactDirectory, EmailConfig, NotificationGateway, SmtpGateway};
//!
//! let gateway = SmtpGateway::new(email_config, ContactDirectory::new(contacts))?;
//! gateway.publish(&notification)?;
//! ```

mod config;
mod smtp;
pub mod templates;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{Contact, ContactDirectory, EmailConfig};
pub use smtp::SmtpGateway;
pub use templates::NotificationMessage;

use heirloom_core::Notification;
use thiserror::Error;

/// Errors from notification operations
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Email send failed: {0}")]
    EmailFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

/// Something that can deliver a notification to its user.
///
/// Implementations are blocking; async callers run them on a blocking thread.
pub trait NotificationGateway: Send + Sync {
    fn publish(&self, notification: &Notification) -> Result<(), NotifyError>;
}

impl<G: NotificationGateway + ?Sized> NotificationGateway for std::sync::Arc<G> {
    fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        (**self).publish(notification)
    }
}

/// Writes notifications to the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGateway;

impl NotificationGateway for LogGateway {
    fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = templates::render(notification);
        log::info!(
            "Notification {} for {}: {}",
            notification.id,
            notification.user_id,
            message.subject
        );
        Ok(())
    }
}
