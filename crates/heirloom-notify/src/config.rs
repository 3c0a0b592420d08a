//! Notification configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Email (SMTP) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Enable email notifications
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// SMTP server hostname
    pub smtp_host: String,
    /// SMTP port (typically 587 for TLS)
    #[serde(default = "default_port")]
    pub smtp_port: u16,
    /// SMTP username
    pub smtp_user: String,
    /// SMTP password
    pub smtp_password: String,
    /// Sender email address
    pub from_address: String,
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    587
}

impl EmailConfig {
    /// Create a new email config
    pub fn new(
        smtp_host: impl Into<String>,
        smtp_user: impl Into<String>,
        smtp_password: impl Into<String>,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            enabled: true,
            smtp_host: smtp_host.into(),
            smtp_port: default_port(),
            smtp_user: smtp_user.into(),
            smtp_password: smtp_password.into(),
            from_address: from_address.into(),
        }
    }
}

/// Where to reach one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: String,
    pub email: String,
}

/// Maps user ids to email addresses.
#[derive(Debug, Clone, Default)]
pub struct ContactDirectory {
    by_user: HashMap<String, String>,
}

impl ContactDirectory {
    /// Build from a contact list; later entries win on duplicate user ids.
    pub fn new(contacts: impl IntoIterator<Item = Contact>) -> Self {
        Self {
            by_user: contacts
                .into_iter()
                .map(|c| (c.user_id, c.email))
                .collect(),
        }
    }

    pub fn email_for(&self, user_id: &str) -> Option<&str> {
        self.by_user.get(user_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}
