//! Notification message templates
//!
//! Payload fields read here are written by the engine:
//!
//! | kind       | fields                                                     |
//! |------------|------------------------------------------------------------|
//! | `reminder` | `vault_id`, `days_remaining`, `grace_deadline`             |
//! | `warning`  | `vault_id`, `grace_started_at`, `release_deadline`         |
//! | `released` | `vault_id`, `cause`, `released_at`, `role` (owner/holder)  |
//!
//! Missing fields degrade to placeholders rather than failing delivery.

use chrono::DateTime;
use heirloom_core::{Notification, NotificationKind, Timestamp};
use serde_json::Value;

/// A notification message ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    /// Message subject (for email)
    pub subject: String,
    /// Message body (plain text)
    pub body: String,
    pub kind: NotificationKind,
}

fn text<'a>(payload: &'a Value, field: &str) -> &'a str {
    payload.get(field).and_then(Value::as_str).unwrap_or("unknown")
}

fn when(payload: &Value, field: &str) -> String {
    payload
        .get(field)
        .and_then(Value::as_i64)
        .map(format_timestamp)
        .unwrap_or_else(|| "an unknown time".to_string())
}

/// Render a Unix timestamp as `YYYY-MM-DD HH:MM UTC`.
pub fn format_timestamp(ts: Timestamp) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Build the subject and body for a notification.
pub fn render(notification: &Notification) -> NotificationMessage {
    let p = &notification.payload;
    let vault = text(p, "vault_id");

    let (subject, body) = match notification.kind {
        NotificationKind::Reminder => {
            let days = p.get("days_remaining").and_then(Value::as_u64).unwrap_or(0);
            let days_str = if days == 1 {
                "1 day".to_string()
            } else {
                format!("{} days", days)
            };
            (
                format!("Heirloom: Check-in reminder ({} remaining)", days_str),
                format!(
                    r#"Hello,

This is a friendly reminder that your Heirloom vault {} needs a check-in
within {}.

Check-in deadline: {}

If you miss it, a grace period starts and your beneficiaries are told
the vault may soon open.

Heirloom"#,
                    vault,
                    days_str,
                    when(p, "grace_deadline")
                ),
            )
        }

        NotificationKind::Warning => (
            "Heirloom: Check-in WARNING (grace period started)".to_string(),
            format!(
                r#"WARNING: Check-in Missed

Your Heirloom vault {} missed its check-in deadline and entered its
grace period at {}.

Unless you check in, the vault will be released to your beneficiaries at
{}.

Check in now to cancel the grace period.

Heirloom"#,
                vault,
                when(p, "grace_started_at"),
                when(p, "release_deadline")
            ),
        ),

        NotificationKind::Released => {
            let reason = match text(p, "cause") {
                "time_capsule" => "a scheduled time capsule came due",
                "inactivity" => "its grace period ended without a check-in",
                _ => "its release conditions were met",
            };
            let next_steps = if text(p, "role") == "holder" {
                "You can now redeem your legacy token to access the released items."
            } else {
                "Beneficiaries holding a legacy token can now redeem it."
            };
            (
                "Heirloom: Vault RELEASED".to_string(),
                format!(
                    r#"Vault Released

Heirloom vault {} was released at {} because {}.

{}

Heirloom"#,
                    vault,
                    when(p, "released_at"),
                    reason,
                    next_steps
                ),
            )
        }
    };

    NotificationMessage {
        subject,
        body,
        kind: notification.kind,
    }
}
