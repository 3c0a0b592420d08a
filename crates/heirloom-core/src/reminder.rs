//! Pre-deadline check-in reminders.
//!
//! A sealed vault gets at most one reminder per threshold per check-in cycle.
//! Thresholds are days before grace entry, e.g. `[7, 3, 1]`. When several
//! thresholds have been crossed since the last sweep only the most urgent one
//! is sent.

use crate::machine::seconds_until_grace;
use crate::model::{Timestamp, Vault, VaultState};

pub const SECS_PER_DAY: i64 = 86_400;

/// Default reminder thresholds in days before grace entry.
pub fn default_thresholds() -> Vec<u32> {
    vec![7, 3, 1]
}

/// Threshold (in days) whose reminder should be sent now, if any.
pub fn due_reminder(vault: &Vault, thresholds: &[u32], now: Timestamp) -> Option<u32> {
    if vault.state != VaultState::Sealed {
        return None;
    }
    let remaining = seconds_until_grace(vault, now);
    if remaining <= 0 {
        return None;
    }
    let crossed = thresholds
        .iter()
        .copied()
        .filter(|&days| days > 0 && remaining <= days as i64 * SECS_PER_DAY)
        .min()?;
    match vault.last_reminder_days {
        Some(sent) if sent <= crossed => None,
        _ => Some(crossed),
    }
}

/// Widest reminder window in seconds; vaults further than this from grace
/// entry never need a reminder.
pub fn reminder_window_secs(thresholds: &[u32]) -> i64 {
    thresholds
        .iter()
        .copied()
        .max()
        .map(|days| days as i64 * SECS_PER_DAY)
        .unwrap_or(0)
}
