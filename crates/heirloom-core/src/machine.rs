//! Vault release state machine.
//!
//! Pure logic: no I/O, no clock reads. Takes a vault snapshot, the current
//! time and whether any of its time capsules is due, and returns the next
//! snapshot plus the transition that fired (if any). The caller (sweeper,
//! check-in tracker) decides what to persist and which notifications to emit.
//!
//! ```text
//! |---- Sealed ----|---- GracePeriod ----|---- Released (terminal)
//! last check-in    +interval             +grace
//! ```
//!
//! A due time capsule releases the vault from either live state; it takes
//! precedence over every other path.

use crate::model::{ReleaseCause, Timestamp, Vault, VaultState};
use serde::{Deserialize, Serialize};

/// A state change produced by an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Sealed → GracePeriod.
    GraceEntered,
    /// GracePeriod → Sealed after a check-in.
    GraceCancelled,
    /// Sealed | GracePeriod → Released.
    Released(ReleaseCause),
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::GraceEntered => "grace_entered",
            Transition::GraceCancelled => "grace_cancelled",
            Transition::Released(_) => "released",
        }
    }
}

/// The outcome of feeding one input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// The vault after the input was applied (unchanged if nothing fired).
    pub vault: Vault,
    pub transition: Option<Transition>,
}

impl Decision {
    fn unchanged(vault: &Vault) -> Self {
        Self {
            vault: vault.clone(),
            transition: None,
        }
    }

    pub fn fired(&self) -> bool {
        self.transition.is_some()
    }
}

fn release(vault: &Vault, cause: ReleaseCause, now: Timestamp) -> Decision {
    let mut next = vault.clone();
    next.state = VaultState::Released;
    next.grace_started_at = None;
    next.released_at = Some(now);
    next.release_cause = Some(cause);
    Decision {
        vault: next,
        transition: Some(Transition::Released(cause)),
    }
}

/// Evaluate time-driven transitions for `vault` at `now`.
///
/// `capsule_due` is true when at least one untriggered capsule of this vault
/// has `release_at <= now`.
pub fn evaluate(vault: &Vault, capsule_due: bool, now: Timestamp) -> Decision {
    match vault.state {
        VaultState::Released => Decision::unchanged(vault),
        _ if capsule_due => release(vault, ReleaseCause::TimeCapsule, now),
        VaultState::Sealed => {
            if now >= vault.grace_deadline() {
                let mut next = vault.clone();
                next.state = VaultState::GracePeriod;
                next.grace_started_at = Some(now);
                Decision {
                    vault: next,
                    transition: Some(Transition::GraceEntered),
                }
            } else {
                Decision::unchanged(vault)
            }
        }
        VaultState::GracePeriod => match vault.release_deadline() {
            Some(deadline) if now >= deadline => release(vault, ReleaseCause::Inactivity, now),
            // No start instant means the row violates its invariants; the store
            // refuses to write such rows, so there is nothing to time here.
            _ => Decision::unchanged(vault),
        },
    }
}

/// Apply a check-in arriving at `now`.
///
/// The check-in always refreshes `last_check_in_at` and the reminder cycle of
/// a live vault. From `GracePeriod` it fires `GraceCancelled`. A released
/// vault is returned unchanged; callers must evaluate time-driven transitions
/// first so an expired grace period or due capsule wins over the check-in.
pub fn reset_on_check_in(vault: &Vault, now: Timestamp) -> Decision {
    if vault.is_released() {
        return Decision::unchanged(vault);
    }
    let mut next = vault.clone();
    next.last_check_in_at = now;
    next.last_reminder_days = None;
    let transition = if vault.state == VaultState::GracePeriod {
        next.state = VaultState::Sealed;
        next.grace_started_at = None;
        Some(Transition::GraceCancelled)
    } else {
        None
    };
    Decision {
        vault: next,
        transition,
    }
}

/// Seconds until the vault enters its grace period (negative when overdue).
pub fn seconds_until_grace(vault: &Vault, now: Timestamp) -> i64 {
    vault.grace_deadline().saturating_sub(now)
}

/// The next instant at which the vault will change state on its own.
///
/// `earliest_capsule` is the earliest untriggered capsule release time.
/// Released vaults have no deadline.
pub fn next_deadline(vault: &Vault, earliest_capsule: Option<Timestamp>) -> Option<Timestamp> {
    let own = match vault.state {
        VaultState::Released => return None,
        VaultState::Sealed => Some(vault.grace_deadline()),
        VaultState::GracePeriod => vault.release_deadline(),
    };
    match (own, earliest_capsule) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
