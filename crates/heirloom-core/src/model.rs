//! Domain records shared by the store, engine and server.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unix timestamp in seconds.
pub type Timestamp = i64;

/// Failure to parse a stored enum column.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// variants map one-to-one onto stored strings.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(ParseError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ============================================================================
// Vault
// ============================================================================

/// Lifecycle state of a vault. `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultState {
    Sealed,
    GracePeriod,
    Released,
}

string_enum!(VaultState, "vault state", {
    Sealed => "sealed",
    GracePeriod => "grace_period",
    Released => "released",
});

/// Why a vault was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCause {
    /// Grace period ran out without a check-in.
    Inactivity,
    /// A scheduled time capsule came due.
    TimeCapsule,
}

string_enum!(ReleaseCause, "release cause", {
    Inactivity => "inactivity",
    TimeCapsule => "time_capsule",
});

/// A user's sealed collection of legacy items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub id: String,
    pub owner_id: String,
    pub state: VaultState,
    pub check_in_interval_secs: i64,
    pub grace_secs: i64,
    pub last_check_in_at: Timestamp,
    pub grace_started_at: Option<Timestamp>,
    pub released_at: Option<Timestamp>,
    pub release_cause: Option<ReleaseCause>,
    /// Smallest reminder threshold (in days) already sent this check-in cycle.
    pub last_reminder_days: Option<u32>,
    /// Bumped by every persisted write; conditional writes compare against it.
    pub version: i64,
    pub created_at: Timestamp,
}

impl Vault {
    /// A freshly sealed vault whose first check-in cycle starts at `now`.
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        check_in_interval_secs: i64,
        grace_secs: i64,
        now: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            state: VaultState::Sealed,
            check_in_interval_secs,
            grace_secs,
            last_check_in_at: now,
            grace_started_at: None,
            released_at: None,
            release_cause: None,
            last_reminder_days: None,
            version: 0,
            created_at: now,
        }
    }

    pub fn is_released(&self) -> bool {
        self.state == VaultState::Released
    }

    /// Instant at which inactivity starts the grace countdown.
    pub fn grace_deadline(&self) -> Timestamp {
        self.last_check_in_at
            .saturating_add(self.check_in_interval_secs)
    }

    /// Instant at which the running grace period ends, if one is running.
    pub fn release_deadline(&self) -> Option<Timestamp> {
        self.grace_started_at
            .map(|started| started.saturating_add(self.grace_secs))
    }

    /// `released_at` and `release_cause` are set iff the state is `Released`;
    /// `grace_started_at` is set iff the state is `GracePeriod`.
    pub fn invariants_hold(&self) -> bool {
        let released = self.state == VaultState::Released;
        let grace = self.state == VaultState::GracePeriod;
        released == self.released_at.is_some()
            && released == self.release_cause.is_some()
            && grace == self.grace_started_at.is_some()
    }
}

// ============================================================================
// Check-ins
// ============================================================================

/// How the owner proved liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInMethod {
    Manual,
    App,
    Email,
    Api,
}

string_enum!(CheckInMethod, "check-in method", {
    Manual => "manual",
    App => "app",
    Email => "email",
    Api => "api",
});

/// One liveness signal. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIn {
    pub id: i64,
    pub vault_id: String,
    pub occurred_at: Timestamp,
    pub method: CheckInMethod,
}

// ============================================================================
// Time capsules
// ============================================================================

/// Which vault items a release exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemScope {
    All,
    Items(Vec<String>),
}

impl ItemScope {
    /// Smallest scope covering both `self` and `other`.
    pub fn union(self, other: &ItemScope) -> ItemScope {
        match (self, other) {
            (ItemScope::All, _) | (_, ItemScope::All) => ItemScope::All,
            (ItemScope::Items(mut mine), ItemScope::Items(theirs)) => {
                for item in theirs {
                    if !mine.contains(item) {
                        mine.push(item.clone());
                    }
                }
                ItemScope::Items(mine)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ItemScope::Items(items) if items.is_empty())
    }
}

/// A scheduled, liveness-independent release trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeCapsule {
    pub id: String,
    pub vault_id: String,
    pub release_at: Timestamp,
    pub item_scope: ItemScope,
    pub triggered: bool,
    pub triggered_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl TimeCapsule {
    pub fn is_due(&self, now: Timestamp) -> bool {
        !self.triggered && self.release_at <= now
    }
}

// ============================================================================
// Legacy tokens
// ============================================================================

/// A beneficiary credential. Only the salted hash of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyToken {
    pub id: String,
    pub secret_hash: String,
    pub owner_user_id: String,
    pub vault_id: String,
    /// Beneficiary identifier notified when the vault is released.
    pub holder: Option<String>,
    pub max_redemptions: Option<u32>,
    pub redemption_count: u32,
    pub expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl LegacyToken {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_redemptions
            .is_some_and(|max| self.redemption_count >= max)
    }

    /// Not expired and not exhausted.
    pub fn is_valid(&self, now: Timestamp) -> bool {
        !self.is_expired(now) && !self.is_exhausted()
    }
}

/// Token metadata safe to show the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSummary {
    pub id: String,
    pub vault_id: String,
    pub holder: Option<String>,
    pub max_redemptions: Option<u32>,
    pub redemption_count: u32,
    pub expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl From<&LegacyToken> for TokenSummary {
    fn from(token: &LegacyToken) -> Self {
        Self {
            id: token.id.clone(),
            vault_id: token.vault_id.clone(),
            holder: token.holder.clone(),
            max_redemptions: token.max_redemptions,
            redemption_count: token.redemption_count,
            expires_at: token.expires_at,
            created_at: token.created_at,
        }
    }
}

/// Time-boxed access handed to a beneficiary after a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub grant_id: String,
    pub token_id: String,
    pub vault_id: String,
    pub item_scope: ItemScope,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
}

// ============================================================================
// Notifications
// ============================================================================

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Check-in deadline approaching.
    Reminder,
    /// Check-in missed; grace period started.
    Warning,
    /// Vault released.
    Released,
}

string_enum!(NotificationKind, "notification kind", {
    Reminder => "reminder",
    Warning => "warning",
    Released => "released",
});

/// An event addressed to one user. Produced, never consumed, by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
    pub read: bool,
    /// Unique per (vault, transition, version, recipient).
    pub dedupe_key: String,
}
