//! Persisting state-machine decisions together with their side effects.
//!
//! A transition, the capsule marks it consumes and the notifications it
//! produces are written through the same connection, so callers commit or
//! roll back all of them at once.

use heirloom_core::reminder::due_reminder;
use heirloom_core::{
    evaluate, new_id, Notification, NotificationKind, ReleaseCause, TimeCapsule, Timestamp,
    Transition, Vault,
};
use heirloom_store::{capsules, notifications, tokens, vaults, StoreResult};
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeSet;

/// What one call to [`advance`] or [`persist`] changed.
#[derive(Debug, Clone, Default)]
pub(crate) struct Applied {
    pub transition: Option<Transition>,
    /// Reminder threshold sent, in days.
    pub reminder: Option<u32>,
    pub notifications: usize,
    pub capsules_marked: usize,
}

/// Apply every time-driven change due for `vault` at `now`: release, grace
/// entry or a pre-deadline reminder.
///
/// `vault` is the caller's snapshot; the write is conditional on its version
/// and fails with `StoreError::Conflict` if the row moved on.
pub(crate) fn advance(
    conn: &Connection,
    vault: &Vault,
    reminder_days: &[u32],
    now: Timestamp,
) -> StoreResult<Applied> {
    let due = capsules::due_for_vault(conn, &vault.id, now)?;

    if vault.is_released() {
        // Late capsules of a released vault are retired silently
        let mut applied = Applied::default();
        for capsule in &due {
            if capsules::mark_triggered(conn, &capsule.id, now)? {
                applied.capsules_marked += 1;
            }
        }
        return Ok(applied);
    }

    let decision = evaluate(vault, !due.is_empty(), now);
    if decision.fired() {
        return persist(conn, vault, decision.vault, decision.transition, &due, now);
    }

    match due_reminder(vault, reminder_days, now) {
        Some(days) => {
            let mut next = vault.clone();
            next.last_reminder_days = Some(days);
            persist_reminder(conn, vault, next, days, now)
        }
        None => Ok(Applied::default()),
    }
}

/// Write `next` over `current` and record the side effects of `transition`.
pub(crate) fn persist(
    conn: &Connection,
    current: &Vault,
    mut next: Vault,
    transition: Option<Transition>,
    due: &[TimeCapsule],
    now: Timestamp,
) -> StoreResult<Applied> {
    vaults::update_if_version(conn, &mut next, current.version)?;

    let mut applied = Applied {
        transition,
        ..Applied::default()
    };
    if matches!(transition, Some(Transition::Released(ReleaseCause::TimeCapsule))) {
        for capsule in due {
            if capsules::mark_triggered(conn, &capsule.id, now)? {
                applied.capsules_marked += 1;
            }
        }
    }

    let outgoing = match transition {
        Some(Transition::GraceEntered) => vec![warning(&next, now)],
        Some(Transition::Released(cause)) => releases(conn, &next, cause, now)?,
        Some(Transition::GraceCancelled) | None => Vec::new(),
    };
    applied.notifications = record(conn, &outgoing)?;

    if let Some(t) = transition {
        log::info!(
            "Vault {} {} (version {})",
            next.id,
            t.as_str(),
            next.version
        );
    }
    Ok(applied)
}

fn persist_reminder(
    conn: &Connection,
    current: &Vault,
    mut next: Vault,
    days: u32,
    now: Timestamp,
) -> StoreResult<Applied> {
    vaults::update_if_version(conn, &mut next, current.version)?;
    let note = notification(
        &next,
        &format!("reminder_{}", days),
        &next.owner_id,
        NotificationKind::Reminder,
        json!({
            "vault_id": next.id,
            "days_remaining": days,
            "grace_deadline": next.grace_deadline(),
        }),
        now,
    );
    log::debug!("Vault {} reminder at {} days", next.id, days);
    Ok(Applied {
        reminder: Some(days),
        notifications: record(conn, &[note])?,
        ..Applied::default()
    })
}

fn record(conn: &Connection, outgoing: &[Notification]) -> StoreResult<usize> {
    let mut inserted = 0;
    for n in outgoing {
        if notifications::insert_once(conn, n)? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

fn notification(
    vault: &Vault,
    label: &str,
    recipient: &str,
    kind: NotificationKind,
    payload: serde_json::Value,
    now: Timestamp,
) -> Notification {
    Notification {
        id: new_id(),
        user_id: recipient.to_string(),
        kind,
        payload,
        created_at: now,
        read: false,
        dedupe_key: format!("{}:{}:{}:{}", vault.id, label, vault.version, recipient),
    }
}

fn warning(vault: &Vault, now: Timestamp) -> Notification {
    notification(
        vault,
        Transition::GraceEntered.as_str(),
        &vault.owner_id,
        NotificationKind::Warning,
        json!({
            "vault_id": vault.id,
            "grace_started_at": vault.grace_started_at,
            "release_deadline": vault.release_deadline(),
        }),
        now,
    )
}

/// One release notice for the owner plus one per distinct holder of a
/// still-valid token.
fn releases(
    conn: &Connection,
    vault: &Vault,
    cause: ReleaseCause,
    now: Timestamp,
) -> StoreResult<Vec<Notification>> {
    let holders: BTreeSet<String> = tokens::list_for_vault(conn, &vault.id)?
        .into_iter()
        .filter(|t| t.is_valid(now))
        .filter_map(|t| t.holder)
        .filter(|h| *h != vault.owner_id)
        .collect();

    let label = Transition::Released(cause).as_str();
    let payload = |role: &str| {
        json!({
            "vault_id": vault.id,
            "cause": cause.as_str(),
            "released_at": vault.released_at,
            "role": role,
        })
    };

    let mut out = vec![notification(
        vault,
        label,
        &vault.owner_id,
        NotificationKind::Released,
        payload("owner"),
        now,
    )];
    out.extend(holders.iter().map(|holder| {
        notification(
            vault,
            label,
            holder,
            NotificationKind::Released,
            payload("holder"),
            now,
        )
    }));
    Ok(out)
}
