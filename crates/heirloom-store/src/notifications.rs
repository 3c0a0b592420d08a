//! Notification records doubling as the delivery outbox.
//!
//! Rows are inserted inside the same transaction as the vault transition that
//! caused them, so "transition committed" and "notification recorded" can
//! never disagree. Delivery state (`dispatched_at`, `attempts`,
//! `next_attempt_at`) is tracked separately and never touches vault rows.

use crate::vaults::parse_col;
use crate::StoreResult;
use heirloom_core::{Notification, Timestamp};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

const COLUMNS: &str =
    "id, user_id, kind, payload, created_at, read, dedupe_key, attempts, next_attempt_at";

/// A notification with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub notification: Notification,
    pub attempts: u32,
    /// The value [`claim`] must still find to win the row.
    pub next_attempt_at: Timestamp,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let kind: String = row.get(2)?;
    let payload: String = row.get(3)?;
    Ok(OutboxEntry {
        notification: Notification {
            id: row.get(0)?,
            user_id: row.get(1)?,
            kind: parse_col(2, &kind)?,
            payload: serde_json::from_str(&payload).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
            })?,
            created_at: row.get(4)?,
            read: row.get(5)?,
            dedupe_key: row.get(6)?,
        },
        attempts: row.get(7)?,
        next_attempt_at: row.get(8)?,
    })
}

/// Record a notification unless one with the same dedupe key exists.
/// Returns true if a row was inserted.
pub fn insert_once(conn: &Connection, n: &Notification) -> StoreResult<bool> {
    let affected = conn.execute(
        "INSERT INTO notifications (id, user_id, kind, payload, created_at, read, dedupe_key, next_attempt_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?5)
         ON CONFLICT(dedupe_key) DO NOTHING",
        params![
            n.id,
            n.user_id,
            n.kind.as_str(),
            serde_json::to_string(&n.payload)?,
            n.created_at,
            n.read,
            n.dedupe_key,
        ],
    )?;
    Ok(affected > 0)
}

/// Undelivered notifications whose next attempt is due, oldest first.
pub fn pending(
    conn: &Connection,
    now: Timestamp,
    max_attempts: u32,
    limit: usize,
) -> StoreResult<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM notifications
         WHERE dispatched_at IS NULL AND next_attempt_at <= ?1 AND attempts < ?2
         ORDER BY created_at, id LIMIT ?3"
    ))?;
    let rows = stmt.query_map(params![now, max_attempts, limit as i64], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Take a pending row for delivery by pushing its next attempt out to
/// `lease_until`. Only one dispatcher can win a given `expected_next_attempt_at`;
/// returns false if another one already did or the row was delivered.
pub fn claim(
    conn: &Connection,
    id: &str,
    expected_next_attempt_at: Timestamp,
    lease_until: Timestamp,
) -> StoreResult<bool> {
    let affected = conn.execute(
        "UPDATE notifications SET next_attempt_at = ?3
         WHERE id = ?1 AND dispatched_at IS NULL AND next_attempt_at = ?2",
        params![id, expected_next_attempt_at, lease_until],
    )?;
    if affected == 0 {
        log::debug!("Notification {} already claimed", id);
    }
    Ok(affected > 0)
}

/// Mark a notification delivered.
pub fn mark_dispatched(conn: &Connection, id: &str, now: Timestamp) -> StoreResult<()> {
    conn.execute(
        "UPDATE notifications SET dispatched_at = ?2, attempts = attempts + 1, last_error = NULL
         WHERE id = ?1 AND dispatched_at IS NULL",
        params![id, now],
    )?;
    Ok(())
}

/// Record a failed delivery attempt and when to try again.
pub fn record_failure(
    conn: &Connection,
    id: &str,
    error: &str,
    next_attempt_at: Timestamp,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE notifications SET attempts = attempts + 1, last_error = ?2, next_attempt_at = ?3
         WHERE id = ?1 AND dispatched_at IS NULL",
        params![id, error, next_attempt_at],
    )?;
    Ok(())
}

/// All notifications addressed to a user, newest first.
pub fn list_for_user(conn: &Connection, user_id: &str) -> StoreResult<Vec<Notification>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM notifications WHERE user_id = ?1 ORDER BY created_at DESC, id"
    ))?;
    let rows = stmt.query_map(params![user_id], from_row)?;
    Ok(rows
        .map(|r| r.map(|e| e.notification))
        .collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Mark one of `user_id`'s notifications read. Returns false if the id is
/// unknown or addressed to someone else.
pub fn mark_read(conn: &Connection, user_id: &str, id: &str) -> StoreResult<bool> {
    let affected = conn.execute(
        "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
        params![id, user_id],
    )?;
    Ok(affected > 0)
}
