//! Time capsule records.
//!
//! Capsules are never deleted; firing sets `triggered` once and forever.

use crate::{StoreError, StoreResult};
use heirloom_core::{ItemScope, TimeCapsule, Timestamp};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, vault_id, release_at, item_scope, triggered, triggered_at, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<TimeCapsule> {
    let scope: String = row.get(3)?;
    Ok(TimeCapsule {
        id: row.get(0)?,
        vault_id: row.get(1)?,
        release_at: row.get(2)?,
        item_scope: serde_json::from_str(&scope)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        triggered: row.get(4)?,
        triggered_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Insert a new capsule.
pub fn insert(conn: &Connection, capsule: &TimeCapsule) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO time_capsules (id, vault_id, release_at, item_scope, triggered, triggered_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            capsule.id,
            capsule.vault_id,
            capsule.release_at,
            serde_json::to_string(&capsule.item_scope)?,
            capsule.triggered,
            capsule.triggered_at,
            capsule.created_at,
        ],
    )?;
    Ok(())
}

/// Get a single capsule by id.
pub fn get(conn: &Connection, id: &str) -> StoreResult<Option<TimeCapsule>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {COLUMNS} FROM time_capsules WHERE id = ?1"))?;
    Ok(stmt.query_row(params![id], from_row).optional()?)
}

/// All capsules of a vault, earliest release first.
pub fn list_for_vault(conn: &Connection, vault_id: &str) -> StoreResult<Vec<TimeCapsule>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM time_capsules WHERE vault_id = ?1 ORDER BY release_at, id"
    ))?;
    let rows = stmt.query_map(params![vault_id], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// A row of a due-capsule page. The cursor columns always decode; the
/// capsule itself may not, and a malformed row is reported in place so the
/// rest of the page stays usable.
#[derive(Debug)]
pub struct DueRow {
    pub id: String,
    pub release_at: Timestamp,
    pub capsule: StoreResult<TimeCapsule>,
}

/// One page of untriggered capsules due at `now`, ordered by
/// `(release_at, id)` and strictly after the `after` cursor.
pub fn due_page(
    conn: &Connection,
    now: Timestamp,
    after: Option<(Timestamp, &str)>,
    limit: usize,
) -> StoreResult<Vec<DueRow>> {
    let (after_at, after_id) = after.unwrap_or((Timestamp::MIN, ""));
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM time_capsules
         WHERE triggered = 0 AND release_at <= ?1
           AND (release_at > ?2 OR (release_at = ?2 AND id > ?3))
         ORDER BY release_at, id LIMIT ?4"
    ))?;
    let rows = stmt.query_map(params![now, after_at, after_id, limit as i64], |row| {
        let id: String = row.get(0)?;
        let capsule = from_row(row)
            .map_err(|e| StoreError::Corrupt(format!("time capsule {}: {}", id, e)));
        Ok(DueRow {
            id,
            release_at: row.get(2)?,
            capsule,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Untriggered capsules of one vault that are due at `now`.
pub fn due_for_vault(
    conn: &Connection,
    vault_id: &str,
    now: Timestamp,
) -> StoreResult<Vec<TimeCapsule>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM time_capsules
         WHERE vault_id = ?1 AND triggered = 0 AND release_at <= ?2
         ORDER BY release_at, id"
    ))?;
    let rows = stmt.query_map(params![vault_id, now], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Earliest release time among a vault's untriggered capsules.
pub fn earliest_pending(conn: &Connection, vault_id: &str) -> StoreResult<Option<Timestamp>> {
    let mut stmt = conn.prepare_cached(
        "SELECT MIN(release_at) FROM time_capsules WHERE vault_id = ?1 AND triggered = 0",
    )?;
    Ok(stmt.query_row(params![vault_id], |row| row.get(0))?)
}

/// Mark a capsule triggered. Returns false if it already was (or is unknown).
pub fn mark_triggered(conn: &Connection, id: &str, now: Timestamp) -> StoreResult<bool> {
    let affected = conn.execute(
        "UPDATE time_capsules SET triggered = 1, triggered_at = ?2
         WHERE id = ?1 AND triggered = 0",
        params![id, now],
    )?;
    Ok(affected > 0)
}

/// Union of the item scopes of every triggered capsule of a vault.
pub fn triggered_scope(conn: &Connection, vault_id: &str) -> StoreResult<Option<ItemScope>> {
    let scopes = list_for_vault(conn, vault_id)?
        .into_iter()
        .filter(|c| c.triggered)
        .map(|c| c.item_scope);
    Ok(scopes.reduce(|acc, scope| acc.union(&scope)))
}
