//! Append-only check-in log.

use crate::vaults::parse_col;
use crate::StoreResult;
use heirloom_core::{CheckIn, CheckInMethod, Timestamp};
use rusqlite::{params, Connection};

/// Append a check-in. Returns the new row id.
pub fn insert(
    conn: &Connection,
    vault_id: &str,
    occurred_at: Timestamp,
    method: CheckInMethod,
) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO check_ins (vault_id, occurred_at, method) VALUES (?1, ?2, ?3)",
        params![vault_id, occurred_at, method.as_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent check-ins for a vault, newest first.
pub fn list(conn: &Connection, vault_id: &str, limit: usize) -> StoreResult<Vec<CheckIn>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, vault_id, occurred_at, method FROM check_ins
         WHERE vault_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![vault_id, limit as i64], |row| {
        let method: String = row.get(3)?;
        Ok(CheckIn {
            id: row.get(0)?,
            vault_id: row.get(1)?,
            occurred_at: row.get(2)?,
            method: parse_col(3, &method)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
