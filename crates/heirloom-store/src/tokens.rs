//! Legacy token records and compare-and-increment redemption.

use crate::{StoreError, StoreResult};
use heirloom_core::LegacyToken;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, secret_hash, owner_user_id, vault_id, holder, max_redemptions,
     redemption_count, expires_at, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<LegacyToken> {
    Ok(LegacyToken {
        id: row.get(0)?,
        secret_hash: row.get(1)?,
        owner_user_id: row.get(2)?,
        vault_id: row.get(3)?,
        holder: row.get(4)?,
        max_redemptions: row.get(5)?,
        redemption_count: row.get(6)?,
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Insert a new token.
pub fn insert(conn: &Connection, token: &LegacyToken) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO legacy_tokens (id, secret_hash, owner_user_id, vault_id, holder,
             max_redemptions, redemption_count, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            token.id,
            token.secret_hash,
            token.owner_user_id,
            token.vault_id,
            token.holder,
            token.max_redemptions,
            token.redemption_count,
            token.expires_at,
            token.created_at,
        ],
    )?;
    Ok(())
}

/// Look up a token by the hash of its secret.
pub fn get_by_hash(conn: &Connection, secret_hash: &str) -> StoreResult<Option<LegacyToken>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM legacy_tokens WHERE secret_hash = ?1"
    ))?;
    Ok(stmt.query_row(params![secret_hash], from_row).optional()?)
}

/// All tokens bound to a vault, oldest first.
pub fn list_for_vault(conn: &Connection, vault_id: &str) -> StoreResult<Vec<LegacyToken>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM legacy_tokens WHERE vault_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map(params![vault_id], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Increment `redemption_count` only if it still equals `expected_count` and
/// stays within `max_redemptions`.
pub fn increment_if_count(conn: &Connection, id: &str, expected_count: u32) -> StoreResult<()> {
    let affected = conn.execute(
        "UPDATE legacy_tokens SET redemption_count = redemption_count + 1
         WHERE id = ?1 AND redemption_count = ?2
           AND (max_redemptions IS NULL OR redemption_count < max_redemptions)",
        params![id, expected_count],
    )?;
    if affected == 0 {
        return Err(StoreError::Conflict(format!("token {}", id)));
    }
    Ok(())
}
