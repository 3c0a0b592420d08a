//! Vault records and the version-gated conditional write.

use crate::{StoreError, StoreResult};
use heirloom_core::{ParseError, ReleaseCause, Timestamp, Vault};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::str::FromStr;

const COLUMNS: &str = "id, owner_id, state, check_in_interval_secs, grace_secs, last_check_in_at,
     grace_started_at, released_at, release_cause, last_reminder_days, version, created_at";

pub(crate) fn parse_col<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseError>,
{
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Vault> {
    let state: String = row.get(2)?;
    let cause: Option<String> = row.get(8)?;
    Ok(Vault {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        state: parse_col(2, &state)?,
        check_in_interval_secs: row.get(3)?,
        grace_secs: row.get(4)?,
        last_check_in_at: row.get(5)?,
        grace_started_at: row.get(6)?,
        released_at: row.get(7)?,
        release_cause: cause
            .map(|c| parse_col::<ReleaseCause>(8, &c))
            .transpose()?,
        last_reminder_days: row.get(9)?,
        version: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn check(vault: &Vault) -> StoreResult<()> {
    if vault.invariants_hold() {
        Ok(())
    } else {
        Err(StoreError::Invariant(format!(
            "vault {} in state {} has inconsistent timestamps",
            vault.id, vault.state
        )))
    }
}

/// Insert a new vault.
pub fn insert(conn: &Connection, vault: &Vault) -> StoreResult<()> {
    check(vault)?;
    conn.execute(
        "INSERT INTO vaults (id, owner_id, state, check_in_interval_secs, grace_secs,
             last_check_in_at, grace_started_at, released_at, release_cause,
             last_reminder_days, version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            vault.id,
            vault.owner_id,
            vault.state.as_str(),
            vault.check_in_interval_secs,
            vault.grace_secs,
            vault.last_check_in_at,
            vault.grace_started_at,
            vault.released_at,
            vault.release_cause.map(|c| c.as_str()),
            vault.last_reminder_days,
            vault.version,
            vault.created_at,
        ],
    )?;
    Ok(())
}

/// Get a single vault by id.
pub fn get(conn: &Connection, id: &str) -> StoreResult<Option<Vault>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {COLUMNS} FROM vaults WHERE id = ?1"))?;
    Ok(stmt.query_row(params![id], from_row).optional()?)
}

/// Write `next` only if the stored row still carries `expected_version`.
///
/// On success the row (and `next.version`) becomes `expected_version + 1`.
/// Returns [`StoreError::Conflict`] when another writer got there first, and
/// refuses to move a released vault anywhere.
pub fn update_if_version(
    conn: &Connection,
    next: &mut Vault,
    expected_version: i64,
) -> StoreResult<()> {
    check(next)?;
    let new_version = expected_version + 1;
    let affected = conn.execute(
        "UPDATE vaults SET
             state = ?3,
             last_check_in_at = ?4,
             grace_started_at = ?5,
             released_at = ?6,
             release_cause = ?7,
             last_reminder_days = ?8,
             version = ?9
         WHERE id = ?1 AND version = ?2 AND state != 'released'",
        params![
            next.id,
            expected_version,
            next.state.as_str(),
            next.last_check_in_at,
            next.grace_started_at,
            next.released_at,
            next.release_cause.map(|c| c.as_str()),
            next.last_reminder_days,
            new_version,
        ],
    )?;
    if affected == 0 {
        log::debug!("Conditional write on vault {} lost at version {}", next.id, expected_version);
        return Err(StoreError::Conflict(format!("vault {}", next.id)));
    }
    next.version = new_version;
    Ok(())
}

/// A row of a due-vault page: the id always, the vault unless the row is
/// malformed.
#[derive(Debug)]
pub struct DueVault {
    pub id: String,
    pub vault: StoreResult<Vault>,
}

/// Live vaults that may need attention at `now`, ordered by id, after `after`.
///
/// Selects sealed vaults within `reminder_window_secs` of grace entry (or past
/// it) and grace-period vaults whose grace has run out.
pub fn list_due(
    conn: &Connection,
    now: Timestamp,
    reminder_window_secs: i64,
    after: Option<&str>,
    limit: usize,
) -> StoreResult<Vec<DueVault>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM vaults
         WHERE id > ?1 AND (
             (state = 'sealed' AND last_check_in_at + check_in_interval_secs - ?3 <= ?2)
             OR (state = 'grace_period' AND grace_started_at + grace_secs <= ?2)
         )
         ORDER BY id LIMIT ?4"
    ))?;
    let rows = stmt.query_map(
        params![after.unwrap_or(""), now, reminder_window_secs, limit as i64],
        |row| {
            let id: String = row.get(0)?;
            let vault =
                from_row(row).map_err(|e| StoreError::Corrupt(format!("vault {}: {}", id, e)));
            Ok(DueVault { id, vault })
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// All vaults owned by `owner_id`.
pub fn list_for_owner(conn: &Connection, owner_id: &str) -> StoreResult<Vec<Vault>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM vaults WHERE owner_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map(params![owner_id], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
