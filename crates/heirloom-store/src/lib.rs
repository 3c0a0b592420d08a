//! SQLite persistence layer.
//!
//! One record set per domain entity. Every worker process (and every service
//! inside one) opens its own [`Store`] on the shared database file; SQLite in
//! WAL mode serialises writers and the `version` column turns vault updates
//! into conditional writes.
//!
//! Record helpers are free functions over `&Connection` so an engine operation
//! can combine several of them inside one [`rusqlite::Transaction`].

pub mod capsules;
pub mod checkins;
pub mod notifications;
pub mod tokens;
pub mod vaults;

use heirloom_core::ParseError;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default bound on how long any statement waits for a write lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// A conditional write lost to a concurrent writer.
    #[error("Conditional write conflict on {0}")]
    Conflict(String),

    /// The database stayed locked past the busy timeout.
    #[error("Storage timed out waiting for a lock")]
    Timeout,

    /// A row that must exist does not.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A record would violate an entity invariant.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Stored value is malformed: {0}")]
    Corrupt(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::Timeout,
            _ => StoreError::Sqlite(e),
        }
    }
}

impl From<ParseError> for StoreError {
    fn from(e: ParseError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single connection to the Heirloom database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path, busy_timeout: Duration) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, busy_timeout, true)
    }

    /// Private in-memory database; for single-connection tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, DEFAULT_BUSY_TIMEOUT, false)
    }

    fn init(conn: Connection, busy_timeout: Duration, wal: bool) -> StoreResult<Self> {
        conn.busy_timeout(busy_timeout)?;
        if wal {
            // WAL keeps readers off the writer's lock
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a transaction that takes the write lock immediately, so two
    /// read-check-write sequences on the same row can never interleave.
    pub fn immediate(&mut self) -> StoreResult<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

/// Create all tables (idempotent).
fn migrate(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS vaults (
            id                     TEXT PRIMARY KEY,
            owner_id               TEXT NOT NULL,
            state                  TEXT NOT NULL
                CHECK (state IN ('sealed', 'grace_period', 'released')),
            check_in_interval_secs INTEGER NOT NULL CHECK (check_in_interval_secs > 0),
            grace_secs             INTEGER NOT NULL CHECK (grace_secs > 0),
            last_check_in_at       INTEGER NOT NULL,
            grace_started_at       INTEGER,
            released_at            INTEGER,
            release_cause          TEXT,
            last_reminder_days     INTEGER,
            version                INTEGER NOT NULL DEFAULT 0,
            created_at             INTEGER NOT NULL,
            CHECK ((state = 'released') = (released_at IS NOT NULL)),
            CHECK ((state = 'grace_period') = (grace_started_at IS NOT NULL))
        );

        CREATE TABLE IF NOT EXISTS check_ins (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            vault_id    TEXT NOT NULL REFERENCES vaults(id),
            occurred_at INTEGER NOT NULL,
            method      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS check_ins_by_vault ON check_ins (vault_id, id);

        CREATE TABLE IF NOT EXISTS time_capsules (
            id           TEXT PRIMARY KEY,
            vault_id     TEXT NOT NULL REFERENCES vaults(id),
            release_at   INTEGER NOT NULL,
            item_scope   TEXT NOT NULL,
            triggered    INTEGER NOT NULL DEFAULT 0,
            triggered_at INTEGER,
            created_at   INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS time_capsules_pending
            ON time_capsules (triggered, release_at, id);

        CREATE TABLE IF NOT EXISTS legacy_tokens (
            id               TEXT PRIMARY KEY,
            secret_hash      TEXT NOT NULL UNIQUE,
            owner_user_id    TEXT NOT NULL,
            vault_id         TEXT NOT NULL REFERENCES vaults(id),
            holder           TEXT,
            max_redemptions  INTEGER CHECK (max_redemptions IS NULL OR max_redemptions > 0),
            redemption_count INTEGER NOT NULL DEFAULT 0,
            expires_at       INTEGER,
            created_at       INTEGER NOT NULL,
            CHECK (max_redemptions IS NULL OR redemption_count <= max_redemptions)
        );
        CREATE INDEX IF NOT EXISTS legacy_tokens_by_vault ON legacy_tokens (vault_id);

        CREATE TABLE IF NOT EXISTS notifications (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL,
            kind            TEXT NOT NULL,
            payload         TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            read            INTEGER NOT NULL DEFAULT 0,
            dedupe_key      TEXT NOT NULL UNIQUE,
            dispatched_at   INTEGER,
            attempts        INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_error      TEXT
        );
        CREATE INDEX IF NOT EXISTS notifications_outbox
            ON notifications (dispatched_at, next_attempt_at);
        ",
    )?;
    Ok(())
}
