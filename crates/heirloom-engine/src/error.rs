//! Engine error taxonomy.

use heirloom_store::StoreError;
use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Vault not found: {0}")]
    VaultNotFound(String),

    #[error("Vault already released: {0}")]
    VaultAlreadyReleased(String),

    #[error("Vault not released: {0}")]
    VaultNotReleased(String),

    #[error("Legacy token not found")]
    TokenNotFound,

    #[error("Legacy token expired")]
    TokenExpired,

    #[error("Legacy token exhausted")]
    TokenExhausted,

    #[error("Notification not found: {0}")]
    NotificationNotFound(String),

    #[error("Caller does not own vault {0}")]
    NotOwner(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Transient: the database stayed busy, or writers kept conflicting.
    #[error("Storage timed out")]
    StorageTimeout,

    #[error("Storage error: {0}")]
    Storage(StoreError),

    #[error("Background task failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::StorageTimeout)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout | StoreError::Conflict(_) => EngineError::StorageTimeout,
            other => EngineError::Storage(other),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::from(e).into()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure of one attempt inside a conflict-retry loop.
///
/// Keeps store conflicts distinguishable from final engine errors so the
/// loop knows which ones to retry.
#[derive(Debug)]
pub(crate) enum Attempt {
    Store(StoreError),
    Engine(EngineError),
}

impl From<StoreError> for Attempt {
    fn from(e: StoreError) -> Self {
        Attempt::Store(e)
    }
}

impl From<rusqlite::Error> for Attempt {
    fn from(e: rusqlite::Error) -> Self {
        Attempt::Store(e.into())
    }
}

impl From<EngineError> for Attempt {
    fn from(e: EngineError) -> Self {
        Attempt::Engine(e)
    }
}

/// Run `op` until it stops losing conditional writes, at most
/// [`MAX_CONFLICT_RETRIES`](crate::MAX_CONFLICT_RETRIES) times.
pub(crate) fn retry_on_conflict<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, Attempt>,
) -> EngineResult<T> {
    for attempt in 1..=crate::MAX_CONFLICT_RETRIES {
        match op() {
            Ok(value) => return Ok(value),
            Err(Attempt::Store(StoreError::Conflict(on))) => {
                log::debug!(
                    "{}: lost conditional write on {} (attempt {}/{})",
                    what,
                    on,
                    attempt,
                    crate::MAX_CONFLICT_RETRIES
                );
            }
            Err(Attempt::Store(e)) => return Err(e.into()),
            Err(Attempt::Engine(e)) => return Err(e),
        }
    }
    log::warn!("{}: still conflicting after retries, giving up", what);
    Err(EngineError::StorageTimeout)
}
