//! Vault creation and owner-scoped reads.

use crate::{EngineError, EngineResult, SharedClock};
use heirloom_core::{new_id, Vault};
use heirloom_store::{vaults, Store};
use rusqlite::Connection;

/// Load a vault and check that `caller` owns it.
pub(crate) fn owned(conn: &Connection, vault_id: &str, caller: &str) -> EngineResult<Vault> {
    let vault = vaults::get(conn, vault_id)?
        .ok_or_else(|| EngineError::VaultNotFound(vault_id.to_string()))?;
    if vault.owner_id != caller {
        return Err(EngineError::NotOwner(vault_id.to_string()));
    }
    Ok(vault)
}

/// Creates vaults and reads them back for their owners.
pub struct VaultRegistry {
    store: Store,
    clock: SharedClock,
}

impl VaultRegistry {
    pub fn new(store: Store, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Seal a new vault; its first check-in cycle starts now.
    pub fn create(
        &mut self,
        owner_id: &str,
        check_in_interval_secs: i64,
        grace_secs: i64,
    ) -> EngineResult<Vault> {
        if owner_id.is_empty() {
            return Err(EngineError::InvalidRequest("owner id is empty".into()));
        }
        if check_in_interval_secs <= 0 || grace_secs <= 0 {
            return Err(EngineError::InvalidRequest(
                "check-in interval and grace must be positive".into(),
            ));
        }
        let vault = Vault::new(
            new_id(),
            owner_id,
            check_in_interval_secs,
            grace_secs,
            self.clock.now(),
        );
        vaults::insert(self.store.conn(), &vault)?;
        log::info!("Vault {} created for {}", vault.id, owner_id);
        Ok(vault)
    }

    pub fn get(&self, vault_id: &str, caller: &str) -> EngineResult<Vault> {
        owned(self.store.conn(), vault_id, caller)
    }

    pub fn list(&self, owner_id: &str) -> EngineResult<Vec<Vault>> {
        Ok(vaults::list_for_owner(self.store.conn(), owner_id)?)
    }
}
