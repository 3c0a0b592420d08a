//! Liveness tracking.
//!
//! A check-in is the owner's proof of life. It refreshes the vault's
//! deadline and cancels a running grace period, but it can never undo a
//! release: time-driven transitions are evaluated first, and if the vault is
//! already due for release at the moment of the check-in, that release is
//! committed and the check-in is rejected.

use crate::effects;
use crate::error::{retry_on_conflict, Attempt};
use crate::vaults::owned;
use crate::{EngineError, EngineResult, SharedClock};
use heirloom_core::machine::{evaluate, next_deadline, reset_on_check_in, seconds_until_grace};
use heirloom_core::{CheckIn, CheckInMethod, Timestamp, Transition, VaultState};
use heirloom_store::{capsules, checkins, vaults, Store};
use serde::Serialize;

/// Current state of a vault and when it will next change on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatus {
    pub state: VaultState,
    pub next_deadline: Option<Timestamp>,
}

pub struct CheckInTracker {
    store: Store,
    clock: SharedClock,
}

impl CheckInTracker {
    pub fn new(store: Store, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Record a check-in by `caller` on `vault_id`. Returns the new check-in
    /// id.
    ///
    /// Fails with [`EngineError::VaultAlreadyReleased`] if the vault is
    /// released, including when the release became due before this call
    /// (the release is committed first).
    pub fn record_check_in(
        &mut self,
        vault_id: &str,
        caller: &str,
        method: CheckInMethod,
    ) -> EngineResult<i64> {
        let now = self.clock.now();
        let store = &mut self.store;

        retry_on_conflict("check-in", || {
            let tx = store.immediate()?;
            let vault = owned(&tx, vault_id, caller)?;
            if vault.is_released() {
                return Err(EngineError::VaultAlreadyReleased(vault_id.to_string()).into());
            }

            let due = capsules::due_for_vault(&tx, vault_id, now)?;
            let decision = evaluate(&vault, !due.is_empty(), now);
            if let Some(t @ Transition::Released(_)) = decision.transition {
                effects::persist(&tx, &vault, decision.vault, Some(t), &due, now)?;
                tx.commit()?;
                log::info!("Check-in on {} arrived after release became due", vault_id);
                return Err(Attempt::Engine(EngineError::VaultAlreadyReleased(
                    vault_id.to_string(),
                )));
            }

            let reset = reset_on_check_in(&vault, now);
            let mut next = reset.vault;
            vaults::update_if_version(&tx, &mut next, vault.version)?;
            let id = checkins::insert(&tx, vault_id, now, method)?;
            tx.commit()?;

            if reset.transition == Some(Transition::GraceCancelled) {
                log::info!("Vault {} grace period cancelled by check-in", vault_id);
            }
            Ok(id)
        })
    }

    /// Seconds until the vault enters grace (negative when overdue).
    pub fn time_until_grace(&self, vault_id: &str, caller: &str) -> EngineResult<i64> {
        let vault = owned(self.store.conn(), vault_id, caller)?;
        Ok(seconds_until_grace(&vault, self.clock.now()))
    }

    /// Most recent check-ins, newest first.
    pub fn history(&self, vault_id: &str, caller: &str, limit: usize) -> EngineResult<Vec<CheckIn>> {
        owned(self.store.conn(), vault_id, caller)?;
        Ok(checkins::list(self.store.conn(), vault_id, limit)?)
    }

    pub fn status(&self, vault_id: &str, caller: &str) -> EngineResult<VaultStatus> {
        let conn = self.store.conn();
        let vault = owned(conn, vault_id, caller)?;
        let earliest = capsules::earliest_pending(conn, vault_id)?;
        Ok(VaultStatus {
            state: vault.state,
            next_deadline: next_deadline(&vault, earliest),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{open, setup, DAY, T0};
    use crate::vaults::VaultRegistry;
    use heirloom_core::{ItemScope, ManualClock, Vault};
    use heirloom_store::notifications;
    use std::sync::Arc;

    fn fixture() -> (tempfile::NamedTempFile, ManualClock, CheckInTracker, Vault) {
        let (file, clock) = setup();
        let mut registry = VaultRegistry::new(open(&file), Arc::new(clock.clone()));
        let vault = registry.create("alice", DAY, 7 * DAY).unwrap();
        let tracker = CheckInTracker::new(open(&file), Arc::new(clock.clone()));
        (file, clock, tracker, vault)
    }

    fn force_grace(file: &tempfile::NamedTempFile, vault: &Vault, started: Timestamp) {
        let store = open(file);
        let mut next = vault.clone();
        next.state = VaultState::GracePeriod;
        next.grace_started_at = Some(started);
        vaults::update_if_version(store.conn(), &mut next, vault.version).unwrap();
    }

    #[test]
    fn test_check_in_refreshes_deadline() {
        let (_file, clock, mut tracker, vault) = fixture();
        clock.advance(3_600);
        tracker
            .record_check_in(&vault.id, "alice", CheckInMethod::App)
            .unwrap();

        assert_eq!(tracker.time_until_grace(&vault.id, "alice").unwrap(), DAY);
        let history = tracker.history(&vault.id, "alice", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].occurred_at, T0 + 3_600);
    }

    #[test]
    fn test_check_in_cancels_grace() {
        let (file, clock, mut tracker, vault) = fixture();
        force_grace(&file, &vault, T0 + DAY);
        clock.set(T0 + 3 * DAY);

        tracker
            .record_check_in(&vault.id, "alice", CheckInMethod::Manual)
            .unwrap();
        let status = tracker.status(&vault.id, "alice").unwrap();
        assert_eq!(status.state, VaultState::Sealed);
        assert_eq!(status.next_deadline, Some(T0 + 4 * DAY));
    }

    #[test]
    fn test_check_in_after_grace_expiry_releases() {
        let (file, clock, mut tracker, vault) = fixture();
        force_grace(&file, &vault, T0 + DAY);
        clock.set(T0 + 8 * DAY);

        let err = tracker
            .record_check_in(&vault.id, "alice", CheckInMethod::App)
            .unwrap_err();
        assert!(matches!(err, EngineError::VaultAlreadyReleased(_)));

        let store = open(&file);
        let stored = vaults::get(store.conn(), &vault.id).unwrap().unwrap();
        assert_eq!(stored.state, VaultState::Released);
        assert_eq!(stored.released_at, Some(T0 + 8 * DAY));
        // No check-in recorded, one release notification for the owner
        assert!(tracker.history(&vault.id, "alice", 10).unwrap().is_empty());
        assert_eq!(
            notifications::list_for_user(store.conn(), "alice").unwrap().len(),
            1
        );

        // Released stays released
        assert!(matches!(
            tracker.record_check_in(&vault.id, "alice", CheckInMethod::App),
            Err(EngineError::VaultAlreadyReleased(_))
        ));
    }

    #[test]
    fn test_due_capsule_beats_same_instant_check_in() {
        let (file, clock, mut tracker, vault) = fixture();
        let store = open(&file);
        capsules::insert(
            store.conn(),
            &heirloom_core::TimeCapsule {
                id: "c1".into(),
                vault_id: vault.id.clone(),
                release_at: T0 + 60,
                item_scope: ItemScope::All,
                triggered: false,
                triggered_at: None,
                created_at: T0,
            },
        )
        .unwrap();
        clock.set(T0 + 60);

        assert!(matches!(
            tracker.record_check_in(&vault.id, "alice", CheckInMethod::App),
            Err(EngineError::VaultAlreadyReleased(_))
        ));
        assert!(capsules::get(store.conn(), "c1").unwrap().unwrap().triggered);
    }

    #[test]
    fn test_overdue_sealed_vault_still_accepts_check_in() {
        let (_file, clock, mut tracker, vault) = fixture();
        // Past interval + grace, but no sweep has moved it into grace
        clock.set(T0 + 30 * DAY);
        tracker
            .record_check_in(&vault.id, "alice", CheckInMethod::Api)
            .unwrap();
        assert_eq!(
            tracker.status(&vault.id, "alice").unwrap().state,
            VaultState::Sealed
        );
    }

    #[test]
    fn test_check_in_requires_owner() {
        let (_file, _clock, mut tracker, vault) = fixture();
        assert!(matches!(
            tracker.record_check_in(&vault.id, "mallory", CheckInMethod::App),
            Err(EngineError::NotOwner(_))
        ));
        assert!(matches!(
            tracker.record_check_in("nope", "alice", CheckInMethod::App),
            Err(EngineError::VaultNotFound(_))
        ));
    }
}
