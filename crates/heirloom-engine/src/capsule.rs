//! Scheduled releases.

use crate::vaults::owned;
use crate::{EngineError, EngineResult, SharedClock};
use heirloom_core::{new_id, ItemScope, TimeCapsule, Timestamp};
use heirloom_store::capsules::{self, DueRow};
use heirloom_store::{Store, StoreResult};
use rusqlite::Connection;
use std::collections::VecDeque;

const DEFAULT_PAGE: usize = 100;

/// Lazy iterator over untriggered capsules due at a fixed instant, paged from
/// storage in `(release_at, id)` order.
///
/// Finite: only capsules due at the instant it was created for are yielded.
/// Restartable: [`cursor`](Self::cursor) can seed a new iterator that picks
/// up where this one stopped.
///
/// A malformed capsule row is yielded as an `Err` in its place and iteration
/// continues past it. A failed page read is yielded once and ends iteration.
pub struct DueCapsules<'a> {
    conn: &'a Connection,
    now: Timestamp,
    page_size: usize,
    cursor: Option<(Timestamp, String)>,
    buffer: VecDeque<DueRow>,
    exhausted: bool,
}

impl<'a> DueCapsules<'a> {
    pub fn new(
        conn: &'a Connection,
        now: Timestamp,
        page_size: usize,
        after: Option<(Timestamp, String)>,
    ) -> Self {
        Self {
            conn,
            now,
            page_size: page_size.max(1),
            cursor: after,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Position of the last capsule yielded.
    pub fn cursor(&self) -> Option<(Timestamp, String)> {
        self.cursor.clone()
    }

    fn fill(&mut self) -> StoreResult<()> {
        let after = self.cursor.as_ref().map(|(at, id)| (*at, id.as_str()));
        let page = capsules::due_page(self.conn, self.now, after, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for DueCapsules<'_> {
    type Item = EngineResult<TimeCapsule>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e.into()));
            }
        }
        let row = self.buffer.pop_front()?;
        self.cursor = Some((row.release_at, row.id));
        Some(row.capsule.map_err(EngineError::from))
    }
}

/// Holds scheduled absolute-time release triggers.
pub struct TimeCapsuleIndex {
    store: Store,
    clock: SharedClock,
}

impl TimeCapsuleIndex {
    pub fn new(store: Store, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Schedule a capsule that releases `vault_id` at `release_at`.
    pub fn schedule(
        &mut self,
        vault_id: &str,
        owner_id: &str,
        release_at: Timestamp,
        item_scope: ItemScope,
    ) -> EngineResult<TimeCapsule> {
        let now = self.clock.now();
        let vault = owned(self.store.conn(), vault_id, owner_id)?;
        if vault.is_released() {
            return Err(EngineError::VaultAlreadyReleased(vault_id.to_string()));
        }
        if release_at <= now {
            return Err(EngineError::InvalidRequest(
                "release time must be in the future".into(),
            ));
        }
        if item_scope.is_empty() {
            return Err(EngineError::InvalidRequest("item scope is empty".into()));
        }

        let capsule = TimeCapsule {
            id: new_id(),
            vault_id: vault_id.to_string(),
            release_at,
            item_scope,
            triggered: false,
            triggered_at: None,
            created_at: now,
        };
        capsules::insert(self.store.conn(), &capsule)?;
        log::info!(
            "Time capsule {} scheduled for vault {} at {}",
            capsule.id,
            vault_id,
            release_at
        );
        Ok(capsule)
    }

    pub fn list(&self, vault_id: &str, caller: &str) -> EngineResult<Vec<TimeCapsule>> {
        owned(self.store.conn(), vault_id, caller)?;
        Ok(capsules::list_for_vault(self.store.conn(), vault_id)?)
    }

    /// Every untriggered capsule due now.
    pub fn due_capsules(&self) -> DueCapsules<'_> {
        DueCapsules::new(self.store.conn(), self.clock.now(), DEFAULT_PAGE, None)
    }

    /// Mark a capsule triggered. Idempotent; returns false if it already was.
    pub fn mark_triggered(&mut self, capsule_id: &str) -> EngineResult<bool> {
        if capsules::get(self.store.conn(), capsule_id)?.is_none() {
            return Err(EngineError::InvalidRequest(format!(
                "unknown capsule {}",
                capsule_id
            )));
        }
        Ok(capsules::mark_triggered(
            self.store.conn(),
            capsule_id,
            self.clock.now(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{open, setup, DAY, T0};
    use crate::vaults::VaultRegistry;
    use std::sync::Arc;

    fn fixture() -> (tempfile::NamedTempFile, heirloom_core::ManualClock, TimeCapsuleIndex, String) {
        let (file, clock) = setup();
        let mut registry = VaultRegistry::new(open(&file), Arc::new(clock.clone()));
        let vault = registry.create("alice", 30 * DAY, DAY).unwrap();
        let index = TimeCapsuleIndex::new(open(&file), Arc::new(clock.clone()));
        (file, clock, index, vault.id)
    }

    #[test]
    fn test_schedule_validation() {
        let (_file, _clock, mut index, vault) = fixture();
        assert!(matches!(
            index.schedule(&vault, "alice", T0, ItemScope::All),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            index.schedule(&vault, "bob", T0 + DAY, ItemScope::All),
            Err(EngineError::NotOwner(_))
        ));
        assert!(matches!(
            index.schedule("ghost", "alice", T0 + DAY, ItemScope::All),
            Err(EngineError::VaultNotFound(_))
        ));
        assert!(matches!(
            index.schedule(&vault, "alice", T0 + DAY, ItemScope::Items(vec![])),
            Err(EngineError::InvalidRequest(_))
        ));
        index.schedule(&vault, "alice", T0 + DAY, ItemScope::All).unwrap();
        assert_eq!(index.list(&vault, "alice").unwrap().len(), 1);
    }

    #[test]
    fn test_due_capsules_pages_lazily_and_skips_triggered() {
        let (_file, clock, mut index, vault) = fixture();
        for offset in 1..=5 {
            index
                .schedule(&vault, "alice", T0 + offset * 10, ItemScope::All)
                .unwrap();
        }
        index
            .schedule(&vault, "alice", T0 + DAY, ItemScope::All)
            .unwrap();
        clock.set(T0 + 50);

        let all: Vec<TimeCapsule> = DueCapsules::new(index.store.conn(), T0 + 50, 2, None)
            .collect::<EngineResult<_>>()
            .unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].release_at <= w[1].release_at));

        // Restart from a cursor
        let mut first = DueCapsules::new(index.store.conn(), T0 + 50, 2, None);
        first.next();
        first.next();
        let rest = DueCapsules::new(index.store.conn(), T0 + 50, 2, first.cursor()).count();
        assert_eq!(rest, 3);

        assert!(index.mark_triggered(&all[0].id).unwrap());
        assert!(!index.mark_triggered(&all[0].id).unwrap());
        let ids: Vec<String> = index
            .due_capsules()
            .map(|c| c.map(|c| c.id))
            .collect::<EngineResult<_>>()
            .unwrap();
        assert_eq!(ids.len(), 4);
        assert!(!ids.contains(&all[0].id));
    }

    #[test]
    fn test_schedule_on_released_vault_fails() {
        let (file, clock, mut index, vault) = fixture();
        index.schedule(&vault, "alice", T0 + 10, ItemScope::All).unwrap();
        clock.set(T0 + 10);
        let mut sweeper = crate::ReleaseSweeper::new(
            open(&file),
            Arc::new(clock.clone()),
            &crate::EngineConfig::default(),
        );
        sweeper.run_once().unwrap();

        assert!(matches!(
            index.schedule(&vault, "alice", T0 + DAY, ItemScope::All),
            Err(EngineError::VaultAlreadyReleased(_))
        ));
    }
}
