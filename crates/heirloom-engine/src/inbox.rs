//! Per-user view of recorded notifications.

use crate::{EngineError, EngineResult};
use heirloom_core::Notification;
use heirloom_store::{notifications, Store};

pub struct NotificationInbox {
    store: Store,
}

impl NotificationInbox {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Everything addressed to `user_id`, newest first.
    pub fn list(&self, user_id: &str) -> EngineResult<Vec<Notification>> {
        Ok(notifications::list_for_user(self.store.conn(), user_id)?)
    }

    /// Mark one of the caller's notifications read. Notifications addressed
    /// to someone else look the same as unknown ones.
    pub fn mark_read(&mut self, user_id: &str, notification_id: &str) -> EngineResult<()> {
        if !notifications::mark_read(self.store.conn(), user_id, notification_id)? {
            return Err(EngineError::NotificationNotFound(notification_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{open, setup, DAY, T0};
    use crate::{EngineConfig, ReleaseSweeper, VaultRegistry};
    use std::sync::Arc;

    #[test]
    fn test_inbox_after_grace_entry() {
        let (file, clock) = setup();
        VaultRegistry::new(open(&file), Arc::new(clock.clone()))
            .create("alice", DAY, DAY)
            .unwrap();
        clock.set(T0 + DAY);
        ReleaseSweeper::new(open(&file), Arc::new(clock.clone()), &EngineConfig::default())
            .run_once()
            .unwrap();

        let mut inbox = NotificationInbox::new(open(&file));
        let notes = inbox.list("alice").unwrap();
        assert!(!notes.is_empty());
        assert!(notes.iter().all(|n| !n.read));
        assert!(inbox.list("bob").unwrap().is_empty());

        assert!(matches!(
            inbox.mark_read("bob", &notes[0].id),
            Err(EngineError::NotificationNotFound(_))
        ));
        inbox.mark_read("alice", &notes[0].id).unwrap();
        assert!(inbox.list("alice").unwrap()[0].read);
    }
}
