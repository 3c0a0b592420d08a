//! In-memory gateway for exercising delivery and retry paths.

use crate::{NotificationGateway, NotifyError};
use heirloom_core::Notification;
use std::sync::Mutex;

/// Keeps published notifications in memory. Can be told to fail the next
/// `n` publishes to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    delivered: Vec<Notification>,
    failures_left: u32,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut state) = self.inner.lock() {
            state.failures_left = n;
        }
    }

    /// Everything delivered so far, in delivery order.
    pub fn delivered(&self) -> Vec<Notification> {
        self.inner
            .lock()
            .map(|state| state.delivered.clone())
            .unwrap_or_default()
    }
}

impl NotificationGateway for MemoryGateway {
    fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| NotifyError::Unavailable("memory gateway poisoned".into()))?;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(NotifyError::Unavailable("injected failure".into()));
        }
        state.delivered.push(notification.clone());
        Ok(())
    }
}
