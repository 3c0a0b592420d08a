//! Outbox dispatcher: delivers recorded notifications through a gateway.
//!
//! Delivery failures never touch vault state. A failed attempt is recorded
//! with a backoff delay of `base * 2^attempts`, capped at `max`; after
//! `max_attempts` the row stays undelivered and is no longer picked up.
//!
//! Several dispatchers may drain the same database. Each row is claimed with
//! a conditional write before it is published, and the claim leases the row
//! for [`CLAIM_LEASE_SECS`]: if the claiming process dies mid-delivery the
//! row becomes due again once the lease runs out.

use crate::{EngineError, EngineResult, SharedClock};
use heirloom_core::Timestamp;
use heirloom_notify::NotificationGateway;
use heirloom_store::{notifications, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long a claimed row is withheld from other dispatchers.
pub const CLAIM_LEASE_SECS: i64 = 300;

/// Retry schedule for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_secs: i64,
    pub max_secs: i64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_secs: 30,
            max_secs: 3600,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `failed_attempts` failures.
    pub fn backoff(&self, failed_attempts: u32) -> i64 {
        let factor = 1i64.checked_shl(failed_attempts.min(62)).unwrap_or(i64::MAX);
        self.base_secs.saturating_mul(factor).min(self.max_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Failures that used up the last attempt.
    pub abandoned: usize,
    /// Rows another dispatcher claimed first.
    pub skipped: usize,
}

pub struct OutboxDispatcher {
    store: Store,
    clock: SharedClock,
    gateway: Arc<dyn NotificationGateway>,
    policy: RetryPolicy,
    batch_size: usize,
}

impl OutboxDispatcher {
    pub fn new(
        store: Store,
        clock: SharedClock,
        gateway: Arc<dyn NotificationGateway>,
        policy: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            gateway,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    /// Deliver one batch of due notifications.
    pub fn dispatch_once(&mut self) -> EngineResult<DispatchReport> {
        let now = self.clock.now();
        let conn = self.store.conn();
        let mut report = DispatchReport::default();

        let due = notifications::pending(conn, now, self.policy.max_attempts, self.batch_size)?;
        for entry in due {
            let n = &entry.notification;
            let lease_until = now.saturating_add(CLAIM_LEASE_SECS);
            if !notifications::claim(conn, &n.id, entry.next_attempt_at, lease_until)? {
                report.skipped += 1;
                continue;
            }
            match self.gateway.publish(n) {
                Ok(()) => {
                    notifications::mark_dispatched(conn, &n.id, now)?;
                    report.delivered += 1;
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    let retry_at: Timestamp = now.saturating_add(self.policy.backoff(entry.attempts));
                    notifications::record_failure(conn, &n.id, &e.to_string(), retry_at)?;
                    report.failed += 1;
                    if attempts >= self.policy.max_attempts {
                        report.abandoned += 1;
                        log::error!(
                            "Giving up on notification {} for {} after {} attempts: {}",
                            n.id,
                            n.user_id,
                            attempts,
                            e
                        );
                    } else {
                        log::warn!(
                            "Notification {} delivery failed (attempt {}), retrying at {}: {}",
                            n.id,
                            attempts,
                            retry_at,
                            e
                        );
                    }
                }
            }
        }
        if report.delivered + report.failed > 0 {
            log::info!(
                "Outbox: {} delivered, {} failed",
                report.delivered,
                report.failed
            );
        }
        Ok(report)
    }

    /// Drain the outbox every `interval` until `shutdown` turns true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        let mut dispatcher = self;
        loop {
            let (back, result) = tokio::task::spawn_blocking(move || {
                let result = dispatcher.dispatch_once();
                (dispatcher, result)
            })
            .await
            .map_err(|e| EngineError::Worker(format!("dispatch task: {}", e)))?;
            dispatcher = back;

            if let Err(e) = result {
                log::error!("Outbox dispatch failed: {}", e);
            }
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Outbox dispatcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{open, setup, T0};
    use heirloom_core::{Notification, NotificationKind};
    use heirloom_notify::test_utils::MemoryGateway;

    fn seed(store: &Store, id: &str) {
        notifications::insert_once(
            store.conn(),
            &Notification {
                id: id.into(),
                user_id: "alice".into(),
                kind: NotificationKind::Warning,
                payload: serde_json::json!({ "vault_id": "v1" }),
                created_at: T0,
                read: false,
                dedupe_key: format!("v1:{}", id),
            },
        )
        .unwrap();
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_secs: 10,
            max_secs: 100,
            max_attempts: 5,
        };
        assert_eq!(policy.backoff(0), 10);
        assert_eq!(policy.backoff(1), 20);
        assert_eq!(policy.backoff(3), 80);
        assert_eq!(policy.backoff(4), 100);
        assert_eq!(policy.backoff(200), 100);
    }

    #[test]
    fn test_delivers_once() {
        let (file, clock) = setup();
        let store = open(&file);
        seed(&store, "n1");
        seed(&store, "n2");

        let gateway = Arc::new(MemoryGateway::new());
        let mut dispatcher = OutboxDispatcher::new(
            store,
            Arc::new(clock),
            gateway.clone(),
            RetryPolicy::default(),
            10,
        );
        assert_eq!(dispatcher.dispatch_once().unwrap().delivered, 2);
        assert_eq!(dispatcher.dispatch_once().unwrap().delivered, 0);
        assert_eq!(gateway.delivered().len(), 2);
    }

    #[test]
    fn test_failure_is_retried_after_backoff() {
        let (file, clock) = setup();
        let store = open(&file);
        seed(&store, "n1");

        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_next(1);
        let policy = RetryPolicy {
            base_secs: 60,
            max_secs: 600,
            max_attempts: 3,
        };
        let mut dispatcher =
            OutboxDispatcher::new(store, Arc::new(clock.clone()), gateway.clone(), policy, 10);

        let first = dispatcher.dispatch_once().unwrap();
        assert_eq!(first.failed, 1);

        clock.advance(59);
        assert_eq!(dispatcher.dispatch_once().unwrap().delivered, 0);
        clock.advance(1);
        assert_eq!(dispatcher.dispatch_once().unwrap().delivered, 1);
        assert_eq!(gateway.delivered()[0].id, "n1");
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let (file, clock) = setup();
        let store = open(&file);
        seed(&store, "n1");

        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_next(10);
        let policy = RetryPolicy {
            base_secs: 1,
            max_secs: 1,
            max_attempts: 2,
        };
        let mut dispatcher =
            OutboxDispatcher::new(store, Arc::new(clock.clone()), gateway.clone(), policy, 10);

        assert_eq!(dispatcher.dispatch_once().unwrap().abandoned, 0);
        clock.advance(1);
        assert_eq!(dispatcher.dispatch_once().unwrap().abandoned, 1);
        clock.advance(100);
        assert_eq!(dispatcher.dispatch_once().unwrap(), DispatchReport::default());
        assert!(gateway.delivered().is_empty());
    }
}
