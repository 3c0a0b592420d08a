//! The release sweeper: periodic driver for time-driven transitions.
//!
//! Each pass has two phases:
//!
//! 1. **Capsules**: every untriggered capsule due now releases its vault (or
//!    is retired silently if the vault is already released).
//! 2. **Vaults**: live vaults past a deadline, or inside the reminder window,
//!    are fed to the state machine.
//!
//! Work is loaded in batches of `batch_size`. Each vault is committed in its
//! own transaction, gated on the version of the snapshot it was decided
//! from. A sweeper that loses that race to another sweeper or a check-in
//! drops its decision; the next pass re-reads.
//!
//! A vault or capsule that cannot be read or written is logged, counted in
//! [`SweepReport::failed`] and skipped, so one bad record cannot hold back
//! every other release. Only transient storage failures (a database that
//! stays locked) end the pass early with an error.

use crate::capsule::DueCapsules;
use crate::effects::{self, Applied};
use crate::{EngineConfig, EngineError, EngineResult, SharedClock};
use heirloom_core::reminder::reminder_window_secs;
use heirloom_core::{ReleaseCause, Timestamp, Transition};
use heirloom_store::{vaults, Store, StoreError};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::watch;

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub grace_entered: usize,
    pub released: usize,
    pub released_by_capsule: usize,
    pub reminders: usize,
    pub notifications: usize,
    pub capsules_marked: usize,
    /// Decisions dropped because the vault changed under us.
    pub conflicts: usize,
    /// Records skipped because they could not be read or written.
    pub failed: usize,
    /// True if the pass stopped early on a shutdown request.
    pub interrupted: bool,
}

impl SweepReport {
    pub fn changed(&self) -> bool {
        self.grace_entered + self.released + self.reminders + self.capsules_marked > 0
    }

    fn record(&mut self, applied: &Applied) {
        match applied.transition {
            Some(Transition::GraceEntered) => self.grace_entered += 1,
            Some(Transition::Released(cause)) => {
                self.released += 1;
                if cause == ReleaseCause::TimeCapsule {
                    self.released_by_capsule += 1;
                }
            }
            Some(Transition::GraceCancelled) | None => {}
        }
        if applied.reminder.is_some() {
            self.reminders += 1;
        }
        self.notifications += applied.notifications;
        self.capsules_marked += applied.capsules_marked;
    }
}

pub struct ReleaseSweeper {
    store: Store,
    clock: SharedClock,
    batch_size: usize,
    reminder_days: Vec<u32>,
}

impl ReleaseSweeper {
    pub fn new(store: Store, clock: SharedClock, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            batch_size: config.batch_size.max(1),
            reminder_days: config.reminder_days.clone(),
        }
    }

    /// Run one full pass at the current clock reading.
    pub fn run_once(&mut self) -> EngineResult<SweepReport> {
        self.sweep(|| false)
    }

    /// Run one pass, checking `cancelled` between batches.
    pub fn sweep(&mut self, cancelled: impl Fn() -> bool) -> EngineResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        // Phase 1: capsules
        let mut cursor = None;
        loop {
            if cancelled() {
                report.interrupted = true;
                return Ok(report);
            }
            let (vault_ids, next_cursor, more) = {
                let mut due = DueCapsules::new(self.store.conn(), now, self.batch_size, cursor);
                let mut ids = BTreeSet::new();
                let mut taken = 0;
                for capsule in due.by_ref().take(self.batch_size) {
                    taken += 1;
                    match capsule {
                        Ok(capsule) => {
                            ids.insert(capsule.vault_id);
                        }
                        Err(e) => skip(e, "due capsule", &mut report)?,
                    }
                }
                (ids, due.cursor(), taken == self.batch_size)
            };
            for vault_id in &vault_ids {
                self.process(vault_id, now, &mut report)?;
            }
            if !more {
                break;
            }
            cursor = next_cursor;
        }

        // Phase 2: vaults
        let window = reminder_window_secs(&self.reminder_days);
        let mut after: Option<String> = None;
        loop {
            if cancelled() {
                report.interrupted = true;
                return Ok(report);
            }
            let batch = vaults::list_due(
                self.store.conn(),
                now,
                window,
                after.as_deref(),
                self.batch_size,
            )?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id.clone());
            let full = batch.len() == self.batch_size;
            for row in batch {
                match row.vault {
                    Ok(vault) => self.apply(&vault, now, &mut report)?,
                    Err(e) => skip(e.into(), &row.id, &mut report)?,
                }
            }
            if !full {
                break;
            }
        }

        if report.changed() {
            log::info!(
                "Sweep: {} grace, {} released, {} reminders, {} capsules, {} conflicts, {} failed",
                report.grace_entered,
                report.released,
                report.reminders,
                report.capsules_marked,
                report.conflicts,
                report.failed
            );
        } else {
            log::debug!("Sweep: nothing due");
        }
        Ok(report)
    }

    fn process(&mut self, vault_id: &str, now: Timestamp, report: &mut SweepReport) -> EngineResult<()> {
        match vaults::get(self.store.conn(), vault_id) {
            Ok(Some(vault)) => self.apply(&vault, now, report),
            Ok(None) => {
                log::warn!("Capsule references missing vault {}", vault_id);
                Ok(())
            }
            Err(e) => skip(e.into(), vault_id, report),
        }
    }

    fn apply(
        &mut self,
        snapshot: &heirloom_core::Vault,
        now: Timestamp,
        report: &mut SweepReport,
    ) -> EngineResult<()> {
        let tx = self.store.immediate()?;
        match effects::advance(&tx, snapshot, &self.reminder_days, now) {
            Ok(applied) => {
                tx.commit()?;
                report.record(&applied);
                Ok(())
            }
            Err(StoreError::Conflict(on)) => {
                log::debug!("Sweep lost conditional write on {}; skipping", on);
                report.conflicts += 1;
                Ok(())
            }
            Err(e) => skip(e.into(), &snapshot.id, report),
        }
    }

    /// Sweep every `interval` until `shutdown` turns true (or its sender is
    /// dropped). A batch in flight always completes.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        let mut sweeper = self;
        loop {
            let cancel = shutdown.clone();
            let (back, result) = tokio::task::spawn_blocking(move || {
                let result = sweeper.sweep(|| *cancel.borrow());
                (sweeper, result)
            })
            .await
            .map_err(|e| EngineError::Worker(format!("sweep task: {}", e)))?;
            sweeper = back;

            if let Err(e) = result {
                log::error!("Sweep failed: {}", e);
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
        log::info!("Sweeper stopped");
        Ok(())
    }
}

/// Count and log a per-record failure, or hand back a transient one.
fn skip(e: EngineError, what: &str, report: &mut SweepReport) -> EngineResult<()> {
    if e.is_transient() {
        return Err(e);
    }
    log::error!("Sweep skipped {}: {}", what, e);
    report.failed += 1;
    Ok(())
}
