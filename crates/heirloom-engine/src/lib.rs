//! Heirloom Release Engine
//!
//! Drives vaults through their lifecycle on top of [`heirloom_store`].
//!
//! # Services
//!
//! - [`VaultRegistry`]: creates vaults and reads them back
//! - [`CheckInTracker`]: records liveness pings
//! - [`TimeCapsuleIndex`]: schedules and pages time capsules
//! - [`ReleaseSweeper`]: periodic driver that applies time-driven transitions
//! - [`LegacyTokenService`]: issues and redeems beneficiary tokens
//! - [`OutboxDispatcher`]: hands recorded notifications to a gateway
//! - [`NotificationInbox`]: lets users read their notifications
//!
//! Every service owns its own [`Store`](heirloom_store::Store) connection and
//! reads time through an injected [`Clock`](heirloom_core::Clock), so any
//! number of them may run side by side, in one process or many.
//!
//! # Example
//!
//! ```ignore
//! use heirloom_engine::{EngineConfig, ReleaseSweeper};
//!
//! let store = Store::open(path, DEFAULT_BUSY_TIMEOUT)?;
//! let mut sweeper = ReleaseSweeper::new(store, Arc::new(SystemClock), &EngineConfig::default());
//! let report = sweeper.run_once()?;
//! ```

pub mod capsule;
pub mod checkin;
mod effects;
pub mod error;
pub mod inbox;
pub mod outbox;
pub mod sweeper;
pub mod token;
pub mod vaults;

pub use capsule::{DueCapsules, TimeCapsuleIndex};
pub use checkin::{CheckInTracker, VaultStatus};
pub use error::{EngineError, EngineResult};
pub use inbox::NotificationInbox;
pub use outbox::{DispatchReport, OutboxDispatcher, RetryPolicy};
pub use sweeper::{ReleaseSweeper, SweepReport};
pub use token::{IssuedToken, LegacyTokenService, TokenTerms};
pub use vaults::VaultRegistry;

use heirloom_core::reminder;
use heirloom_core::Clock;
use std::sync::Arc;

/// Bound on internal retries after a lost conditional write.
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Shared time source handed to every service.
pub type SharedClock = Arc<dyn Clock>;

/// Tunables shared by the engine services.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum vaults or capsules loaded per sweep batch.
    pub batch_size: usize,
    /// Reminder thresholds in days before grace entry.
    pub reminder_days: Vec<u32>,
    /// Lifetime of an access grant in seconds.
    pub grant_ttl_secs: i64,
    /// Deployment-wide secret mixed into every token hash.
    pub token_salt: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            reminder_days: reminder::default_thresholds(),
            grant_ttl_secs: 3600,
            token_salt: "heirloom-dev-salt".to_string(),
        }
    }
}
