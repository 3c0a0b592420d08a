//! Heirloom Core
//!
//! Shared types and pure release logic for Heirloom vaults.
//!
//! # Lifecycle
//!
//! ```text
//! Sealed --(interval elapsed)--> GracePeriod --(grace elapsed)--> Released
//!    ^                               |
//!    +--------(check-in)-------------+
//!
//! Sealed | GracePeriod --(time capsule due)--> Released
//! ```
//!
//! Nothing in this crate performs I/O. Time is read through [`Clock`] so
//! callers can simulate it.

pub mod clock;
pub mod machine;
pub mod model;
pub mod reminder;

pub use clock::{Clock, ManualClock, SystemClock};
pub use machine::{evaluate, next_deadline, reset_on_check_in, seconds_until_grace, Decision, Transition};
pub use model::*;

use rand::RngCore;

/// Generate a random 128-bit identifier rendered as lowercase hex.
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_shape() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
