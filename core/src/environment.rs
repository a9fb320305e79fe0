//! Injected environment dependencies.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability
///
/// Envelope `createdAt` and ledger `processed_at` come from a `Clock`, so tests
/// can pin them with a fixed clock.
///
/// # Examples
///
/// ```
/// use replay_outbox_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let before = chrono::Utc::now();
/// assert!(clock.now() >= before);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
