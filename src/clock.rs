//! Wall-clock source for credential timestamps
//!
//! Credentials carry wall-clock `iat`/`exp` claims while renewal deadlines are
//! tokio timers. [`InstantClock`] derives wall time from the tokio clock so the
//! two stay in step when time is paused in tests.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock anchored to a tokio [`Instant`]
///
/// `now()` is `anchor + (Instant::now() - created)`, so advancing tokio time
/// advances this clock by exactly the same amount.
#[derive(Debug, Clone, Copy)]
pub struct InstantClock {
    anchor: DateTime<Utc>,
    created: Instant,
}

impl InstantClock {
    pub fn new(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            created: Instant::now(),
        }
    }
}

impl Clock for InstantClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.created);
        match chrono::Duration::from_std(elapsed) {
            Ok(elapsed) => self.anchor + elapsed,
            Err(_) => self.anchor,
        }
    }
}
