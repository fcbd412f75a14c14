//! Exponential backoff used by every reconnect loop in the workspace.

use std::time::Duration;

/// Initial retry delay for infrastructure reconnects.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum retry delay for infrastructure reconnects.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Doubling backoff with a cap. `reset` after a healthy period.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    #[must_use]
    pub const fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
