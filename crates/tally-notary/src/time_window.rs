//! Time-window validation against the notary clock.

use std::sync::Arc;
use tally_types::{Clock, TimeWindow, Timestamp};

/// Checks transaction time windows against a clock.
#[derive(Clone)]
pub struct TimeWindowChecker {
    clock: Arc<dyn Clock>,
}

impl TimeWindowChecker {
    /// Creates a checker reading `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Current clock reading.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Returns `Err(now)` if `window` does not contain the current instant.
    pub fn check(&self, window: Option<&TimeWindow>) -> std::result::Result<(), Timestamp> {
        let Some(window) = window else {
            return Ok(());
        };
        let now = self.clock.now();
        if window.contains(now) {
            Ok(())
        } else {
            Err(now)
        }
    }
}

impl std::fmt::Debug for TimeWindowChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeWindowChecker")
            .field("now", &self.clock.now())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tally_types::ManualClock;

    #[test]
    fn test_check_against_manual_clock() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let checker = TimeWindowChecker::new(clock.clone());
        let window = TimeWindow::between(
            Timestamp::from_millis(500),
            Timestamp::from_millis(1_500),
        )
        .unwrap();

        assert!(checker.check(Some(&window)).is_ok());
        assert!(checker.check(None).is_ok());

        clock.advance(Duration::from_millis(600));
        assert_eq!(
            checker.check(Some(&window)),
            Err(Timestamp::from_millis(1_600))
        );
    }
}
