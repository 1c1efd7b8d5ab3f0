use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::pal::Platform;

/// Fake wall clock for tests.
///
/// Clones share the same time, so a test keeps one clone and advances it while the
/// monitor context under test reads the other.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakePlatform {
    now: Arc<Mutex<Duration>>,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_now(&self, now: Duration) {
        *self
            .now
            .lock()
            .expect("FakePlatform state lock should not be poisoned") = now;
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self
            .now
            .lock()
            .expect("FakePlatform state lock should not be poisoned");
        *now = now.saturating_add(by);
    }
}

impl Platform for FakePlatform {
    fn now(&self) -> Duration {
        *self
            .now
            .lock()
            .expect("FakePlatform state lock should not be poisoned")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(FakePlatform::new().now(), Duration::ZERO);
    }

    #[test]
    fn clones_share_time() {
        let first = FakePlatform::new();
        let second = first.clone();

        first.set_now(Duration::from_secs(2));
        second.advance(Duration::from_millis(500));

        assert_eq!(first.now(), Duration::from_millis(2500));
    }
}
