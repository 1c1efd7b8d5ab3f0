use std::time::{Duration, Instant};

use crate::pal::Platform;

/// Real implementation of the platform abstraction using the monotonic system clock.
#[derive(Clone, Debug)]
pub(crate) struct RealPlatform {
    epoch: Instant,
}

impl RealPlatform {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Platform for RealPlatform {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}
