//! The hardware counter capability consumed by the section monitor.

use std::fmt::Debug;

use crate::CounterMode;

/// What a counter adapter can measure, as reported by [`CounterAdapter::initialize()`].
///
/// An adapter that reports no events is treated as absent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CounterCapabilities {
    events: Vec<String>,
}

impl CounterCapabilities {
    /// Describes an adapter measuring the given named events.
    ///
    /// All snapshots and deltas the adapter produces list values in this order.
    #[must_use]
    pub fn new(events: Vec<String>) -> Self {
        Self { events }
    }

    /// Describes an adapter that cannot measure anything on this platform.
    #[must_use]
    pub fn unsupported() -> Self {
        Self::default()
    }

    /// Names of the measured events.
    #[must_use]
    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Whether the adapter can measure anything at all.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Raw counter values read at the start of an interval, opaque to the monitor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot(pub Vec<u64>);

/// Counter increments over one interval, in the order of [`CounterCapabilities::events()`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterDeltas(pub Vec<u64>);

impl CounterDeltas {
    /// Adds another set of deltas element-wise, growing this one if the other is longer.
    pub fn accumulate(&mut self, other: &Self) {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), 0);
        }

        for (total, value) in self.0.iter_mut().zip(&other.0) {
            *total = total.saturating_add(*value);
        }
    }
}

/// Reads hardware performance counters on behalf of the section monitor.
///
/// The monitor takes a snapshot for every measured thread when a section starts and asks for
/// the deltas when it stops. Deltas of all threads are summed before being turned into a
/// volume, once per stop.
///
/// How individual counters are weighted into a volume is architecture-specific knowledge that
/// belongs to the adapter, exposed through [`derive_volume()`](Self::derive_volume).
#[cfg_attr(test, mockall::automock)]
pub trait CounterAdapter: Debug + Send + Sync {
    /// Prepares the counters and reports which events will be measured.
    fn initialize(&self) -> CounterCapabilities;

    /// Reads the current counter values of a thread.
    fn begin_interval(&self, thread_id: usize) -> CounterSnapshot;

    /// Reads the counter increments of a thread since the given snapshot was taken.
    fn end_interval(&self, thread_id: usize, snapshot: &CounterSnapshot) -> CounterDeltas;

    /// Turns summed counter increments into a volume (FLOPs, bytes or events).
    fn derive_volume(&self, mode: CounterMode, deltas: &CounterDeltas) -> f64;
}
