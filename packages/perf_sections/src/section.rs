//! A single named measurement slot and its start/stop state.

use std::fmt;
use std::time::Duration;

use crate::{CounterDeltas, CounterSnapshot, VolumeSource};

/// Stable handle of a section, valid for the lifetime of its monitor context.
///
/// Index 0 always refers to the root section that spans the whole monitored lifetime.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SectionIndex(usize);

impl SectionIndex {
    /// The root section.
    pub const ROOT: Self = Self(0);

    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The position of the section in registration order.
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SectionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What kind of work a section measures. This decides how its volume is presented.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum SectionKind {
    /// Data movement between processes; volume is in bytes.
    Communication,

    /// Arithmetic; volume is in floating point operations.
    #[default]
    Computation,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication => f.write_str("communication"),
            Self::Computation => f.write_str("computation"),
        }
    }
}

/// How a section was bound to its kind and exclusivity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Binding {
    /// Defaults applied when the label was first used without `set_properties()`.
    Implicit,

    /// Set through `set_properties()`; never changes afterwards.
    Explicit,
}

#[derive(Clone, Debug)]
pub(crate) enum SectionState {
    Idle,
    Running {
        started_at: Duration,
        // One snapshot per measured thread, empty without a counter adapter.
        snapshots: Vec<(usize, CounterSnapshot)>,
    },
}

/// The cumulative record of one section, owned by a monitor context.
#[derive(Clone, Debug)]
pub(crate) struct Section {
    pub(crate) label: String,
    pub(crate) kind: SectionKind,
    pub(crate) exclusive: bool,
    pub(crate) binding: Binding,
    pub(crate) volume_source: VolumeSource,

    pub(crate) elapsed: Duration,
    pub(crate) volume: f64,
    pub(crate) call_count: u64,
    pub(crate) counters: CounterDeltas,

    pub(crate) state: SectionState,
}

impl Section {
    pub(crate) fn new(label: String, volume_source: VolumeSource) -> Self {
        Self {
            label,
            kind: SectionKind::default(),
            exclusive: true,
            binding: Binding::Implicit,
            volume_source,
            elapsed: Duration::ZERO,
            volume: 0.0,
            call_count: 0,
            counters: CounterDeltas::default(),
            state: SectionState::Idle,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self.state, SectionState::Running { .. })
    }

    /// Zeroes all accumulated values, keeping identity and properties.
    pub(crate) fn clear(&mut self) {
        self.elapsed = Duration::ZERO;
        self.volume = 0.0;
        self.call_count = 0;
        self.counters = CounterDeltas::default();
    }

    /// Folds one finished interval into the cumulative record.
    pub(crate) fn record_interval(&mut self, elapsed: Duration, volume: f64, deltas: &CounterDeltas) {
        self.elapsed = self.elapsed.saturating_add(elapsed);
        self.volume += volume;
        self.call_count = self.call_count.checked_add(1).expect(
            "section call count overflows u64 - this indicates an unrealistic scenario",
        );
        self.counters.accumulate(deltas);
    }

    pub(crate) fn snapshot(&self, index: SectionIndex) -> SectionSnapshot {
        SectionSnapshot {
            index,
            label: self.label.clone(),
            kind: self.kind,
            exclusive: self.exclusive,
            volume_source: self.volume_source,
            elapsed: self.elapsed,
            volume: self.volume,
            call_count: self.call_count,
            counters: self.counters.0.clone(),
            running: self.is_running(),
        }
    }
}

/// A point-in-time copy of the local state of one section.
#[derive(Clone, Debug, PartialEq)]
pub struct SectionSnapshot {
    index: SectionIndex,
    label: String,
    kind: SectionKind,
    exclusive: bool,
    volume_source: VolumeSource,
    elapsed: Duration,
    volume: f64,
    call_count: u64,
    counters: Vec<u64>,
    running: bool,
}

impl SectionSnapshot {
    /// The section's handle.
    #[must_use]
    pub fn index(&self) -> SectionIndex {
        self.index
    }

    /// The section's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// What kind of work the section measures.
    #[must_use]
    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    /// Whether the section may not overlap other exclusive sections.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Where the section's volume comes from.
    #[must_use]
    pub fn volume_source(&self) -> VolumeSource {
        self.volume_source
    }

    /// Total time spent in the section over all finished intervals.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Total work done in the section over all finished intervals.
    #[must_use]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Number of finished intervals.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    /// Summed counter increments, ordered like the adapter's events. Empty without counters.
    #[must_use]
    pub fn counters(&self) -> &[u64] {
        &self.counters
    }

    /// Whether the section is between a start and a stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }
}
