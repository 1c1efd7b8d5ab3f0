//! The section monitor: registration, start/stop and volume attribution.

use std::mem;
use std::ops::Range;
use std::panic;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use foldhash::{HashMap, HashMapExt};
use tracing::{debug, trace};

use crate::pal::{Platform, PlatformFacade};
use crate::registry::{LabelRegistry, ROOT_LABEL};
use crate::section::{Binding, Section, SectionState};
use crate::{
    CounterAdapter, CounterDeltas, CounterSnapshot, MonitorConfig, MonitorError, Result,
    SectionIndex, SectionKind, SectionSnapshot, SerialRuntime, ThreadRuntime, TraceSink,
    VolumeSource,
};

/// A counter adapter that reported at least one measurable event.
#[derive(Clone, Debug)]
pub(crate) struct ActiveCounters {
    pub(crate) adapter: Arc<dyn CounterAdapter>,
    pub(crate) events: Vec<String>,
}

/// Which threads' counters a context reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ThreadScope {
    /// The process-level context, measuring the whole thread team.
    Process,

    /// A thread-private replica, measuring only its own thread.
    Thread(usize),
}

/// Owns all sections of one process (or one thread, for replicas) and their timing state.
///
/// Sections are addressed by label. The first use of a label registers a new section with
/// default properties (computation, exclusive); [`set_properties()`](Self::set_properties)
/// binds other properties. Each section alternates between idle and running through
/// [`start()`](Self::start) and [`stop()`](Self::stop).
///
/// At most one exclusive section may be running at any time. Non-exclusive sections may
/// overlap anything.
///
/// All protocol violations are reported as [`MonitorError`]. Continuing to measure after one
/// produces meaningless statistics, see [`OrTerminate`][crate::OrTerminate].
///
/// # Examples
///
/// ```
/// use perf_sections::{MonitorContext, SectionKind, SingleProcess};
///
/// let mut monitor = MonitorContext::builder().build();
///
/// monitor
///     .set_properties("exchange", SectionKind::Communication, true)
///     .unwrap();
///
/// for _ in 0..3 {
///     monitor.start("solve").unwrap();
///     // Do 2 GFLOP of work.
///     monitor.stop_with_volume("solve", 1e9, 2).unwrap();
///
///     monitor.start("exchange").unwrap();
///     // Send 64 MB.
///     monitor.stop_with_volume("exchange", 64e6, 1).unwrap();
/// }
///
/// assert_eq!(monitor.section("solve").unwrap().call_count(), 3);
///
/// let summary = monitor.gather(&SingleProcess).unwrap().unwrap();
/// println!("{}", summary.reporter());
/// ```
#[derive(Debug)]
pub struct MonitorContext {
    pub(crate) config: MonitorConfig,
    pub(crate) registry: LabelRegistry,

    // Position matches the registry index; position 0 is the root.
    pub(crate) sections: Vec<Section>,

    // The exclusive section currently running, if any.
    pub(crate) exclusive_active: Option<SectionIndex>,

    pub(crate) counters: Option<ActiveCounters>,
    pub(crate) runtime: Arc<dyn ThreadRuntime>,
    pub(crate) trace_sink: Option<Arc<dyn TraceSink>>,
    pub(crate) scope: ThreadScope,
    pub(crate) platform: PlatformFacade,
    pub(crate) gathered: bool,
}

impl MonitorContext {
    /// Starts building a monitor context.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::num::NonZero;
    /// use std::sync::Arc;
    ///
    /// use perf_sections::{FixedTeam, MonitorConfig, MonitorContext};
    ///
    /// let monitor = MonitorContext::builder()
    ///     .config(MonitorConfig::from_env())
    ///     .runtime(Arc::new(FixedTeam::new(NonZero::new(4).unwrap())))
    ///     .build();
    ///
    /// assert!(monitor.root().is_running());
    /// ```
    #[must_use]
    pub fn builder() -> MonitorContextBuilder {
        MonitorContextBuilder::new()
    }

    fn with_parts(
        config: MonitorConfig,
        counters: Option<ActiveCounters>,
        runtime: Arc<dyn ThreadRuntime>,
        trace_sink: Option<Arc<dyn TraceSink>>,
        scope: ThreadScope,
        platform: PlatformFacade,
    ) -> Self {
        let mut root = Section::new(ROOT_LABEL.to_string(), VolumeSource::TimeOnly);
        root.exclusive = false;
        root.binding = Binding::Explicit;

        Self {
            config,
            registry: LabelRegistry::new(),
            sections: vec![root],
            exclusive_active: None,
            counters,
            runtime,
            trace_sink,
            scope,
            platform,
            gathered: false,
        }
    }

    /// Returns the index of the section with the given label, registering it if unseen.
    ///
    /// Calling this again with the same label returns the same index. The root section's
    /// index is never returned.
    pub fn resolve(&mut self, label: &str) -> SectionIndex {
        let (index, created) = self.registry.resolve(label);

        if created {
            let volume_source =
                VolumeSource::resolve(self.config.volume_mode(), self.counters.is_some());
            self.sections.push(Section::new(label.to_string(), volume_source));

            debug!(label, index = index.get(), ?volume_source, "section registered");

            if let Some(sink) = &self.trace_sink {
                sink.define_label(index, label);
            }
        }

        index
    }

    /// Returns the index of the section with the given label, if it is registered.
    #[must_use]
    pub fn lookup(&self, label: &str) -> Option<SectionIndex> {
        self.registry.lookup(label)
    }

    /// Returns the label of the section with the given index.
    #[must_use]
    pub fn label(&self, index: SectionIndex) -> Option<&str> {
        self.registry.reverse_lookup(index)
    }

    /// Binds the kind and exclusivity of a section, registering it if unseen.
    ///
    /// Repeating the same binding is a no-op. A section used before being bound carries the
    /// defaults (computation, exclusive); those may still be changed as long as the section
    /// has never been started.
    ///
    /// # Errors
    ///
    /// [`MonitorError::ConflictingProperties`] if the section is already bound differently.
    pub fn set_properties(
        &mut self,
        label: &str,
        kind: SectionKind,
        exclusive: bool,
    ) -> Result<SectionIndex> {
        let index = self.resolve(label);
        self.bind(index, kind, exclusive)?;

        debug!(label, %kind, exclusive, "section properties bound");

        Ok(index)
    }

    fn bind(&mut self, index: SectionIndex, kind: SectionKind, exclusive: bool) -> Result<()> {
        let section = self.slot_mut(index);

        let unchanged = section.kind == kind && section.exclusive == exclusive;
        let never_used = section.binding == Binding::Implicit
            && section.call_count == 0
            && !section.is_running();

        if !unchanged && !never_used {
            return Err(MonitorError::ConflictingProperties {
                label: section.label.clone(),
                existing_kind: section.kind,
                existing_exclusive: section.exclusive,
                requested_kind: kind,
                requested_exclusive: exclusive,
            });
        }

        section.kind = kind;
        section.exclusive = exclusive;
        section.binding = Binding::Explicit;

        Ok(())
    }

    /// Starts timing a section, registering it if unseen.
    ///
    /// # Errors
    ///
    /// [`MonitorError::AlreadyRunning`] if the section is running.
    ///
    /// [`MonitorError::ExclusiveOverlap`] if the section is exclusive and another exclusive
    /// section is running.
    pub fn start(&mut self, label: &str) -> Result<SectionIndex> {
        let index = self.resolve(label);
        let section = self.slot(index);
        let exclusive = section.exclusive;

        if section.is_running() {
            return Err(MonitorError::AlreadyRunning {
                label: label.to_string(),
            });
        }

        if exclusive {
            if let Some(active) = self.exclusive_active {
                return Err(MonitorError::ExclusiveOverlap {
                    label: label.to_string(),
                    active: self.label(active).unwrap_or_default().to_string(),
                });
            }
        }

        let started_at = self.platform.now();
        let snapshots = self.begin_counters();

        self.slot_mut(index).state = SectionState::Running {
            started_at,
            snapshots,
        };

        if exclusive {
            self.exclusive_active = Some(index);
        }

        if let Some(sink) = &self.trace_sink {
            sink.record_interval_start(index, started_at.as_secs_f64());
        }

        trace!(label, "section started");

        Ok(index)
    }

    /// Stops timing a section without attributing any caller-supplied volume.
    ///
    /// Sections whose volume is derived from hardware counters still accumulate it.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NotRunning`] if the section is not running.
    pub fn stop(&mut self, label: &str) -> Result<()> {
        self.stop_with_volume(label, 0.0, 1)
    }

    /// Stops timing a section and attributes the work done during the interval.
    ///
    /// The volume of a section comes from exactly one source, fixed when it was registered:
    ///
    /// * Counter-derived: the adapter's derivation over the counter deltas of all measured
    ///   threads. The caller-supplied values are ignored.
    /// * Caller-supplied: `volume_per_unit * unit_multiplier` if `volume_per_unit` is positive,
    ///   otherwise nothing.
    /// * Time only: nothing.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NotRunning`] if the section is not running.
    pub fn stop_with_volume(
        &mut self,
        label: &str,
        volume_per_unit: f64,
        unit_multiplier: u64,
    ) -> Result<()> {
        let Some(index) = self.lookup(label) else {
            return Err(MonitorError::NotRunning {
                label: label.to_string(),
            });
        };

        let stopped_at = self.platform.now();

        let state = mem::replace(&mut self.slot_mut(index).state, SectionState::Idle);
        let SectionState::Running {
            started_at,
            snapshots,
        } = state
        else {
            return Err(MonitorError::NotRunning {
                label: label.to_string(),
            });
        };

        let elapsed = stopped_at.saturating_sub(started_at);
        let deltas = self.end_counters(&snapshots);
        let volume = self.interval_volume(index, &deltas, volume_per_unit, unit_multiplier);

        self.slot_mut(index)
            .record_interval(elapsed, volume, &deltas);

        if self.exclusive_active == Some(index) {
            self.exclusive_active = None;
        }

        if let Some(sink) = &self.trace_sink {
            sink.record_interval_end(index, stopped_at.as_secs_f64(), volume);
        }

        trace!(
            label,
            elapsed_secs = elapsed.as_secs_f64(),
            volume,
            "section stopped"
        );

        Ok(())
    }

    fn measured_threads(&self) -> Range<usize> {
        match self.scope {
            ThreadScope::Thread(thread_id) => thread_id..thread_id.saturating_add(1),
            ThreadScope::Process if self.runtime.in_parallel_region() => {
                let thread_id = self.runtime.current_thread_id();
                thread_id..thread_id.saturating_add(1)
            }
            ThreadScope::Process => 0..self.runtime.max_threads().max(1),
        }
    }

    fn begin_counters(&self) -> Vec<(usize, CounterSnapshot)> {
        let Some(counters) = &self.counters else {
            return Vec::new();
        };

        self.measured_threads()
            .map(|thread_id| (thread_id, counters.adapter.begin_interval(thread_id)))
            .collect()
    }

    // Deltas of all measured threads are reduced here, once per stop.
    fn end_counters(&self, snapshots: &[(usize, CounterSnapshot)]) -> CounterDeltas {
        let mut total = CounterDeltas::default();

        if let Some(counters) = &self.counters {
            for (thread_id, snapshot) in snapshots {
                total.accumulate(&counters.adapter.end_interval(*thread_id, snapshot));
            }
        }

        total
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "unit multipliers are far below the 2^52 limit of exact conversion"
    )]
    fn interval_volume(
        &self,
        index: SectionIndex,
        deltas: &CounterDeltas,
        volume_per_unit: f64,
        unit_multiplier: u64,
    ) -> f64 {
        match self.slot(index).volume_source {
            VolumeSource::AdapterDerived(mode) => self
                .counters
                .as_ref()
                .map_or(0.0, |counters| counters.adapter.derive_volume(mode, deltas)),
            VolumeSource::UserSupplied if volume_per_unit > 0.0 => {
                volume_per_unit * unit_multiplier as f64
            }
            VolumeSource::UserSupplied | VolumeSource::TimeOnly => 0.0,
        }
    }

    /// Zeroes the accumulated time, volume, call count and counters of one section.
    ///
    /// Resetting an unknown label does nothing.
    ///
    /// # Errors
    ///
    /// [`MonitorError::RunningDuringReset`] if the section is running.
    pub fn reset(&mut self, label: &str) -> Result<()> {
        let Some(index) = self.lookup(label) else {
            return Ok(());
        };

        let section = self.slot_mut(index);

        if section.is_running() {
            return Err(MonitorError::RunningDuringReset {
                label: label.to_string(),
            });
        }

        section.clear();
        debug!(label, "section reset");

        Ok(())
    }

    /// Forgets all sections and labels and restarts the root section from zero.
    ///
    /// # Errors
    ///
    /// [`MonitorError::RunningDuringReset`] if any section is running.
    pub fn reset_all(&mut self) -> Result<()> {
        if let Some(running) = self.user_slots().find(|section| section.is_running()) {
            return Err(MonitorError::RunningDuringReset {
                label: running.label.clone(),
            });
        }

        self.registry.clear();
        self.sections.truncate(1);
        self.exclusive_active = None;

        let now = self.platform.now();
        let root = self.slot_mut(SectionIndex::ROOT);
        root.clear();

        if root.is_running() {
            root.state = SectionState::Running {
                started_at: now,
                snapshots: Vec::new(),
            };
        }

        debug!("all sections reset");

        Ok(())
    }

    /// Creates a thread-private replica of this context for the given thread.
    ///
    /// The replica shares configuration and counter adapter, knows every label registered
    /// here with the same properties, and has its own sections and exclusivity state. It reads
    /// the counters of its own thread only. Its intervals are not sent to the trace sink.
    ///
    /// An exclusive section running here stays active in the replica, so the replica cannot
    /// start another exclusive section until the region ends.
    ///
    /// Fold replicas back with [`merge_replicas()`](Self::merge_replicas), or let
    /// [`parallel()`](Self::parallel) manage them.
    #[must_use]
    pub fn replica(&self, thread_id: usize) -> Self {
        let mut replica = Self::with_parts(
            self.config,
            self.counters.clone(),
            Arc::clone(&self.runtime),
            None,
            ThreadScope::Thread(thread_id),
            self.platform.clone(),
        );

        for source in self.user_slots() {
            let index = replica.resolve(&source.label);
            let section = replica.slot_mut(index);
            section.kind = source.kind;
            section.exclusive = source.exclusive;
            section.binding = source.binding;
            section.volume_source = source.volume_source;
        }

        // Labels were registered in the same order, so the index is valid in the replica.
        replica.exclusive_active = self.exclusive_active;

        replica
    }

    /// Folds thread-private replicas into this context, matching sections by label.
    ///
    /// For each section, the longest replica time is added (the wall time of the parallel
    /// region), volumes and counters of all replicas are summed, and the largest replica call
    /// count is added (one logical call per region).
    ///
    /// # Errors
    ///
    /// [`MonitorError::RunningDuringMerge`] if a replica section is still running.
    ///
    /// [`MonitorError::ConflictingProperties`] if a replica bound a section differently.
    pub fn merge_replicas(&mut self, replicas: impl IntoIterator<Item = Self>) -> Result<()> {
        let replicas: Vec<Self> = replicas.into_iter().collect();

        for replica in &replicas {
            if let Some(running) = replica.user_slots().find(|section| section.is_running()) {
                return Err(MonitorError::RunningDuringMerge {
                    label: running.label.clone(),
                });
            }
        }

        let mut merged: HashMap<SectionIndex, MergedIntervals> = HashMap::new();

        for replica in &replicas {
            for section in replica.user_slots() {
                let index = self.resolve(&section.label);

                if section.binding == Binding::Explicit {
                    self.bind(index, section.kind, section.exclusive)?;
                }

                merged.entry(index).or_default().include(section);
            }
        }

        for (index, intervals) in merged {
            let section = self.slot_mut(index);
            section.elapsed = section.elapsed.saturating_add(intervals.elapsed);
            section.volume += intervals.volume;
            section.call_count = section.call_count.saturating_add(intervals.call_count);
            section.counters.accumulate(&intervals.counters);
        }

        debug!(replicas = replicas.len(), "thread-private sections merged");

        Ok(())
    }

    /// Runs `body` on every thread of the runtime's team, each with its own replica, and
    /// merges the replicas into this context before returning.
    ///
    /// `body` receives the thread id and the thread's replica.
    ///
    /// # Errors
    ///
    /// The first error returned by `body`, in thread id order, in which case nothing is
    /// merged. Otherwise any error of [`merge_replicas()`](Self::merge_replicas).
    ///
    /// # Panics
    ///
    /// Re-raises a panic of `body` on the calling thread.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::num::NonZero;
    /// use std::sync::Arc;
    ///
    /// use perf_sections::{FixedTeam, MonitorContext};
    ///
    /// let mut monitor = MonitorContext::builder()
    ///     .runtime(Arc::new(FixedTeam::new(NonZero::new(4).unwrap())))
    ///     .build();
    ///
    /// monitor
    ///     .parallel(|_thread_id, replica| {
    ///         replica.start("kernel")?;
    ///         replica.stop_with_volume("kernel", 1e6, 1)
    ///     })
    ///     .unwrap();
    ///
    /// let kernel = monitor.section("kernel").unwrap();
    /// assert_eq!(kernel.call_count(), 1);
    /// assert_eq!(kernel.volume(), 4e6);
    /// ```
    pub fn parallel<F>(&mut self, body: F) -> Result<()>
    where
        F: Fn(usize, &mut Self) -> Result<()> + Sync,
    {
        let threads = self.runtime.max_threads().max(1);
        let replicas: Vec<Self> = (0..threads)
            .map(|thread_id| self.replica(thread_id))
            .collect();

        let body = &body;

        let outcomes: Vec<(Self, Result<()>)> = thread::scope(|s| {
            let handles: Vec<_> = replicas
                .into_iter()
                .enumerate()
                .map(|(thread_id, mut replica)| {
                    s.spawn(move || {
                        let outcome = body(thread_id, &mut replica);
                        (replica, outcome)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| panic::resume_unwind(payload))
                })
                .collect()
        });

        let mut finished = Vec::with_capacity(outcomes.len());
        for (replica, outcome) in outcomes {
            outcome?;
            finished.push(replica);
        }

        self.merge_replicas(finished)
    }

    /// A copy of the local state of the section with the given label.
    #[must_use]
    pub fn section(&self, label: &str) -> Option<SectionSnapshot> {
        self.lookup(label)
            .map(|index| self.slot(index).snapshot(index))
    }

    /// Copies of the local state of all user sections, in registration order.
    pub fn sections(&self) -> impl Iterator<Item = SectionSnapshot> + '_ {
        self.sections
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, section)| section.snapshot(SectionIndex::new(index)))
    }

    /// A copy of the local state of the root section.
    #[must_use]
    pub fn root(&self) -> SectionSnapshot {
        self.slot(SectionIndex::ROOT).snapshot(SectionIndex::ROOT)
    }

    /// The exclusive section that is currently running, if any.
    #[must_use]
    pub fn active_exclusive(&self) -> Option<SectionIndex> {
        self.exclusive_active
    }

    /// Whether statistics have been gathered from this context.
    #[must_use]
    pub fn is_gathered(&self) -> bool {
        self.gathered
    }

    /// Names of the hardware counter events being measured. Empty without counters.
    #[must_use]
    pub fn counter_events(&self) -> &[String] {
        match &self.counters {
            Some(counters) => &counters.events,
            None => &[],
        }
    }

    /// The configuration this context was built with.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub(crate) fn slot(&self, index: SectionIndex) -> &Section {
        self.sections
            .get(index.get())
            .expect("registry and section arena are kept in sync")
    }

    pub(crate) fn slot_mut(&mut self, index: SectionIndex) -> &mut Section {
        self.sections
            .get_mut(index.get())
            .expect("registry and section arena are kept in sync")
    }

    pub(crate) fn user_slots(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().skip(1)
    }
}

#[derive(Debug, Default)]
struct MergedIntervals {
    elapsed: Duration,
    volume: f64,
    call_count: u64,
    counters: CounterDeltas,
}

impl MergedIntervals {
    fn include(&mut self, section: &Section) {
        self.elapsed = self.elapsed.max(section.elapsed);
        self.volume += section.volume;
        self.call_count = self.call_count.max(section.call_count);
        self.counters.accumulate(&section.counters);
    }
}

/// Creates instances of [`MonitorContext`].
///
/// Everything is optional. Without a counter adapter only time and caller-supplied volumes
/// are measured; without a runtime the application is assumed to be serial; without a trace
/// sink nothing is exported.
///
/// Use `MonitorContext::builder()` to create a new instance of this builder.
#[derive(Debug)]
pub struct MonitorContextBuilder {
    config: MonitorConfig,
    counters: Option<Arc<dyn CounterAdapter>>,
    runtime: Arc<dyn ThreadRuntime>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    platform: PlatformFacade,
}

impl MonitorContextBuilder {
    fn new() -> Self {
        Self {
            config: MonitorConfig::default(),
            counters: None,
            runtime: Arc::new(SerialRuntime),
            trace_sink: None,
            platform: PlatformFacade::real(),
        }
    }

    /// Sets the configuration. Defaults to [`MonitorConfig::default()`].
    #[must_use]
    pub fn config(self, config: MonitorConfig) -> Self {
        Self { config, ..self }
    }

    /// Sets the hardware counter adapter.
    #[must_use]
    pub fn counters(self, adapter: Arc<dyn CounterAdapter>) -> Self {
        Self {
            counters: Some(adapter),
            ..self
        }
    }

    /// Sets the thread runtime. Defaults to [`SerialRuntime`].
    #[must_use]
    pub fn runtime(self, runtime: Arc<dyn ThreadRuntime>) -> Self {
        Self { runtime, ..self }
    }

    /// Sets the trace sink.
    #[must_use]
    pub fn trace_sink(self, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            trace_sink: Some(sink),
            ..self
        }
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn platform(self, platform: PlatformFacade) -> Self {
        Self { platform, ..self }
    }

    /// Initializes the counter adapter and starts the root section.
    #[must_use]
    pub fn build(self) -> MonitorContext {
        let counters = self.counters.and_then(|adapter| {
            let capabilities = adapter.initialize();

            if capabilities.is_supported() {
                debug!(events = ?capabilities.events(), "hardware counters active");

                Some(ActiveCounters {
                    events: capabilities.events().to_vec(),
                    adapter,
                })
            } else {
                debug!("counter adapter has no measurable events, counters disabled");
                None
            }
        });

        let mut context = MonitorContext::with_parts(
            self.config,
            counters,
            self.runtime,
            self.trace_sink,
            ThreadScope::Process,
            self.platform,
        );

        let started_at = context.platform.now();
        context.slot_mut(SectionIndex::ROOT).state = SectionState::Running {
            started_at,
            snapshots: Vec::new(),
        };

        if let Some(sink) = &context.trace_sink {
            sink.define_label(SectionIndex::ROOT, ROOT_LABEL);
        }

        debug!(config = ?context.config, "monitor context created");

        context
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::num::NonZero;

    use super::*;
    use crate::pal::FakePlatform;
    use crate::{
        CounterCapabilities, CounterMode, FixedTeam, MockCounterAdapter, MockThreadRuntime,
        TraceEvent, TraceRecorder, VolumeMode,
    };

    fn create_test_monitor() -> (MonitorContext, FakePlatform) {
        let clock = FakePlatform::new();
        let monitor = MonitorContext::builder()
            .platform(PlatformFacade::fake(clock.clone()))
            .build();
        (monitor, clock)
    }

    fn counting_adapter(derived_volume: f64) -> MockCounterAdapter {
        let mut adapter = MockCounterAdapter::new();
        adapter
            .expect_initialize()
            .return_const(CounterCapabilities::new(vec!["FP_OPS".to_string()]));
        adapter
            .expect_begin_interval()
            .returning(|_| CounterSnapshot(vec![0]));
        adapter
            .expect_end_interval()
            .returning(|thread_id, _| CounterDeltas(vec![thread_id as u64 + 1]));
        adapter
            .expect_derive_volume()
            .returning(move |_, _| derived_volume);
        adapter
    }

    #[test]
    fn call_count_matches_start_stop_pairs() {
        for pairs in [0_u64, 1, 1000] {
            let (mut monitor, clock) = create_test_monitor();
            monitor.resolve("loop");

            for _ in 0..pairs {
                monitor.start("loop").unwrap();
                clock.advance(Duration::from_micros(1));
                monitor.stop("loop").unwrap();
            }

            let section = monitor.section("loop").unwrap();
            assert_eq!(section.call_count(), pairs);
            assert_eq!(
                section.elapsed(),
                Duration::from_micros(1) * u32::try_from(pairs).unwrap()
            );
        }
    }

    #[test]
    fn double_start_fails_without_touching_elapsed() {
        let (mut monitor, clock) = create_test_monitor();

        monitor.start("a").unwrap();
        clock.advance(Duration::from_secs(1));

        let error = monitor.start("a").unwrap_err();
        assert!(matches!(error, MonitorError::AlreadyRunning { ref label } if label == "a"));

        clock.advance(Duration::from_secs(1));
        monitor.stop("a").unwrap();

        let section = monitor.section("a").unwrap();
        assert_eq!(section.elapsed(), Duration::from_secs(2));
        assert_eq!(section.call_count(), 1);
    }

    #[test]
    fn stop_without_start_fails() {
        let (mut monitor, _clock) = create_test_monitor();

        assert!(matches!(
            monitor.stop("never_seen"),
            Err(MonitorError::NotRunning { .. })
        ));
        assert!(monitor.lookup("never_seen").is_none());

        monitor.resolve("idle");
        assert!(matches!(
            monitor.stop("idle"),
            Err(MonitorError::NotRunning { .. })
        ));
    }

    #[test]
    fn overlapping_exclusive_sections_are_rejected() {
        let (mut monitor, _clock) = create_test_monitor();

        monitor.start("outer").unwrap();
        let error = monitor.start("inner").unwrap_err();

        match error {
            MonitorError::ExclusiveOverlap { label, active } => {
                assert_eq!(label, "inner");
                assert_eq!(active, "outer");
            }
            other => panic!("unexpected error {other:?}"),
        }

        // The rejected start left no trace.
        assert!(!monitor.section("inner").unwrap().is_running());
        monitor.stop("outer").unwrap();
        monitor.start("inner").unwrap();
        monitor.stop("inner").unwrap();
    }

    #[test]
    fn non_exclusive_sections_may_overlap_anything() {
        let (mut monitor, _clock) = create_test_monitor();
        monitor
            .set_properties("total_step", SectionKind::Computation, false)
            .unwrap();
        monitor
            .set_properties("io", SectionKind::Communication, false)
            .unwrap();

        monitor.start("total_step").unwrap();
        monitor.start("io").unwrap();
        monitor.start("solve").unwrap();
        assert_eq!(monitor.active_exclusive(), monitor.lookup("solve"));
        monitor.stop("solve").unwrap();
        monitor.stop("io").unwrap();
        monitor.stop("total_step").unwrap();

        assert_eq!(monitor.active_exclusive(), None);
    }

    #[test]
    fn exclusive_intervals_never_overlap() {
        let recorder = Arc::new(TraceRecorder::new());
        let clock = FakePlatform::new();
        let mut monitor = MonitorContext::builder()
            .platform(PlatformFacade::fake(clock.clone()))
            .trace_sink(Arc::clone(&recorder) as _)
            .build();

        let script = ["a", "b", "a", "c", "b", "c", "a"];
        for (step, label) in script.iter().enumerate() {
            monitor.start(label).unwrap();
            clock.advance(Duration::from_millis(10));

            // Attempting to start another exclusive section mid-interval must not succeed.
            let other = script[(step + 1) % script.len()];
            if other != *label {
                monitor.start(other).unwrap_err();
            }

            monitor.stop(label).unwrap();
            clock.advance(Duration::from_millis(1));
        }

        let mut intervals = Vec::new();
        let mut open = HashMap::new();
        for event in recorder.events() {
            match event {
                TraceEvent::Start { section, timestamp } => {
                    open.insert(section, timestamp);
                }
                TraceEvent::End {
                    section, timestamp, ..
                } => {
                    intervals.push((open.remove(&section).unwrap(), timestamp));
                }
                _ => {}
            }
        }

        assert_eq!(intervals.len(), script.len());
        for (i, first) in intervals.iter().enumerate() {
            for second in intervals.iter().skip(i + 1) {
                let disjoint = first.1 <= second.0 || second.1 <= first.0;
                assert!(disjoint, "{first:?} overlaps {second:?}");
            }
        }
    }

    #[test]
    fn user_volume_is_per_unit_times_multiplier() {
        let (mut monitor, _clock) = create_test_monitor();

        monitor.start("kernel").unwrap();
        monitor.stop_with_volume("kernel", 500.0, 2).unwrap();

        let section = monitor.section("kernel").unwrap();
        assert_eq!(section.volume_source(), VolumeSource::UserSupplied);
        assert!((section.volume() - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn non_positive_user_volume_is_not_accumulated() {
        let (mut monitor, _clock) = create_test_monitor();

        monitor.start("kernel").unwrap();
        monitor.stop_with_volume("kernel", -5.0, 10).unwrap();
        monitor.start("kernel").unwrap();
        monitor.stop("kernel").unwrap();

        assert_eq!(monitor.section("kernel").unwrap().volume(), 0.0);
    }

    #[test]
    fn time_only_mode_ignores_user_volume() {
        let mut monitor = MonitorContext::builder()
            .config(MonitorConfig::default().with_volume_mode(VolumeMode::TimeOnly))
            .platform(PlatformFacade::fake(FakePlatform::new()))
            .build();

        monitor.start("kernel").unwrap();
        monitor.stop_with_volume("kernel", 500.0, 2).unwrap();

        assert_eq!(monitor.section("kernel").unwrap().volume(), 0.0);
    }

    #[test]
    fn adapter_mode_ignores_user_volume() {
        let mut monitor = MonitorContext::builder()
            .config(
                MonitorConfig::default().with_volume_mode(VolumeMode::Counters(CounterMode::Flops)),
            )
            .counters(Arc::new(counting_adapter(42.0)))
            .platform(PlatformFacade::fake(FakePlatform::new()))
            .build();

        monitor.start("kernel").unwrap();
        monitor.stop_with_volume("kernel", 500.0, 2).unwrap();

        let section = monitor.section("kernel").unwrap();
        assert_eq!(
            section.volume_source(),
            VolumeSource::AdapterDerived(CounterMode::Flops)
        );
        assert!((section.volume() - 42.0).abs() < f64::EPSILON);
        assert_eq!(section.counters(), &[1]);
        assert_eq!(monitor.counter_events(), &["FP_OPS".to_string()]);
    }

    #[test]
    fn thread_deltas_are_reduced_once_per_stop() {
        let mut adapter = MockCounterAdapter::new();
        adapter
            .expect_initialize()
            .return_const(CounterCapabilities::new(vec!["FP_OPS".to_string()]));
        adapter
            .expect_begin_interval()
            .times(4)
            .returning(|_| CounterSnapshot(vec![0]));
        adapter
            .expect_end_interval()
            .times(4)
            .returning(|thread_id, _| CounterDeltas(vec![thread_id as u64 + 1]));
        adapter
            .expect_derive_volume()
            .withf(|mode, deltas| *mode == CounterMode::Flops && deltas.0 == vec![10])
            .times(1)
            .returning(|_, deltas| deltas.0[0] as f64 * 100.0);

        let mut monitor = MonitorContext::builder()
            .config(
                MonitorConfig::default().with_volume_mode(VolumeMode::Counters(CounterMode::Flops)),
            )
            .counters(Arc::new(adapter))
            .runtime(Arc::new(FixedTeam::new(NonZero::new(4).unwrap())))
            .platform(PlatformFacade::fake(FakePlatform::new()))
            .build();

        monitor.start("region").unwrap();
        monitor.stop("region").unwrap();

        let section = monitor.section("region").unwrap();
        assert!((section.volume() - 1000.0).abs() < f64::EPSILON);
        assert_eq!(section.counters(), &[10]);
    }

    #[test]
    fn inside_parallel_region_only_current_thread_is_measured() {
        let mut runtime = MockThreadRuntime::new();
        runtime.expect_in_parallel_region().return_const(true);
        runtime.expect_current_thread_id().return_const(2_usize);
        runtime.expect_max_threads().return_const(4_usize);

        let mut adapter = MockCounterAdapter::new();
        adapter
            .expect_initialize()
            .return_const(CounterCapabilities::new(vec!["FP_OPS".to_string()]));
        adapter
            .expect_begin_interval()
            .withf(|thread_id| *thread_id == 2)
            .times(1)
            .returning(|_| CounterSnapshot(vec![5]));
        adapter
            .expect_end_interval()
            .withf(|thread_id, start| *thread_id == 2 && start.0 == vec![5])
            .times(1)
            .returning(|_, _| CounterDeltas(vec![7]));
        adapter.expect_derive_volume().returning(|_, _| 0.0);

        let mut monitor = MonitorContext::builder()
            .counters(Arc::new(adapter))
            .runtime(Arc::new(runtime))
            .platform(PlatformFacade::fake(FakePlatform::new()))
            .build();

        monitor.start("region").unwrap();
        monitor.stop("region").unwrap();

        assert_eq!(monitor.section("region").unwrap().counters(), &[7]);
    }

    #[test]
    fn unsupported_adapter_falls_back_to_user_volume() {
        let mut adapter = MockCounterAdapter::new();
        adapter
            .expect_initialize()
            .return_const(CounterCapabilities::unsupported());

        let mut monitor = MonitorContext::builder()
            .config(
                MonitorConfig::default().with_volume_mode(VolumeMode::Counters(CounterMode::Flops)),
            )
            .counters(Arc::new(adapter))
            .platform(PlatformFacade::fake(FakePlatform::new()))
            .build();

        monitor.start("kernel").unwrap();
        monitor.stop_with_volume("kernel", 3.0, 1).unwrap();

        assert!(monitor.counter_events().is_empty());
        assert!((monitor.section("kernel").unwrap().volume() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn set_properties_is_idempotent() {
        let (mut monitor, _clock) = create_test_monitor();

        let first = monitor
            .set_properties("send", SectionKind::Communication, true)
            .unwrap();
        let second = monitor
            .set_properties("send", SectionKind::Communication, true)
            .unwrap();

        assert_eq!(first, second);
        let section = monitor.section("send").unwrap();
        assert_eq!(section.kind(), SectionKind::Communication);
        assert!(section.is_exclusive());
    }

    #[test]
    fn set_properties_rejects_conflicting_redefinition() {
        let (mut monitor, _clock) = create_test_monitor();

        monitor
            .set_properties("send", SectionKind::Communication, true)
            .unwrap();
        let error = monitor
            .set_properties("send", SectionKind::Computation, false)
            .unwrap_err();

        assert!(matches!(error, MonitorError::ConflictingProperties { .. }));
        assert_eq!(
            monitor.section("send").unwrap().kind(),
            SectionKind::Communication
        );
    }

    #[test]
    fn implicit_defaults_can_be_rebound_until_first_use() {
        let (mut monitor, _clock) = create_test_monitor();

        monitor.resolve("late");
        monitor
            .set_properties("late", SectionKind::Communication, false)
            .unwrap();
        assert!(!monitor.section("late").unwrap().is_exclusive());

        monitor.start("used").unwrap();
        monitor.stop("used").unwrap();
        assert!(
            monitor
                .set_properties("used", SectionKind::Computation, false)
                .is_err()
        );
        assert!(
            monitor
                .set_properties("used", SectionKind::Computation, true)
                .is_ok()
        );
    }

    #[test]
    fn root_runs_from_creation_and_is_not_a_user_section() {
        let (mut monitor, _clock) = create_test_monitor();

        assert!(monitor.root().is_running());
        assert!(!monitor.root().is_exclusive());
        assert_eq!(monitor.label(SectionIndex::ROOT), Some(ROOT_LABEL));
        assert_eq!(monitor.lookup(ROOT_LABEL), None);

        let index = monitor.resolve(ROOT_LABEL);
        assert_ne!(index, SectionIndex::ROOT);
        assert_eq!(monitor.sections().count(), 1);
    }

    #[test]
    fn reset_zeroes_one_section() {
        let (mut monitor, clock) = create_test_monitor();

        for label in ["a", "b"] {
            monitor.start(label).unwrap();
            clock.advance(Duration::from_secs(1));
            monitor.stop_with_volume(label, 1.0, 1).unwrap();
        }

        monitor.reset("a").unwrap();
        monitor.reset("unknown").unwrap();

        let a = monitor.section("a").unwrap();
        assert_eq!(a.call_count(), 0);
        assert_eq!(a.elapsed(), Duration::ZERO);
        assert_eq!(a.volume(), 0.0);
        assert_eq!(monitor.section("b").unwrap().call_count(), 1);
    }

    #[test]
    fn reset_refuses_running_sections() {
        let (mut monitor, _clock) = create_test_monitor();

        monitor.start("a").unwrap();

        assert!(matches!(
            monitor.reset("a"),
            Err(MonitorError::RunningDuringReset { .. })
        ));
        assert!(matches!(
            monitor.reset_all(),
            Err(MonitorError::RunningDuringReset { .. })
        ));
    }

    #[test]
    fn reset_all_forgets_labels_and_restarts_root() {
        let (mut monitor, clock) = create_test_monitor();

        monitor.start("a").unwrap();
        clock.advance(Duration::from_secs(5));
        monitor.stop("a").unwrap();

        monitor.reset_all().unwrap();

        assert_eq!(monitor.sections().count(), 0);
        assert_eq!(monitor.lookup("a"), None);
        assert_eq!(monitor.resolve("b").get(), 1);
        assert!(monitor.root().is_running());
    }

    #[test]
    fn replica_inherits_labels_and_properties() {
        let (mut monitor, _clock) = create_test_monitor();
        monitor
            .set_properties("halo", SectionKind::Communication, false)
            .unwrap();

        let replica = monitor.replica(3);

        let halo = replica.section("halo").unwrap();
        assert_eq!(halo.kind(), SectionKind::Communication);
        assert!(!halo.is_exclusive());
        assert_eq!(halo.call_count(), 0);
        assert!(!replica.root().is_running());
    }

    #[test]
    fn merge_takes_max_time_and_calls_and_sums_volume() {
        let (mut monitor, clock) = create_test_monitor();
        let mut fast = monitor.replica(0);
        let mut slow = monitor.replica(1);

        fast.start("kernel").unwrap();
        clock.advance(Duration::from_secs(1));
        fast.stop_with_volume("kernel", 10.0, 1).unwrap();

        slow.start("kernel").unwrap();
        clock.advance(Duration::from_secs(3));
        slow.stop_with_volume("kernel", 20.0, 1).unwrap();
        slow.start("kernel").unwrap();
        slow.stop_with_volume("kernel", 5.0, 1).unwrap();

        monitor.merge_replicas([fast, slow]).unwrap();

        let kernel = monitor.section("kernel").unwrap();
        assert_eq!(kernel.elapsed(), Duration::from_secs(3));
        assert_eq!(kernel.call_count(), 2);
        assert!((kernel.volume() - 35.0).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_rejects_running_replica() {
        let (mut monitor, _clock) = create_test_monitor();
        let mut replica = monitor.replica(0);
        replica.start("kernel").unwrap();

        assert!(matches!(
            monitor.merge_replicas([replica]),
            Err(MonitorError::RunningDuringMerge { .. })
        ));
        assert!(monitor.section("kernel").is_none());
    }

    #[test]
    fn merge_rejects_conflicting_replica_properties() {
        let (mut monitor, _clock) = create_test_monitor();
        monitor
            .set_properties("x", SectionKind::Computation, true)
            .unwrap();

        let mut replica = monitor.replica(0);
        replica.registry.clear();
        replica.sections.truncate(1);
        replica
            .set_properties("x", SectionKind::Communication, true)
            .unwrap();

        assert!(matches!(
            monitor.merge_replicas([replica]),
            Err(MonitorError::ConflictingProperties { .. })
        ));
    }

    #[test]
    fn parallel_runs_every_thread_and_merges() {
        let mut monitor = MonitorContext::builder()
            .runtime(Arc::new(FixedTeam::new(NonZero::new(3).unwrap())))
            .platform(PlatformFacade::fake(FakePlatform::new()))
            .build();

        monitor
            .parallel(|thread_id, replica| {
                replica.start("kernel")?;
                replica.stop_with_volume("kernel", 10.0, u64::try_from(thread_id).unwrap() + 1)
            })
            .unwrap();

        let kernel = monitor.section("kernel").unwrap();
        assert_eq!(kernel.call_count(), 1);
        assert!((kernel.volume() - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parallel_propagates_body_errors() {
        let mut monitor = MonitorContext::builder()
            .runtime(Arc::new(FixedTeam::new(NonZero::new(2).unwrap())))
            .platform(PlatformFacade::fake(FakePlatform::new()))
            .build();

        let result = monitor.parallel(|_, replica| replica.stop("never_started"));

        assert!(matches!(result, Err(MonitorError::NotRunning { .. })));
        assert!(monitor.section("never_started").is_none());
    }

    #[test]
    fn replica_exclusivity_is_thread_private() {
        let (monitor, _clock) = create_test_monitor();
        let mut first = monitor.replica(0);
        let mut second = monitor.replica(1);

        first.start("kernel").unwrap();
        second.start("kernel").unwrap();
        first.stop("kernel").unwrap();
        second.stop("kernel").unwrap();
    }

    #[test]
    fn replica_inherits_running_exclusive_section() {
        let (mut monitor, _clock) = create_test_monitor();
        monitor
            .set_properties("halo", SectionKind::Communication, false)
            .unwrap();
        monitor.start("outer").unwrap();

        let mut replica = monitor.replica(0);
        assert_eq!(replica.active_exclusive(), monitor.lookup("outer"));

        let error = replica.start("kernel").unwrap_err();
        match error {
            MonitorError::ExclusiveOverlap { label, active } => {
                assert_eq!(label, "kernel");
                assert_eq!(active, "outer");
            }
            other => panic!("unexpected error {other:?}"),
        }

        // Non-exclusive sections may still run inside the region.
        replica.start("halo").unwrap();
        replica.stop("halo").unwrap();
    }

    #[test]
    fn parallel_cannot_overlap_running_exclusive_section() {
        let mut monitor = MonitorContext::builder()
            .runtime(Arc::new(FixedTeam::new(NonZero::new(2).unwrap())))
            .platform(PlatformFacade::fake(FakePlatform::new()))
            .build();

        monitor.start("outer").unwrap();

        let result = monitor.parallel(|_, replica| {
            replica.start("kernel")?;
            replica.stop("kernel")
        });

        assert!(matches!(result, Err(MonitorError::ExclusiveOverlap { .. })));
        assert!(monitor.section("kernel").is_none());
        assert_eq!(monitor.active_exclusive(), monitor.lookup("outer"));

        monitor.stop("outer").unwrap();
        monitor
            .parallel(|_, replica| {
                replica.start("kernel")?;
                replica.stop("kernel")
            })
            .unwrap();
        assert_eq!(monitor.section("kernel").unwrap().call_count(), 1);
    }

    #[test]
    fn trace_sink_sees_labels_and_intervals() {
        let recorder = Arc::new(TraceRecorder::new());
        let clock = FakePlatform::new();
        let mut monitor = MonitorContext::builder()
            .platform(PlatformFacade::fake(clock.clone()))
            .trace_sink(Arc::clone(&recorder) as _)
            .build();

        monitor.start("io").unwrap();
        clock.advance(Duration::from_secs(2));
        monitor.stop_with_volume("io", 8.0, 1).unwrap();

        let io = monitor.lookup("io").unwrap();
        assert_eq!(
            recorder.events(),
            vec![
                TraceEvent::DefineLabel {
                    section: SectionIndex::ROOT,
                    label: ROOT_LABEL.to_string()
                },
                TraceEvent::DefineLabel {
                    section: io,
                    label: "io".to_string()
                },
                TraceEvent::Start {
                    section: io,
                    timestamp: 0.0
                },
                TraceEvent::End {
                    section: io,
                    timestamp: 2.0,
                    volume: 8.0
                },
            ]
        );
    }

    static_assertions::assert_impl_all!(MonitorContext: Send, Sync);
}
