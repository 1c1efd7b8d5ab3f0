//! Cross-process reduction of section measurements into statistics.

use std::cmp::Ordering;
use std::mem;

use foldhash::{HashSet, HashSetExt};
use tracing::{debug, warn};

use crate::pal::Platform;
use crate::section::{Binding, SectionState};
use crate::{
    CounterDeltas, MonitorConfig, MonitorContext, MonitorError, ReportLevel, ReportOrder,
    Reporter, Result, SectionIndex, SectionKind, Transport, Unit, VolumeMode, VolumeSource,
    normalize_units,
};

/// One process's accumulated measurements of a section.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RankSample {
    elapsed: f64,
    volume: f64,
    calls: u64,
}

impl RankSample {
    pub(crate) fn new(elapsed: f64, volume: f64, calls: u64) -> Self {
        Self {
            elapsed,
            volume,
            calls,
        }
    }

    /// Seconds spent in the section.
    #[must_use]
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Work done in the section.
    #[must_use]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Number of finished intervals.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

/// Mean and sample standard deviation of time and volume across processes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Statistics {
    mean_time: f64,
    stddev_time: f64,
    mean_volume: f64,
    stddev_volume: f64,
}

impl Statistics {
    fn from_samples(samples: &[RankSample]) -> Self {
        let times: Vec<f64> = samples.iter().map(RankSample::elapsed).collect();
        let volumes: Vec<f64> = samples.iter().map(RankSample::volume).collect();

        let (mean_time, stddev_time) = mean_and_stddev(&times);
        let (mean_volume, stddev_volume) = mean_and_stddev(&volumes);

        Self {
            mean_time,
            stddev_time,
            mean_volume,
            stddev_volume,
        }
    }

    /// Mean seconds per process.
    #[must_use]
    pub fn mean_time(&self) -> f64 {
        self.mean_time
    }

    /// Sample standard deviation of seconds per process. Zero for a single process.
    #[must_use]
    pub fn stddev_time(&self) -> f64 {
        self.stddev_time
    }

    /// Mean work per process.
    #[must_use]
    pub fn mean_volume(&self) -> f64 {
        self.mean_volume
    }

    /// Sample standard deviation of work per process. Zero for a single process.
    #[must_use]
    pub fn stddev_volume(&self) -> f64 {
        self.stddev_volume
    }
}

/// Returns the mean and the sample standard deviation (N-1 denominator) of the values.
///
/// The deviation is zero for fewer than two values.
#[expect(
    clippy::cast_precision_loss,
    reason = "process counts are far below the 2^52 limit of exact conversion"
)]
pub(crate) fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }

    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;

    if values.len() < 2 {
        return (mean, 0.0);
    }

    // Two passes keep the variance non-negative regardless of magnitude.
    let variance = values
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / (count - 1.0);

    (mean, variance.sqrt())
}

/// The aggregated measurements of one section across all processes.
#[derive(Clone, Debug)]
pub struct SectionStats {
    label: String,
    kind: SectionKind,
    exclusive: bool,
    volume_source: VolumeSource,
    samples: Vec<RankSample>,
    // Outer index is the rank, inner index the counter event.
    counters: Vec<Vec<u64>>,
    statistics: Option<Statistics>,
    count_consistent: bool,
    communication_time: Option<f64>,
}

impl SectionStats {
    pub(crate) fn from_samples(
        label: String,
        kind: SectionKind,
        exclusive: bool,
        volume_source: VolumeSource,
        samples: Vec<RankSample>,
        counters: Vec<Vec<u64>>,
    ) -> Self {
        // Non-exclusive sections may legitimately be entered a different number of times.
        let count_consistent = !exclusive
            || samples
                .windows(2)
                .all(|pair| matches!(pair, [first, second] if first.calls == second.calls));

        if !count_consistent {
            let calls: Vec<u64> = samples.iter().map(RankSample::calls).collect();
            warn!(
                label = label.as_str(),
                ?calls,
                "call counts differ between processes, section statistics omitted"
            );
        }

        let statistics =
            (count_consistent && !samples.is_empty()).then(|| Statistics::from_samples(&samples));

        let communication_time = (kind == SectionKind::Communication).then(|| {
            samples
                .iter()
                .map(RankSample::elapsed)
                .fold(0.0, f64::max)
        });

        Self {
            label,
            kind,
            exclusive,
            volume_source,
            samples,
            counters,
            statistics,
            count_consistent,
            communication_time,
        }
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

    /// Raw measurements, ordered by rank.
    #[must_use]
    pub fn samples(&self) -> &[RankSample] {
        &self.samples
    }

    /// Counter sums per rank, each ordered like the summary's counter events.
    #[must_use]
    pub fn counters(&self) -> &[Vec<u64>] {
        &self.counters
    }

    /// Counter sums over all ranks, ordered like the summary's counter events.
    #[must_use]
    pub fn counter_totals(&self) -> Vec<u64> {
        let mut totals = CounterDeltas::default();

        for rank in &self.counters {
            totals.accumulate(&CounterDeltas(rank.clone()));
        }

        totals.0
    }

    /// Mean and deviation across processes. Absent if call counts were inconsistent.
    #[must_use]
    pub fn statistics(&self) -> Option<&Statistics> {
        self.statistics.as_ref()
    }

    /// Whether every process finished the same number of intervals.
    ///
    /// Always `true` for non-exclusive sections, which are not checked.
    #[must_use]
    pub fn is_count_consistent(&self) -> bool {
        self.count_consistent
    }

    /// The longest time any process spent in a communication section.
    #[must_use]
    pub fn communication_time(&self) -> Option<f64> {
        self.communication_time
    }

    /// Intervals finished by rank 0.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.samples.first().map_or(0, RankSample::calls)
    }

    /// Whether any process finished at least one interval.
    #[must_use]
    pub fn has_calls(&self) -> bool {
        self.samples.iter().any(|sample| sample.calls > 0)
    }

    /// The kind that decides the unit of the section's speed.
    ///
    /// Counter-derived bandwidth is presented in bytes even for computation sections.
    #[must_use]
    pub fn unit_kind(&self) -> SectionKind {
        match self.volume_source {
            VolumeSource::AdapterDerived(mode) => mode.unit_kind(),
            VolumeSource::UserSupplied | VolumeSource::TimeOnly => self.kind,
        }
    }

    /// Mean work per second, if the section has statistics, took time and did work.
    #[must_use]
    pub fn speed(&self) -> Option<f64> {
        let statistics = self.statistics.as_ref()?;

        (statistics.mean_time > 0.0 && statistics.mean_volume > 0.0)
            .then(|| statistics.mean_volume / statistics.mean_time)
    }

    /// [`speed()`](Self::speed) scaled to a human-readable unit.
    #[must_use]
    pub fn normalized_speed(&self) -> Option<(f64, Unit)> {
        self.speed()
            .map(|speed| normalize_units(speed, self.unit_kind()))
    }

    /// Mean seconds per interval, if the section has statistics and was called.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "call counts beyond 2^52 lose precision we do not need"
    )]
    pub fn time_per_call(&self) -> Option<f64> {
        let statistics = self.statistics.as_ref()?;
        let calls = self.calls();

        (calls > 0).then(|| statistics.mean_time / calls as f64)
    }

    /// Mean time as a percentage of `total` seconds.
    #[must_use]
    pub fn percent_of(&self, total: f64) -> Option<f64> {
        let statistics = self.statistics.as_ref()?;

        (total > 0.0).then(|| statistics.mean_time / total * 100.0)
    }
}

/// Orders exclusive, labeled sections by descending mean time.
///
/// Ties and sections without statistics keep registration order; the latter go last.
fn rank_by_time(sections: &[SectionStats]) -> Vec<usize> {
    let mean_time = |position: usize| {
        sections
            .get(position)
            .and_then(SectionStats::statistics)
            .map(Statistics::mean_time)
    };

    let mut ranking: Vec<usize> = sections
        .iter()
        .enumerate()
        .filter(|(_, section)| section.exclusive && !section.label.is_empty())
        .map(|(position, _)| position)
        .collect();

    // Stable, so equal keys stay in registration order.
    ranking.sort_by(|&a, &b| match (mean_time(a), mean_time(b)) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    ranking
}

/// Everything known about a monitored job after [`MonitorContext::gather()`].
#[derive(Clone, Debug)]
pub struct Summary {
    process_count: usize,
    root_times: Vec<f64>,
    total_time: f64,
    volume_mode: VolumeMode,
    report_level: ReportLevel,
    report_order: ReportOrder,
    counter_events: Vec<String>,
    sections: Vec<SectionStats>,
    ranking: Vec<usize>,
}

impl Summary {
    pub(crate) fn new(
        root_times: Vec<f64>,
        config: &MonitorConfig,
        counter_events: Vec<String>,
        sections: Vec<SectionStats>,
    ) -> Self {
        let (total_time, _) = mean_and_stddev(&root_times);
        let ranking = rank_by_time(&sections);

        Self {
            process_count: root_times.len(),
            root_times,
            total_time,
            volume_mode: config.volume_mode(),
            report_level: config.report_level(),
            report_order: config.report_order(),
            counter_events,
            sections,
            ranking,
        }
    }

    /// Number of processes that took part in the gather.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.process_count
    }

    /// Lifetime of the root section of each process, in seconds, ordered by rank.
    #[must_use]
    pub fn root_times(&self) -> &[f64] {
        &self.root_times
    }

    /// Mean lifetime of the root section, in seconds. The denominator of all percentages.
    #[must_use]
    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// How section volumes were measured.
    #[must_use]
    pub fn volume_mode(&self) -> VolumeMode {
        self.volume_mode
    }

    /// The report level configured when the statistics were gathered.
    #[must_use]
    pub fn report_level(&self) -> ReportLevel {
        self.report_level
    }

    /// The report order configured when the statistics were gathered.
    #[must_use]
    pub fn report_order(&self) -> ReportOrder {
        self.report_order
    }

    /// Names of the measured hardware counter events. Empty without counters.
    #[must_use]
    pub fn counter_events(&self) -> &[String] {
        &self.counter_events
    }

    /// All user sections in registration order.
    #[must_use]
    pub fn sections(&self) -> &[SectionStats] {
        &self.sections
    }

    /// The aggregated measurements of the section with the given label.
    #[must_use]
    pub fn section(&self, label: &str) -> Option<&SectionStats> {
        self.sections.iter().find(|section| section.label == label)
    }

    /// Positions in [`sections()`](Self::sections) of the exclusive sections, slowest first.
    #[must_use]
    pub fn ranking(&self) -> &[usize] {
        &self.ranking
    }

    /// The exclusive sections, slowest first.
    pub fn ranked(&self) -> impl Iterator<Item = &SectionStats> {
        self.ranking
            .iter()
            .filter_map(|position| self.sections.get(*position))
    }

    /// Whether any section finished at least one interval on any process.
    #[must_use]
    pub fn has_calls(&self) -> bool {
        self.sections.iter().any(SectionStats::has_calls)
    }

    /// A reporter using the configured level and order.
    #[must_use]
    pub fn reporter(&self) -> Reporter<'_> {
        Reporter::new(self)
    }
}

impl MonitorContext {
    /// Stops the root section and reduces all sections of all processes on rank 0.
    ///
    /// This is a collective operation: every process of the job must call it with its own
    /// transport handle. Sections registered on only some processes are registered everywhere
    /// first and report zero calls where they were never used. The properties bound on the
    /// lowest rank that bound them explicitly win.
    ///
    /// Returns the summary on rank 0 and `None` on every other rank.
    ///
    /// # Errors
    ///
    /// [`MonitorError::AlreadyGathered`] if called a second time.
    ///
    /// [`MonitorError::RunningDuringGather`] if a section is running. The context is left
    /// untouched and the gather may be retried once the section is stopped.
    pub fn gather(&mut self, transport: &dyn Transport) -> Result<Option<Summary>> {
        if self.gathered {
            return Err(MonitorError::AlreadyGathered);
        }

        if let Some(running) = self.user_slots().find(|section| section.is_running()) {
            return Err(MonitorError::RunningDuringGather {
                label: running.label.clone(),
            });
        }

        self.gathered = true;
        self.stop_root();

        let distributed = transport.size() > 1;

        let order: Vec<SectionIndex> = if distributed {
            self.reconcile_labels(transport)
        } else {
            (1..self.registry.len()).map(SectionIndex::new).collect()
        };

        debug!(
            sections = order.len(),
            processes = transport.size(),
            rank = transport.rank(),
            "gathering section statistics"
        );

        let events = if distributed {
            self.agree_counter_events(transport)
        } else {
            self.counter_events().to_vec()
        };

        let root_elapsed = self.slot(SectionIndex::ROOT).elapsed.as_secs_f64();
        let root_times = collect_f64(transport, distributed, root_elapsed);

        let mut gathered = Vec::with_capacity(order.len());

        for index in order {
            let section = self.slot(index);

            let properties = collect_u64(
                transport,
                distributed,
                encode_properties(section.kind, section.exclusive, section.binding),
            );
            let times = collect_f64(transport, distributed, section.elapsed.as_secs_f64());
            let volumes = collect_f64(transport, distributed, section.volume);
            let calls = collect_u64(transport, distributed, section.call_count);

            let counters_by_event: Vec<Vec<u64>> = (0..events.len())
                .map(|event| {
                    let local = section.counters.0.get(event).copied().unwrap_or_default();
                    collect_u64(transport, distributed, local)
                })
                .collect();

            let samples: Vec<RankSample> = times
                .iter()
                .zip(&volumes)
                .zip(&calls)
                .map(|((elapsed, volume), calls)| RankSample::new(*elapsed, *volume, *calls))
                .collect();

            let counters: Vec<Vec<u64>> = (0..samples.len())
                .map(|rank| {
                    counters_by_event
                        .iter()
                        .map(|per_rank| per_rank.get(rank).copied().unwrap_or_default())
                        .collect()
                })
                .collect();

            let (kind, exclusive) = agreed_properties(&properties)
                .unwrap_or((section.kind, section.exclusive));

            gathered.push((
                section.label.clone(),
                kind,
                exclusive,
                section.volume_source,
                samples,
                counters,
            ));
        }

        if distributed {
            transport.barrier();
        }

        if let Some(sink) = &self.trace_sink {
            sink.finalize();
        }

        if transport.rank() != 0 {
            debug!(rank = transport.rank(), "section statistics sent to rank 0");
            return Ok(None);
        }

        let sections = gathered
            .into_iter()
            .map(|(label, kind, exclusive, volume_source, samples, counters)| {
                SectionStats::from_samples(label, kind, exclusive, volume_source, samples, counters)
            })
            .collect();

        let summary = Summary::new(root_times, &self.config, events, sections);

        debug!(
            total_time = summary.total_time(),
            ranked = summary.ranking().len(),
            "section statistics gathered"
        );

        Ok(Some(summary))
    }

    fn stop_root(&mut self) {
        let now = self.platform.now();
        let root = self.slot_mut(SectionIndex::ROOT);

        if let SectionState::Running { started_at, .. } =
            mem::replace(&mut root.state, SectionState::Idle)
        {
            root.record_interval(
                now.saturating_sub(started_at),
                0.0,
                &CounterDeltas::default(),
            );
        }
    }

    /// Adopts the counter events of rank 0 on every process.
    ///
    /// Every process then issues the same number of counter collectives per section, even
    /// where the adapter is missing or unsupported. Events a process does not measure
    /// contribute zero.
    fn agree_counter_events(&self, transport: &dyn Transport) -> Vec<String> {
        let local = encode_labels(self.counter_events().iter().map(String::as_str));
        let agreed = decode_labels(&transport.broadcast_bytes(local));

        if agreed.as_slice() != self.counter_events() {
            debug!(
                rank = transport.rank(),
                local = ?self.counter_events(),
                agreed = ?agreed,
                "counter events differ from rank 0, reporting rank 0 events"
            );
        }

        agreed
    }

    /// Registers the union of all processes' labels on every process.
    ///
    /// Returns the section indexes in the agreed order: the labels of rank 0 in registration
    /// order, then labels first seen on higher ranks.
    fn reconcile_labels(&mut self, transport: &dyn Transport) -> Vec<SectionIndex> {
        let local = encode_labels(self.registry.user_labels().map(|(_, label)| label));

        let mut seen = HashSet::new();
        let mut union = Vec::new();

        for bytes in transport.gather_bytes(local) {
            for label in decode_labels(&bytes) {
                if seen.insert(label.clone()) {
                    union.push(label);
                }
            }
        }

        let agreed = decode_labels(
            &transport.broadcast_bytes(encode_labels(union.iter().map(String::as_str))),
        );

        agreed.iter().map(|label| self.resolve(label)).collect()
    }
}

fn collect_f64(transport: &dyn Transport, distributed: bool, value: f64) -> Vec<f64> {
    if distributed {
        transport.gather_f64(value)
    } else {
        vec![value]
    }
}

fn collect_u64(transport: &dyn Transport, distributed: bool, value: u64) -> Vec<u64> {
    if distributed {
        transport.gather_u64(value)
    } else {
        vec![value]
    }
}

const PROPERTY_EXCLUSIVE: u64 = 0b001;
const PROPERTY_COMMUNICATION: u64 = 0b010;
const PROPERTY_EXPLICIT: u64 = 0b100;

fn encode_properties(kind: SectionKind, exclusive: bool, binding: Binding) -> u64 {
    let mut code = 0;

    if exclusive {
        code |= PROPERTY_EXCLUSIVE;
    }

    if kind == SectionKind::Communication {
        code |= PROPERTY_COMMUNICATION;
    }

    if binding == Binding::Explicit {
        code |= PROPERTY_EXPLICIT;
    }

    code
}

/// The properties explicitly bound on the lowest rank, if any rank bound them.
fn agreed_properties(codes: &[u64]) -> Option<(SectionKind, bool)> {
    let code = codes.iter().find(|code| *code & PROPERTY_EXPLICIT != 0)?;

    let kind = if code & PROPERTY_COMMUNICATION != 0 {
        SectionKind::Communication
    } else {
        SectionKind::Computation
    };

    Some((kind, code & PROPERTY_EXCLUSIVE != 0))
}

fn encode_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
    let mut bytes = Vec::new();

    for label in labels {
        let length = u64::try_from(label.len()).expect("label length fits in u64");
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.extend_from_slice(label.as_bytes());
    }

    bytes
}

fn decode_labels(mut bytes: &[u8]) -> Vec<String> {
    let mut labels = Vec::new();

    while let Some((length, rest)) = bytes.split_first_chunk::<8>() {
        let Ok(length) = usize::try_from(u64::from_le_bytes(*length)) else {
            break;
        };

        let Some((label, rest)) = rest.split_at_checked(length) else {
            break;
        };

        labels.push(String::from_utf8_lossy(label).into_owned());
        bytes = rest;
    }

    labels
}
