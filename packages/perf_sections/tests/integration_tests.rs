//! Integration tests for `perf_sections` against the real clock and the public API.

use std::hint::black_box;
use std::num::NonZero;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use perf_sections::{
    CounterAdapter, CounterCapabilities, CounterDeltas, CounterMode, CounterSnapshot, FixedTeam,
    LocalCluster, MonitorConfig, MonitorContext, MonitorError, ReportLevel, SectionKind,
    SingleProcess, Summary, Transport, VolumeMode, VolumeSource,
};

/// Keeps the processor busy for at least the given wall time.
fn busy_wait(duration: Duration) -> u64 {
    let start = Instant::now();
    let mut accumulator = 0_u64;

    while start.elapsed() < duration {
        for i in 0..1000_u64 {
            accumulator = accumulator.wrapping_mul(31).wrapping_add(i);
        }
        black_box(accumulator);
    }

    accumulator
}

/// Runs one closure per simulated rank and returns the results ordered by rank.
fn run_ranks<T: Send>(
    size: usize,
    body: impl Fn(LocalCluster) -> T + Sync,
) -> Vec<T> {
    let ranks = LocalCluster::new(NonZero::new(size).unwrap());
    let body = &body;

    thread::scope(|s| {
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|rank| s.spawn(move || body(rank)))
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn root_summary(results: Vec<Option<Summary>>) -> Summary {
    let mut results = results.into_iter();
    let summary = results.next().unwrap().unwrap();
    assert!(results.all(|other| other.is_none()));
    summary
}

#[test]
#[cfg_attr(miri, ignore)] // Miri is too slow for busy waiting.
fn real_clock_measures_elapsed_time() {
    let mut monitor = MonitorContext::builder().build();

    monitor.start("work").unwrap();
    busy_wait(Duration::from_millis(20));
    monitor.stop("work").unwrap();

    let work = monitor.section("work").unwrap();
    assert!(work.elapsed() >= Duration::from_millis(20));
    assert_eq!(work.call_count(), 1);

    let summary = monitor.gather(&SingleProcess).unwrap().unwrap();
    let stats = summary.section("work").unwrap();
    let mean_time = stats.statistics().unwrap().mean_time();

    assert!(mean_time >= 0.020);
    assert!(summary.total_time() >= mean_time);
    assert!(stats.percent_of(summary.total_time()).unwrap() <= 100.0);
}

#[test]
fn distributed_gather_computes_statistics_on_rank_zero() {
    let results = run_ranks(3, |transport| {
        let mut monitor = MonitorContext::builder().build();
        let rank = transport.rank();

        monitor
            .set_properties("exchange", SectionKind::Communication, true)
            .unwrap();

        monitor.start("solve").unwrap();
        monitor
            .stop_with_volume("solve", 1e6, u64::try_from(rank).unwrap() + 1)
            .unwrap();

        monitor.start("exchange").unwrap();
        monitor.stop("exchange").unwrap();

        monitor.gather(&transport).unwrap()
    });

    let summary = root_summary(results);

    assert_eq!(summary.process_count(), 3);
    assert_eq!(summary.root_times().len(), 3);

    let solve = summary.section("solve").unwrap();
    assert!(solve.is_count_consistent());
    assert_eq!(solve.samples().len(), 3);

    let statistics = solve.statistics().unwrap();
    assert!((statistics.mean_volume() - 2e6).abs() < 1e-3);
    assert!((statistics.stddev_volume() - 1e6).abs() < 1e-3);

    let exchange = summary.section("exchange").unwrap();
    assert_eq!(exchange.kind(), SectionKind::Communication);
    assert!(exchange.communication_time().is_some());
}

#[test]
fn divergent_call_counts_degrade_to_no_statistics() {
    let results = run_ranks(2, |transport| {
        let mut monitor = MonitorContext::builder().build();
        let calls = if transport.rank() == 0 { 3 } else { 2 };

        for _ in 0..calls {
            monitor.start("branchy").unwrap();
            monitor.stop("branchy").unwrap();
        }

        monitor.start("steady").unwrap();
        monitor.stop("steady").unwrap();

        monitor.gather(&transport).unwrap()
    });

    let summary = root_summary(results);

    let branchy = summary.section("branchy").unwrap();
    assert!(!branchy.is_count_consistent());
    assert!(branchy.statistics().is_none());

    let steady = summary.section("steady").unwrap();
    assert!(steady.is_count_consistent());
    assert!(steady.statistics().is_some());

    // The inconsistent section still shows up in the report, after the ranked ones.
    let labels: Vec<_> = summary
        .reporter()
        .basic_rows()
        .into_iter()
        .map(|row| row.label)
        .collect();
    assert_eq!(labels, vec!["steady", "branchy"]);
}

#[test]
fn sections_used_on_some_ranks_only_are_reconciled() {
    let results = run_ranks(3, |transport| {
        let mut monitor = MonitorContext::builder().build();

        // Every rank registers its sections in a different order.
        if transport.rank() == 2 {
            monitor
                .set_properties("only_on_two", SectionKind::Communication, false)
                .unwrap();
            monitor.start("only_on_two").unwrap();
            monitor.stop("only_on_two").unwrap();
        }

        monitor.start("common").unwrap();
        monitor.stop("common").unwrap();

        monitor.gather(&transport).unwrap()
    });

    let summary = root_summary(results);

    let labels: Vec<_> = summary
        .sections()
        .iter()
        .map(|section| section.label())
        .collect();
    assert_eq!(labels, vec!["common", "only_on_two"]);

    let only_on_two = summary.section("only_on_two").unwrap();
    assert_eq!(only_on_two.kind(), SectionKind::Communication);
    assert!(!only_on_two.is_exclusive());
    let calls: Vec<_> = only_on_two.samples().iter().map(|s| s.calls()).collect();
    assert_eq!(calls, vec![0, 0, 1]);
}

#[test]
fn gather_is_once_per_context() {
    let mut monitor = MonitorContext::builder().build();

    monitor.gather(&SingleProcess).unwrap();

    let error = monitor.gather(&SingleProcess).unwrap_err();
    assert!(matches!(error, MonitorError::AlreadyGathered));
}

#[test]
fn parallel_regions_merge_into_process_context() {
    let mut monitor = MonitorContext::builder()
        .runtime(Arc::new(FixedTeam::new(NonZero::new(4).unwrap())))
        .build();

    for _ in 0..2 {
        monitor
            .parallel(|thread_id, replica| {
                replica.start("kernel")?;
                black_box(thread_id);
                replica.stop_with_volume("kernel", 100.0, 1)
            })
            .unwrap();
    }

    let kernel = monitor.section("kernel").unwrap();
    assert_eq!(kernel.call_count(), 2);
    assert!((kernel.volume() - 800.0).abs() < f64::EPSILON);

    let summary = monitor.gather(&SingleProcess).unwrap().unwrap();
    assert_eq!(summary.section("kernel").unwrap().calls(), 2);
}

#[test]
fn config_from_lookup_drives_volume_source() {
    let config = MonitorConfig::from_lookup(|key| match key {
        "PERF_SECTIONS_VOLUME" => Some("TIME".to_string()),
        "PERF_SECTIONS_REPORT" => Some("full".to_string()),
        _ => None,
    });

    assert_eq!(config.volume_mode(), VolumeMode::TimeOnly);
    assert_eq!(config.report_level(), ReportLevel::Full);

    let mut monitor = MonitorContext::builder().config(config).build();
    monitor.start("a").unwrap();
    monitor.stop_with_volume("a", 10.0, 10).unwrap();

    let a = monitor.section("a").unwrap();
    assert_eq!(a.volume_source(), VolumeSource::TimeOnly);
    assert_eq!(a.volume(), 0.0);
}

/// Pretends every thread executes 1000 floating point operations per interval.
#[derive(Debug)]
struct ConstantFlops;

impl CounterAdapter for ConstantFlops {
    fn initialize(&self) -> CounterCapabilities {
        CounterCapabilities::new(vec!["FP_ARITH".to_string()])
    }

    fn begin_interval(&self, _thread_id: usize) -> CounterSnapshot {
        CounterSnapshot(vec![0])
    }

    fn end_interval(&self, _thread_id: usize, _start: &CounterSnapshot) -> CounterDeltas {
        CounterDeltas(vec![1000])
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "test values are small"
    )]
    fn derive_volume(&self, _mode: CounterMode, deltas: &CounterDeltas) -> f64 {
        deltas.0.iter().sum::<u64>() as f64
    }
}

#[test]
fn counter_adapter_volume_flows_into_report() {
    let mut monitor = MonitorContext::builder()
        .config(
            MonitorConfig::default()
                .with_volume_mode(VolumeMode::Counters(CounterMode::Flops))
                .with_report_level(ReportLevel::Full),
        )
        .counters(Arc::new(ConstantFlops))
        .runtime(Arc::new(FixedTeam::new(NonZero::new(2).unwrap())))
        .build();

    monitor.start("kernel").unwrap();
    monitor.stop_with_volume("kernel", 1e12, 1).unwrap();

    let kernel = monitor.section("kernel").unwrap();
    assert!((kernel.volume() - 2000.0).abs() < f64::EPSILON);
    assert_eq!(kernel.counters(), &[2000]);

    let summary = monitor.gather(&SingleProcess).unwrap().unwrap();
    assert_eq!(summary.counter_events(), &["FP_ARITH".to_string()]);

    let reporter = summary.reporter();
    let rows = reporter.counter_rows(summary.section("kernel").unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total, 2000);

    assert!(reporter.to_string().contains("FP_ARITH"));
}

#[test]
fn counters_on_some_ranks_only_still_gather() {
    let results = run_ranks(2, |transport| {
        let mut builder = MonitorContext::builder().config(
            MonitorConfig::default().with_volume_mode(VolumeMode::Counters(CounterMode::Flops)),
        );

        if transport.rank() == 0 {
            builder = builder.counters(Arc::new(ConstantFlops));
        }

        let mut monitor = builder.build();

        monitor.start("kernel").unwrap();
        monitor.stop_with_volume("kernel", 10.0, 1).unwrap();

        monitor.gather(&transport).unwrap()
    });

    let summary = root_summary(results);
    assert_eq!(summary.counter_events(), &["FP_ARITH".to_string()]);

    let kernel = summary.section("kernel").unwrap();
    assert_eq!(kernel.counters(), &[vec![1000], vec![0]]);
    assert_eq!(kernel.counter_totals(), vec![1000]);
    assert!(kernel.is_count_consistent());
}

#[test]
fn counters_missing_on_rank_zero_are_not_reported() {
    let results = run_ranks(2, |transport| {
        let mut builder = MonitorContext::builder();

        if transport.rank() == 1 {
            builder = builder.counters(Arc::new(ConstantFlops));
        }

        let mut monitor = builder.build();

        monitor.start("kernel").unwrap();
        monitor.stop("kernel").unwrap();

        monitor.gather(&transport).unwrap()
    });

    let summary = root_summary(results);
    assert!(summary.counter_events().is_empty());
    assert_eq!(summary.section("kernel").unwrap().calls(), 1);
}
