//! Gathering section statistics from several processes, simulated by threads.
//!
//! Each rank does a different amount of work in "solve" and takes a divergent branch in
//! "refine", whose call counts then differ between ranks. The report on rank 0 shows the
//! spread of "solve" and flags "refine" instead of printing misleading statistics.
//!
//! Run with: `cargo run --example perf_sections_cluster`.
#![expect(
    clippy::arithmetic_side_effects,
    reason = "this is example code that does not need production-level safety"
)]

use std::hint::black_box;
use std::num::NonZero;
use std::sync::Arc;
use std::thread;

use perf_sections::{
    FixedTeam, LocalCluster, MonitorConfig, MonitorContext, OrTerminate, ReportLevel, Transport,
};

const RANKS: usize = 4;

fn main() {
    let ranks = LocalCluster::new(NonZero::new(RANKS).expect("RANKS is not zero"));

    thread::scope(|s| {
        for transport in ranks {
            s.spawn(move || run_rank(&transport));
        }
    });
}

fn run_rank(transport: &LocalCluster) {
    let rank = transport.rank();

    let mut monitor = MonitorContext::builder()
        .config(MonitorConfig::from_env().with_report_level(ReportLevel::Detail))
        .runtime(Arc::new(FixedTeam::new(
            NonZero::new(2).expect("2 is not zero"),
        )))
        .build();

    let work = 200_000 * (rank as u64 + 1);

    monitor.start("solve").or_terminate();
    let mut sum = 0_u64;
    for i in 0..work {
        sum = sum.wrapping_add(i * i);
    }
    black_box(sum);
    monitor
        .stop_with_volume("solve", 2.0, work)
        .or_terminate();

    for _ in 0..=rank % 2 {
        monitor.start("refine").or_terminate();
        black_box(rank);
        monitor.stop("refine").or_terminate();
    }

    monitor
        .parallel(|thread_id, replica| {
            replica.start("threaded")?;
            black_box(thread_id * rank);
            replica.stop_with_volume("threaded", 1e3, 1)
        })
        .or_terminate();

    if let Some(summary) = monitor.gather(transport).or_terminate() {
        summary.reporter().print_to_stdout();
    }
}
