//! A small stencil solver instrumented with `perf_sections`.
//!
//! Shows exclusive computation and communication sections, a non-exclusive section that
//! spans both, caller-supplied volumes and the report at every level.
//!
//! Run with: `cargo run --example perf_sections_basic`.
#![expect(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "this is example code that does not need production-level safety"
)]

use std::hint::black_box;

use perf_sections::{
    MonitorConfig, MonitorContext, OrTerminate, ReportLevel, SectionKind, SingleProcess,
};

const GRID: usize = 256;
const STEPS: usize = 20;

fn main() {
    let config = MonitorConfig::from_env().with_report_level(ReportLevel::Detail);
    let mut monitor = MonitorContext::builder().config(config).build();

    monitor
        .set_properties("time_step", SectionKind::Computation, false)
        .or_terminate();
    monitor
        .set_properties("halo_exchange", SectionKind::Communication, true)
        .or_terminate();

    let mut grid = vec![1.0_f64; GRID * GRID];
    let mut next = grid.clone();

    for _ in 0..STEPS {
        monitor.start("time_step").or_terminate();

        monitor.start("stencil").or_terminate();
        for y in 1..GRID - 1 {
            for x in 1..GRID - 1 {
                let i = y * GRID + x;
                next[i] = 0.25 * (grid[i - 1] + grid[i + 1] + grid[i - GRID] + grid[i + GRID]);
            }
        }
        std::mem::swap(&mut grid, &mut next);
        // Four additions and one multiplication per interior point.
        let points = ((GRID - 2) * (GRID - 2)) as u64;
        monitor
            .stop_with_volume("stencil", 5.0, points)
            .or_terminate();

        monitor.start("halo_exchange").or_terminate();
        let halo: f64 = grid[..GRID].iter().sum();
        black_box(halo);
        // One boundary row of doubles in each direction.
        monitor
            .stop_with_volume("halo_exchange", 8.0, 2 * GRID as u64)
            .or_terminate();

        monitor.stop("time_step").or_terminate();
    }

    println!("Measured {} sections.", monitor.sections().count());

    if let Some(summary) = monitor.gather(&SingleProcess).or_terminate() {
        summary.reporter().print_to_stdout();
    }
}
