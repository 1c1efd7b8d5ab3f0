#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Named section timing with cross-process statistics for parallel scientific applications.
//!
//! An application marks regions of its code as labeled sections and brackets every
//! execution of a region with a start and a stop. Each section accumulates wall time, call
//! count and a "volume" of work done (floating point operations or bytes). At the end of the
//! job, the measurements of all processes are gathered on rank 0 into mean and standard
//! deviation statistics, ranked by time and rendered as reports.
//!
//! The core types are:
//! - [`MonitorContext`] - Owns the sections of one process and their start/stop state
//! - [`Summary`] - The statistics of all processes, produced by [`MonitorContext::gather()`]
//! - [`Reporter`] - Renders a [`Summary`] as text or as report rows
//!
//! The hardware counter backend, the inter-process transport, the thread runtime and the
//! trace exporter are collaborators behind the [`CounterAdapter`], [`Transport`],
//! [`ThreadRuntime`] and [`TraceSink`] traits.
//!
//! # Simple usage
//!
//! ```
//! use perf_sections::{MonitorContext, SectionKind, SingleProcess};
//!
//! let mut monitor = MonitorContext::builder().build();
//!
//! monitor
//!     .set_properties("exchange", SectionKind::Communication, true)
//!     .unwrap();
//!
//! for _ in 0..10 {
//!     monitor.start("stencil").unwrap();
//!     let mut sum = 0.0_f64;
//!     for i in 0..10_000 {
//!         sum += f64::from(i) * 0.5;
//!     }
//!     std::hint::black_box(sum);
//!     // 10 000 multiplications and additions.
//!     monitor.stop_with_volume("stencil", 2.0, 10_000).unwrap();
//!
//!     monitor.start("exchange").unwrap();
//!     monitor.stop_with_volume("exchange", 8.0, 1024).unwrap();
//! }
//!
//! if let Some(summary) = monitor.gather(&SingleProcess).unwrap() {
//!     summary.reporter().print_to_stdout();
//! }
//! ```
//!
//! # Exclusive and non-exclusive sections
//!
//! Sections are exclusive by default: no two exclusive sections may run at the same time, so
//! their times add up to at most the total time and can be reported as percentages of it.
//! Sections bound as non-exclusive with [`MonitorContext::set_properties()`] may overlap
//! anything and are reported separately.
//!
//! # Volume
//!
//! The volume of a section comes from exactly one source, selected by [`VolumeMode`] in the
//! [`MonitorConfig`]: the values passed to [`MonitorContext::stop_with_volume()`], the
//! [`CounterAdapter`]'s derivation from hardware counters, or nowhere (time only).
//!
//! # Threads
//!
//! A [`MonitorContext`] is used from one thread at a time. Parallel regions measure into
//! thread-private replicas that are merged afterwards; [`MonitorContext::parallel()`] does
//! both.
//!
//! # Errors
//!
//! Misuse such as stopping a section that is not running is reported as [`MonitorError`].
//! Measurements are meaningless after such a bug; [`OrTerminate`] ends the process instead.
//!
//! # Logging
//!
//! The package logs through `tracing`: registrations, bindings and gather milestones at
//! debug level, every start and stop at trace level, degradations at warn level.

mod aggregate;
mod config;
mod counters;
mod error;
mod fatal;
mod monitor;
mod pal;
mod registry;
mod report;
mod runtime;
mod section;
mod trace;
mod transport;
mod volume;

pub use aggregate::*;
pub use config::*;
pub use counters::*;
pub use error::*;
pub use fatal::*;
pub use monitor::*;
pub use report::*;
pub use runtime::*;
pub use section::{SectionIndex, SectionKind, SectionSnapshot};
pub use trace::*;
pub use transport::*;
pub use volume::*;

pub(crate) const ERR_POISONED_LOCK: &str =
    "encountered poisoned lock - program validity cannot be guaranteed";
