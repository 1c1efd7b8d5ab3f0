//! Rendering of gathered section statistics as reports.

use std::fmt;

use crate::{ReportLevel, ReportOrder, SectionStats, Summary, Unit};

/// Renders a [`Summary`] as the basic, per-rank and hardware counter reports.
///
/// The level and order default to the configuration the statistics were gathered with.
/// The `Display` implementation renders all reports up to the selected level.
///
/// # Examples
///
/// ```
/// use perf_sections::{MonitorContext, ReportLevel, ReportOrder, SingleProcess};
///
/// let mut monitor = MonitorContext::builder().build();
/// monitor.start("setup").unwrap();
/// monitor.stop("setup").unwrap();
///
/// let summary = monitor.gather(&SingleProcess).unwrap().unwrap();
/// let reporter = summary
///     .reporter()
///     .level(ReportLevel::Detail)
///     .order(ReportOrder::ByRegistration);
///
/// for row in reporter.basic_rows() {
///     println!("{} was called {} times", row.label, row.calls);
/// }
///
/// reporter.print_to_stdout();
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Reporter<'a> {
    summary: &'a Summary,
    order: ReportOrder,
    level: ReportLevel,
}

/// One line of the basic report.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct BasicRow {
    /// The section's label.
    pub label: String,

    /// Intervals finished by rank 0.
    pub calls: u64,

    /// Mean seconds per process. Absent if call counts were inconsistent.
    pub mean_time: Option<f64>,

    /// Sample standard deviation of seconds per process.
    pub stddev_time: Option<f64>,

    /// Mean time as a percentage of the total time.
    pub percent: Option<f64>,

    /// Mean seconds per interval.
    pub time_per_call: Option<f64>,

    /// Mean work per second in a human-readable unit.
    pub speed: Option<(f64, Unit)>,

    /// The longest time any process spent in the section, for communication sections.
    pub communication_time: Option<f64>,

    /// Whether every process finished the same number of intervals.
    pub consistent: bool,
}

impl BasicRow {
    fn new(section: &SectionStats, total_time: f64) -> Self {
        let statistics = section.statistics();

        Self {
            label: section.label().to_string(),
            calls: section.calls(),
            mean_time: statistics.map(|s| s.mean_time()),
            stddev_time: statistics.map(|s| s.stddev_time()),
            percent: section.percent_of(total_time),
            time_per_call: section.time_per_call(),
            speed: section.normalized_speed(),
            communication_time: section.communication_time(),
            consistent: section.is_count_consistent(),
        }
    }
}

/// One process's line of the per-rank report.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct RankRow {
    /// The process.
    pub rank: usize,

    /// Seconds the process spent in the section.
    pub elapsed: f64,

    /// Intervals finished by the process.
    pub calls: u64,

    /// Work done by the process.
    pub volume: f64,

    /// Work per second of the process in a human-readable unit.
    pub speed: Option<(f64, Unit)>,
}

/// One event's line of the hardware counter report.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct CounterRow {
    /// The counter event name.
    pub event: String,

    /// The event count summed over all processes.
    pub total: u64,

    /// The event count of each process, ordered by rank.
    pub per_rank: Vec<u64>,
}

impl<'a> Reporter<'a> {
    /// Creates a reporter with the level and order the summary was gathered with.
    #[must_use]
    pub fn new(summary: &'a Summary) -> Self {
        Self {
            summary,
            order: summary.report_order(),
            level: summary.report_level(),
        }
    }

    /// Selects the order of the exclusive sections.
    #[must_use]
    pub fn order(self, order: ReportOrder) -> Self {
        Self { order, ..self }
    }

    /// Selects which reports `Display` renders.
    #[must_use]
    pub fn level(self, level: ReportLevel) -> Self {
        Self { level, ..self }
    }

    fn exclusive_sections(&self) -> Vec<&'a SectionStats> {
        match self.order {
            ReportOrder::ByTime => self.summary.ranked().collect(),
            ReportOrder::ByRegistration => self
                .summary
                .sections()
                .iter()
                .filter(|section| section.is_exclusive() && !section.label().is_empty())
                .collect(),
        }
    }

    fn non_exclusive_sections(&self) -> impl Iterator<Item = &'a SectionStats> {
        self.summary
            .sections()
            .iter()
            .filter(|section| !section.is_exclusive() && section.has_calls())
    }

    /// Rows of the exclusive sections that were called, in report order.
    #[must_use]
    pub fn basic_rows(&self) -> Vec<BasicRow> {
        let total_time = self.summary.total_time();

        self.exclusive_sections()
            .into_iter()
            .filter(|section| section.has_calls())
            .map(|section| BasicRow::new(section, total_time))
            .collect()
    }

    /// Rows of the non-exclusive sections that were called, in registration order.
    #[must_use]
    pub fn non_exclusive_rows(&self) -> Vec<BasicRow> {
        let total_time = self.summary.total_time();

        self.non_exclusive_sections()
            .map(|section| BasicRow::new(section, total_time))
            .collect()
    }

    /// Per-process rows of one section, ordered by rank.
    #[must_use]
    pub fn rank_rows(&self, section: &SectionStats) -> Vec<RankRow> {
        let unit_kind = section.unit_kind();

        section
            .samples()
            .iter()
            .enumerate()
            .map(|(rank, sample)| RankRow {
                rank,
                elapsed: sample.elapsed(),
                calls: sample.calls(),
                volume: sample.volume(),
                speed: (sample.elapsed() > 0.0 && sample.volume() > 0.0).then(|| {
                    crate::normalize_units(sample.volume() / sample.elapsed(), unit_kind)
                }),
            })
            .collect()
    }

    /// Hardware counter rows of one section, ordered like the summary's counter events.
    ///
    /// Empty if no counters were measured.
    #[must_use]
    pub fn counter_rows(&self, section: &SectionStats) -> Vec<CounterRow> {
        let totals = section.counter_totals();

        self.summary
            .counter_events()
            .iter()
            .enumerate()
            .map(|(event_index, event)| CounterRow {
                event: event.clone(),
                total: totals.get(event_index).copied().unwrap_or_default(),
                per_rank: section
                    .counters()
                    .iter()
                    .map(|rank| rank.get(event_index).copied().unwrap_or_default())
                    .collect(),
            })
            .collect()
    }

    /// Prints the reports to stdout.
    ///
    /// Prints nothing if no section was ever called, so a job that measured nothing does
    /// not clutter its output.
    #[cfg_attr(test, mutants::skip)] // Too difficult to test stdout output reliably - manually tested.
    pub fn print_to_stdout(&self) {
        if !self.summary.has_calls() {
            return;
        }

        println!("{self}");
    }

    fn label_width(&self) -> usize {
        self.summary
            .sections()
            .iter()
            .map(|section| section.label().chars().count())
            .max()
            .unwrap_or_default()
            .max(MIN_LABEL_WIDTH)
    }

    fn write_basic(&self, f: &mut fmt::Formatter<'_>, width: usize) -> fmt::Result {
        let rows = self.basic_rows();

        let order = match self.order {
            ReportOrder::ByTime => "slowest first",
            ReportOrder::ByRegistration => "in registration order",
        };

        writeln!(f, "Exclusive sections ({order}):")?;
        write_header(f, width)?;

        for row in &rows {
            write_row(f, row, width)?;
        }

        let covered: f64 = rows.iter().filter_map(|row| row.percent).sum();
        writeln!(
            f,
            "  {:<width$} {covered:>48.2}% of total",
            "(sum of exclusive sections)"
        )?;

        let non_exclusive = self.non_exclusive_rows();

        if !non_exclusive.is_empty() {
            writeln!(f)?;
            writeln!(f, "Non-exclusive sections:")?;
            write_header(f, width)?;

            for row in &non_exclusive {
                write_row(f, row, width)?;
            }
        }

        Ok(())
    }

    fn write_ranks(&self, f: &mut fmt::Formatter<'_>, width: usize) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Per-process detail:")?;

        for section in self
            .exclusive_sections()
            .into_iter()
            .chain(self.non_exclusive_sections())
            .filter(|section| section.has_calls())
        {
            writeln!(f, "  {}", section.label())?;

            for row in self.rank_rows(section) {
                write!(
                    f,
                    "    rank {:<4} {:>12.6} s {:>10} calls {:>14.4e}",
                    row.rank, row.elapsed, row.calls, row.volume
                )?;

                match row.speed {
                    Some((value, unit)) => writeln!(f, " {value:>10.3} {unit}")?,
                    None => writeln!(f)?,
                }
            }
        }

        Ok(())
    }

    fn write_counters(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Hardware counters ({}):", self.summary.volume_mode())?;

        for section in self
            .exclusive_sections()
            .into_iter()
            .chain(self.non_exclusive_sections())
            .filter(|section| section.has_calls())
        {
            writeln!(f, "  {}", section.label())?;

            for row in self.counter_rows(section) {
                writeln!(f, "    {:<24} {:>20}", row.event, row.total)?;
            }
        }

        Ok(())
    }
}

const MIN_LABEL_WIDTH: usize = 12;

fn write_header(f: &mut fmt::Formatter<'_>, width: usize) -> fmt::Result {
    writeln!(
        f,
        "  {:<width$} {:>10} {:>12} {:>12} {:>8} {:>12} {:>16}",
        "Label", "Calls", "Time [s]", "StdDev [s]", "[%]", "s/call", "Speed"
    )
}

fn write_row(f: &mut fmt::Formatter<'_>, row: &BasicRow, width: usize) -> fmt::Result {
    if !row.consistent {
        return writeln!(
            f,
            "  {:<width$} {:>10} (call counts differ between processes)",
            row.label, row.calls
        );
    }

    write!(
        f,
        "  {:<width$} {:>10} {:>12.6} {:>12.6} {:>8.2} {:>12.6}",
        row.label,
        row.calls,
        row.mean_time.unwrap_or_default(),
        row.stddev_time.unwrap_or_default(),
        row.percent.unwrap_or_default(),
        row.time_per_call.unwrap_or_default(),
    )?;

    match row.speed {
        Some((value, unit)) => write!(f, " {value:>9.3} {unit:<6}")?,
        None => write!(f, " {:>16}", "-")?,
    }

    match row.communication_time {
        Some(max) => writeln!(f, "  (max {max:.6} s)"),
        None => writeln!(f),
    }
}

impl fmt::Display for Reporter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.summary.has_calls() {
            return writeln!(f, "No section statistics captured.");
        }

        writeln!(
            f,
            "Section statistics over {} process(es), total time {:.6} s",
            self.summary.process_count(),
            self.summary.total_time()
        )?;
        writeln!(f)?;

        let width = self.label_width();

        self.write_basic(f, width)?;

        if self.level >= ReportLevel::Detail {
            self.write_ranks(f, width)?;
        }

        if self.level >= ReportLevel::Full && !self.summary.counter_events().is_empty() {
            self.write_counters(f)?;
        }

        Ok(())
    }
}
