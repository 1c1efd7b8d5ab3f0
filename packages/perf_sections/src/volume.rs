//! Where the work-done figure of a section comes from, and how it is presented.

use std::fmt;

use crate::SectionKind;

/// Which hardware-counter derivation the counter adapter applies to produce a volume.
///
/// The weighting of individual counters is owned by the adapter; this only selects the formula.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CounterMode {
    /// Floating point operations.
    Flops,

    /// Bytes moved between memory and the processor.
    Bandwidth,

    /// Vectorized floating point operations.
    Vectorization,

    /// Cache hits and misses.
    Cache,

    /// Cycles and retired instructions.
    Cycles,

    /// Load and store instructions.
    LoadStore,
}

impl CounterMode {
    /// The kind of rate unit that volumes derived in this mode are presented in.
    #[must_use]
    pub fn unit_kind(self) -> SectionKind {
        match self {
            Self::Bandwidth => SectionKind::Communication,
            _ => SectionKind::Computation,
        }
    }
}

impl fmt::Display for CounterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Flops => "flops",
            Self::Bandwidth => "bandwidth",
            Self::Vectorization => "vectorization",
            Self::Cache => "cache",
            Self::Cycles => "cycles",
            Self::LoadStore => "load-store",
        };

        f.write_str(name)
    }
}

/// The process-wide volume configuration, selected externally.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum VolumeMode {
    /// Volume comes from the values callers pass to `stop_with_volume()`.
    #[default]
    User,

    /// Only time is measured; caller-supplied volumes are ignored.
    TimeOnly,

    /// Volume is derived from hardware counters when a counter adapter is available.
    Counters(CounterMode),
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user-supplied volumes"),
            Self::TimeOnly => f.write_str("time only"),
            Self::Counters(mode) => write!(f, "{mode} counters"),
        }
    }
}

/// The single source of a section's volume, decided when the section's properties are bound.
///
/// A section never accumulates volume from more than one source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum VolumeSource {
    /// Caller-supplied `volume_per_unit * unit_multiplier` on each stop.
    UserSupplied,

    /// The counter adapter's derivation over the counter deltas of each interval.
    AdapterDerived(CounterMode),

    /// No volume is accumulated.
    TimeOnly,
}

impl VolumeSource {
    /// Resolves the source for a section given the configured mode and counter availability.
    ///
    /// A counter mode without an available adapter falls back to caller-supplied volumes.
    pub(crate) fn resolve(mode: VolumeMode, counters_available: bool) -> Self {
        match mode {
            VolumeMode::Counters(counter_mode) if counters_available => {
                Self::AdapterDerived(counter_mode)
            }
            VolumeMode::Counters(_) | VolumeMode::User => Self::UserSupplied,
            VolumeMode::TimeOnly => Self::TimeOnly,
        }
    }
}

/// Decimal prefix of a normalized rate.
///
/// Ordered from smallest to largest.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum UnitPrefix {
    /// 10^6
    Mega,

    /// 10^9
    Giga,

    /// 10^12
    Tera,

    /// 10^15
    Peta,
}

impl UnitPrefix {
    const ALL: [Self; 4] = [Self::Mega, Self::Giga, Self::Tera, Self::Peta];

    /// The multiplier this prefix stands for.
    #[must_use]
    pub fn scale(self) -> f64 {
        match self {
            Self::Mega => 1e6,
            Self::Giga => 1e9,
            Self::Tera => 1e12,
            Self::Peta => 1e15,
        }
    }
}

/// The unit of a normalized rate, e.g. `Gflops` or `GB/sec`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Unit {
    prefix: UnitPrefix,
    kind: SectionKind,
}

impl Unit {
    /// The decimal prefix of the unit.
    #[must_use]
    pub fn prefix(&self) -> UnitPrefix {
        self.prefix
    }

    /// The unit text, which depends on whether the rate is a bandwidth or a computation rate.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match (self.kind, self.prefix) {
            (SectionKind::Communication, UnitPrefix::Mega) => "MB/sec",
            (SectionKind::Communication, UnitPrefix::Giga) => "GB/sec",
            (SectionKind::Communication, UnitPrefix::Tera) => "TB/sec",
            (SectionKind::Communication, UnitPrefix::Peta) => "PB/sec",
            (SectionKind::Computation, UnitPrefix::Mega) => "Mflops",
            (SectionKind::Computation, UnitPrefix::Giga) => "Gflops",
            (SectionKind::Computation, UnitPrefix::Tera) => "Tflops",
            (SectionKind::Computation, UnitPrefix::Peta) => "Pflops",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Scales a raw per-second rate to the largest decimal prefix that keeps it at or above one.
///
/// Values below one mega-unit stay in the `Mega` prefix (and thus scale below 1). Values at
/// or beyond one thousand peta-units stay in the `Peta` prefix (and thus scale to 1000 or more).
///
/// # Examples
///
/// ```
/// use perf_sections::{SectionKind, normalize_units};
///
/// let (value, unit) = normalize_units(2.5e9, SectionKind::Computation);
/// assert!((value - 2.5).abs() < 1e-12);
/// assert_eq!(unit.label(), "Gflops");
/// ```
#[must_use]
pub fn normalize_units(value: f64, kind: SectionKind) -> (f64, Unit) {
    let magnitude = value.abs();

    let prefix = UnitPrefix::ALL
        .into_iter()
        .rev()
        .find(|prefix| magnitude >= prefix.scale())
        .unwrap_or(UnitPrefix::Mega);

    (value / prefix.scale(), Unit { prefix, kind })
}
