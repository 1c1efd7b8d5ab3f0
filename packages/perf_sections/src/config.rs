//! Externally selected behavior of a monitor context.

use std::env;

use tracing::warn;

use crate::{CounterMode, VolumeMode};

/// Environment variable selecting the [`VolumeMode`].
///
/// Accepted values: `user`, `time`, `flops`, `bandwidth`, `vector`, `cache`, `cycle`, `loadstore`.
pub const ENV_VOLUME: &str = "PERF_SECTIONS_VOLUME";

/// Environment variable selecting the [`ReportLevel`].
///
/// Accepted values: `basic`, `detail`, `full`.
pub const ENV_REPORT: &str = "PERF_SECTIONS_REPORT";

/// Environment variable selecting the [`ReportOrder`].
///
/// Accepted values: `time`, `registration`.
pub const ENV_ORDER: &str = "PERF_SECTIONS_ORDER";

/// How much a rendered report contains.
///
/// Each level includes everything the previous level contains.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum ReportLevel {
    /// Ranked per-section statistics.
    #[default]
    Basic,

    /// Adds the per-rank breakdown of every section.
    Detail,

    /// Adds the hardware counter breakdown of every section.
    Full,
}

/// The order in which sections appear in a rendered report.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReportOrder {
    /// Descending mean time, ties in registration order.
    #[default]
    ByTime,

    /// The order in which labels were first used.
    ByRegistration,
}

/// Configuration of a [`MonitorContext`][crate::MonitorContext].
///
/// # Examples
///
/// ```
/// use perf_sections::{CounterMode, MonitorConfig, ReportLevel, VolumeMode};
///
/// let config = MonitorConfig::default()
///     .with_volume_mode(VolumeMode::Counters(CounterMode::Flops))
///     .with_report_level(ReportLevel::Detail);
///
/// assert_eq!(config.report_level(), ReportLevel::Detail);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MonitorConfig {
    volume_mode: VolumeMode,
    report_level: ReportLevel,
    report_order: ReportOrder,
}

impl MonitorConfig {
    /// Reads the configuration from the process environment.
    ///
    /// Missing variables keep their defaults. Unrecognized values are logged and also keep
    /// their defaults, as deployments are free to set these to whatever they like.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key-value source.
    ///
    /// This is the same as [`from_env()`](Self::from_env) but without touching process state.
    ///
    /// # Examples
    ///
    /// ```
    /// use perf_sections::{CounterMode, MonitorConfig, VolumeMode};
    ///
    /// let config = MonitorConfig::from_lookup(|key| match key {
    ///     "PERF_SECTIONS_VOLUME" => Some("bandwidth".to_string()),
    ///     _ => None,
    /// });
    ///
    /// assert_eq!(
    ///     config.volume_mode(),
    ///     VolumeMode::Counters(CounterMode::Bandwidth)
    /// );
    /// ```
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_VOLUME) {
            config.volume_mode = parse_volume_mode(&value).unwrap_or_else(|| {
                warn!(
                    key = ENV_VOLUME,
                    value = %value,
                    "unknown volume mode, measuring user volumes"
                );
                VolumeMode::default()
            });
        }

        if let Some(value) = lookup(ENV_REPORT) {
            config.report_level = parse_report_level(&value).unwrap_or_else(|| {
                warn!(
                    key = ENV_REPORT,
                    value = %value,
                    "unknown report level, using basic report"
                );
                ReportLevel::default()
            });
        }

        if let Some(value) = lookup(ENV_ORDER) {
            config.report_order = parse_report_order(&value).unwrap_or_else(|| {
                warn!(
                    key = ENV_ORDER,
                    value = %value,
                    "unknown report order, ordering by time"
                );
                ReportOrder::default()
            });
        }

        config
    }

    /// Sets the volume mode.
    #[must_use]
    pub fn with_volume_mode(self, volume_mode: VolumeMode) -> Self {
        Self {
            volume_mode,
            ..self
        }
    }

    /// Sets the report level.
    #[must_use]
    pub fn with_report_level(self, report_level: ReportLevel) -> Self {
        Self {
            report_level,
            ..self
        }
    }

    /// Sets the report order.
    #[must_use]
    pub fn with_report_order(self, report_order: ReportOrder) -> Self {
        Self {
            report_order,
            ..self
        }
    }

    /// Where section volumes come from.
    #[must_use]
    pub fn volume_mode(&self) -> VolumeMode {
        self.volume_mode
    }

    /// How much a rendered report contains.
    #[must_use]
    pub fn report_level(&self) -> ReportLevel {
        self.report_level
    }

    /// The order of sections in a rendered report.
    #[must_use]
    pub fn report_order(&self) -> ReportOrder {
        self.report_order
    }
}

fn parse_volume_mode(value: &str) -> Option<VolumeMode> {
    let mode = match value.trim().to_ascii_lowercase().as_str() {
        "user" => VolumeMode::User,
        "time" | "none" => VolumeMode::TimeOnly,
        "flops" => VolumeMode::Counters(CounterMode::Flops),
        "bandwidth" => VolumeMode::Counters(CounterMode::Bandwidth),
        "vector" => VolumeMode::Counters(CounterMode::Vectorization),
        "cache" => VolumeMode::Counters(CounterMode::Cache),
        "cycle" => VolumeMode::Counters(CounterMode::Cycles),
        "loadstore" => VolumeMode::Counters(CounterMode::LoadStore),
        _ => return None,
    };

    Some(mode)
}

fn parse_report_level(value: &str) -> Option<ReportLevel> {
    match value.trim().to_ascii_lowercase().as_str() {
        "basic" => Some(ReportLevel::Basic),
        "detail" => Some(ReportLevel::Detail),
        "full" => Some(ReportLevel::Full),
        _ => None,
    }
}

fn parse_report_order(value: &str) -> Option<ReportOrder> {
    match value.trim().to_ascii_lowercase().as_str() {
        "time" => Some(ReportOrder::ByTime),
        "registration" => Some(ReportOrder::ByRegistration),
        _ => None,
    }
}
