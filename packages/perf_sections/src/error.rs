use thiserror::Error;

use crate::SectionKind;

/// Protocol violations detected by the section monitor.
///
/// Every variant indicates a bug in the calling code rather than a transient fault. Continuing
/// after one of these would produce silently wrong statistics, so callers are expected to stop
/// measuring. Use [`OrTerminate`][crate::OrTerminate] to turn them into a diagnostic followed by
/// process termination.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// A section was started while it was already running.
    #[error("section '{label}' was started while already running")]
    AlreadyRunning {
        /// Label of the offending section.
        label: String,
    },

    /// A section was stopped without a matching start.
    #[error("section '{label}' was stopped but it is not running")]
    NotRunning {
        /// Label of the offending section.
        label: String,
    },

    /// An exclusive section was started while another exclusive section was active.
    #[error(
        "exclusive section '{label}' was started while exclusive section '{active}' is still running"
    )]
    ExclusiveOverlap {
        /// Label of the section that was being started.
        label: String,

        /// Label of the exclusive section that was already active.
        active: String,
    },

    /// A section's properties were redefined in a way that cannot be reconciled.
    #[error(
        "section '{label}' is already defined as {existing_kind} (exclusive: {existing_exclusive}), \
         cannot redefine it as {requested_kind} (exclusive: {requested_exclusive})"
    )]
    ConflictingProperties {
        /// Label of the offending section.
        label: String,

        /// The kind the section was originally bound to.
        existing_kind: SectionKind,

        /// The exclusivity the section was originally bound to.
        existing_exclusive: bool,

        /// The kind requested by the conflicting call.
        requested_kind: SectionKind,

        /// The exclusivity requested by the conflicting call.
        requested_exclusive: bool,
    },

    /// Statistics were gathered a second time.
    #[error("statistics have already been gathered, a second gather would double-reduce them")]
    AlreadyGathered,

    /// A section was reset while running.
    #[error("section '{label}' cannot be reset while it is running")]
    RunningDuringReset {
        /// Label of the offending section.
        label: String,
    },

    /// A thread-private replica was merged while one of its sections was running.
    #[error("thread-private section '{label}' is still running and cannot be merged")]
    RunningDuringMerge {
        /// Label of the offending section.
        label: String,
    },

    /// Statistics were gathered while a section was running.
    #[error("section '{label}' is still running, stop it before gathering statistics")]
    RunningDuringGather {
        /// Label of the offending section.
        label: String,
    },
}

/// A specialized `Result` type for section monitor operations, returning the crate's
/// [`MonitorError`] type as the error value.
pub type Result<T> = std::result::Result<T, MonitorError>;
