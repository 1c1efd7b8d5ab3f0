//! Optional export of section intervals as an event stream.

use std::fmt::Debug;
use std::sync::Mutex;

use crate::{ERR_POISONED_LOCK, SectionIndex};

/// Receives every section interval as it happens.
///
/// Timestamps are seconds since the monitor context was created. A sink has no influence on
/// the measurements; its absence changes nothing but the exported stream.
#[cfg_attr(test, mockall::automock)]
pub trait TraceSink: Debug + Send + Sync {
    /// A section was registered under a label.
    fn define_label(&self, section: SectionIndex, label: &str);

    /// A section started.
    fn record_interval_start(&self, section: SectionIndex, timestamp: f64);

    /// A section stopped, having done `volume` work during the interval.
    fn record_interval_end(&self, section: SectionIndex, timestamp: f64, volume: f64);

    /// No more events will follow.
    fn finalize(&self);
}

/// One event received by a [`TraceRecorder`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum TraceEvent {
    /// See [`TraceSink::define_label()`].
    DefineLabel {
        /// The registered section.
        section: SectionIndex,

        /// Its label.
        label: String,
    },

    /// See [`TraceSink::record_interval_start()`].
    Start {
        /// The started section.
        section: SectionIndex,

        /// Seconds since the monitor context was created.
        timestamp: f64,
    },

    /// See [`TraceSink::record_interval_end()`].
    End {
        /// The stopped section.
        section: SectionIndex,

        /// Seconds since the monitor context was created.
        timestamp: f64,

        /// Work done during the interval.
        volume: f64,
    },

    /// See [`TraceSink::finalize()`].
    Finalize,
}

/// A trace sink that keeps all events in memory.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use perf_sections::{MonitorContext, TraceEvent, TraceRecorder};
///
/// let recorder = Arc::new(TraceRecorder::new());
/// let mut monitor = MonitorContext::builder()
///     .trace_sink(Arc::clone(&recorder) as _)
///     .build();
///
/// monitor.start("io").unwrap();
/// monitor.stop("io").unwrap();
///
/// assert!(recorder
///     .events()
///     .iter()
///     .any(|event| matches!(event, TraceEvent::End { .. })));
/// ```
#[derive(Debug, Default)]
pub struct TraceRecorder {
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of all events received so far, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().expect(ERR_POISONED_LOCK).clone()
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().expect(ERR_POISONED_LOCK).push(event);
    }
}

impl TraceSink for TraceRecorder {
    fn define_label(&self, section: SectionIndex, label: &str) {
        self.push(TraceEvent::DefineLabel {
            section,
            label: label.to_string(),
        });
    }

    fn record_interval_start(&self, section: SectionIndex, timestamp: f64) {
        self.push(TraceEvent::Start { section, timestamp });
    }

    fn record_interval_end(&self, section: SectionIndex, timestamp: f64, volume: f64) {
        self.push(TraceEvent::End {
            section,
            timestamp,
            volume,
        });
    }

    fn finalize(&self) {
        self.push(TraceEvent::Finalize);
    }
}
