//! The thread-parallelism model the monitor measures under.

use std::fmt::Debug;
use std::num::NonZero;

/// Describes the fork-join thread team of the measured application.
///
/// The monitor uses this to decide for which threads hardware counters are read when a
/// process-level section starts and stops, and how many thread-private replicas
/// [`MonitorContext::parallel()`][crate::MonitorContext::parallel] creates.
#[cfg_attr(test, mockall::automock)]
pub trait ThreadRuntime: Debug + Send + Sync {
    /// The number of threads in a parallel region.
    fn max_threads(&self) -> usize;

    /// The id of the calling thread within its team, `0..max_threads()`.
    fn current_thread_id(&self) -> usize;

    /// Whether the caller is inside a parallel region.
    fn in_parallel_region(&self) -> bool;
}

/// A purely serial application: one thread, never in a parallel region.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialRuntime;

impl ThreadRuntime for SerialRuntime {
    fn max_threads(&self) -> usize {
        1
    }

    fn current_thread_id(&self) -> usize {
        0
    }

    fn in_parallel_region(&self) -> bool {
        false
    }
}

/// An application whose parallel regions always run on a fixed number of threads.
///
/// Measurements are issued from the serial part of the application (thread 0); the parallel
/// regions themselves are driven by [`MonitorContext::parallel()`][crate::MonitorContext::parallel].
#[derive(Clone, Copy, Debug)]
pub struct FixedTeam {
    threads: NonZero<usize>,
}

impl FixedTeam {
    /// Creates a team of the given size.
    #[must_use]
    pub fn new(threads: NonZero<usize>) -> Self {
        Self { threads }
    }
}

impl ThreadRuntime for FixedTeam {
    fn max_threads(&self) -> usize {
        self.threads.get()
    }

    fn current_thread_id(&self) -> usize {
        0
    }

    fn in_parallel_region(&self) -> bool {
        false
    }
}
