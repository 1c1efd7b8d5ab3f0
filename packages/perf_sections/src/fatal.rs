//! Process termination on protocol violations.

use std::process;

use tracing::error;

use crate::{MonitorError, Result};

/// Turns a protocol violation into process termination.
///
/// A caller that starts a running section or stops an idle one has a bug; measurements
/// collected after such an event are meaningless. Applications that prefer to stop
/// immediately over handling [`MonitorError`] can end every monitor call with
/// `.or_terminate()`.
///
/// # Examples
///
/// ```
/// use perf_sections::{MonitorContext, OrTerminate};
///
/// let mut monitor = MonitorContext::builder().build();
///
/// monitor.start("solve").or_terminate();
/// monitor.stop("solve").or_terminate();
/// ```
pub trait OrTerminate<T> {
    /// Returns the value, or logs the error, prints it to stderr and exits with status 1.
    fn or_terminate(self) -> T;
}

impl<T> OrTerminate<T> for Result<T> {
    fn or_terminate(self) -> T {
        match self {
            Ok(value) => value,
            Err(violation) => terminate(&violation),
        }
    }
}

#[cfg_attr(test, mutants::skip)] // Exiting the test process is not something we can assert on.
#[expect(
    clippy::exit,
    reason = "continuing after a protocol violation would only produce wrong statistics"
)]
fn terminate(violation: &MonitorError) -> ! {
    error!(%violation, "section monitor protocol violation");
    eprintln!("perf_sections: {violation}");

    process::exit(1)
}
