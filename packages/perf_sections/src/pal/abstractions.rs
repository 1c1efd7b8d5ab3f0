use std::fmt::Debug;
use std::time::Duration;

/// Provides the wall clock used to time sections.
pub(crate) trait Platform: Debug + Send + Sync + 'static {
    /// Time elapsed since the platform instance was created.
    ///
    /// Never goes backwards.
    fn now(&self) -> Duration;
}
