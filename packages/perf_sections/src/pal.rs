//! Platform abstraction layer for the wall clock.
//!
//! This module allows switching between the real monotonic clock and a fake clock
//! that tests advance explicitly.

mod abstractions;
mod facade;
#[cfg(test)]
mod fake;
mod real;

pub(crate) use abstractions::Platform;
pub(crate) use facade::PlatformFacade;
#[cfg(test)]
pub(crate) use fake::FakePlatform;
