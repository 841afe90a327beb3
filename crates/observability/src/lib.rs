//! Process-wide tracing setup for lessonflow binaries and tests.

pub mod tracing;

pub use tracing::LogFormat;

/// Install the fmt subscriber in the configured format.
///
/// Later calls are no-ops, so tests and binaries can both call it.
pub fn init(format: LogFormat) {
    tracing::init(format);
}
