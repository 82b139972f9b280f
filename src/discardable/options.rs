//! Construction options for discardable segments.

use crate::clock::{Clock, SystemClock};
use std::sync::Arc;

/// Debug name given to memfds created without an explicit name.
pub const DEFAULT_SEGMENT_NAME: &str = "discardable-segment";

/// Options for building a [`DiscardableSegment`](super::DiscardableSegment).
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use discardable_shm::clock::{ClockTime, ManualClock};
/// use discardable_shm::SegmentOptions;
///
/// let options = SegmentOptions::new()
///     .name("tile-cache")
///     .clock(Arc::new(ManualClock::new(ClockTime::from_secs(1))));
/// assert_eq!(options.segment_name(), "tile-cache");
/// ```
#[derive(Clone)]
pub struct SegmentOptions {
    name: String,
    clock: Arc<dyn Clock>,
}

impl SegmentOptions {
    /// Defaults: [`DEFAULT_SEGMENT_NAME`] and the [`SystemClock`].
    pub fn new() -> Self {
        Self {
            name: DEFAULT_SEGMENT_NAME.to_string(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Set the memfd debug name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the time source used for unlock timestamps.
    ///
    /// Every process sharing a segment must use clocks with a common epoch.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The configured memfd debug name.
    pub fn segment_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (String, Arc<dyn Clock>) {
        (self.name, self.clock)
    }
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SegmentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentOptions")
            .field("name", &self.name)
            .field("clock", &self.clock.name())
            .finish()
    }
}
