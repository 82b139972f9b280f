//! Clock and time types for usage tracking.
//!
//! This module provides:
//! - [`ClockTime`]: A nanosecond timestamp type (8 bytes, Copy)
//! - [`Clock`]: Trait for time sources
//! - [`SystemClock`]: Wall clock shared by every process on the machine
//! - [`ManualClock`]: Explicitly driven clock for deterministic tests
//!
//! Usage timestamps are compared across processes, so every clock that feeds
//! a shared segment must count from the same epoch. [`SystemClock`] uses the
//! Unix epoch for that reason.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================================================
// ClockTime
// ============================================================================

/// Time in nanoseconds (8 bytes, Copy).
///
/// # Special Values
///
/// - `ClockTime::NULL`: The null time. For a segment's last known usage this
///   is the sentinel meaning "known purged".
/// - `ClockTime::MAX`: Maximum representable time. Timestamps are limited to
///   63 bits so they fit next to the lock bit of the shared state word.
///
/// # Examples
///
/// ```rust
/// use discardable_shm::clock::ClockTime;
///
/// let t1 = ClockTime::from_secs(1);
/// let t2 = ClockTime::from_millis(500);
/// let t3 = t1 + t2;
///
/// assert_eq!(t3.millis(), 1500);
/// assert_eq!(format!("{}", t3), "1.500s");
/// assert!(ClockTime::NULL.is_null());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Null time (zero).
    pub const NULL: Self = Self(0);

    /// Maximum representable time.
    pub const MAX: Self = Self(u64::MAX >> 1);

    /// Create from nanoseconds, clamped to [`ClockTime::MAX`].
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        if ns > Self::MAX.0 { Self::MAX } else { Self(ns) }
    }

    /// Create from microseconds.
    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Self::from_nanos(us.saturating_mul(1_000))
    }

    /// Create from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self::from_nanos(ms.saturating_mul(1_000_000))
    }

    /// Create from seconds.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self::from_nanos(s.saturating_mul(1_000_000_000))
    }

    /// Get as nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get as milliseconds (truncated).
    #[inline]
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (truncated).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Check if this is the null time.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Convert to Option, returning None for the null time.
    #[inline]
    pub const fn to_option(self) -> Option<Self> {
        if self.is_null() { None } else { Some(self) }
    }

    /// Saturating addition, clamped to [`ClockTime::MAX`].
    #[inline]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self::from_nanos(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction (floors at zero).
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Add for ClockTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::ops::AddAssign for ClockTime {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = self.saturating_add(rhs);
    }
}

impl std::ops::Sub for ClockTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for ClockTime {
    #[inline]
    fn from(d: Duration) -> Self {
        Self::from_nanos(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl From<ClockTime> for Duration {
    #[inline]
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            let secs = self.secs();
            let ms = (self.0 / 1_000_000) % 1000;
            write!(f, "{}.{:03}s", secs, ms)
        }
    }
}

// ============================================================================
// Clock Trait
// ============================================================================

/// A clock that provides the current time.
///
/// Injected into [`DiscardableSegment`](crate::DiscardableSegment) so tests
/// can drive time explicitly.
pub trait Clock: Send + Sync {
    /// Get the current time. Must never return [`ClockTime::NULL`].
    fn now(&self) -> ClockTime;

    /// Clock name (for debugging).
    fn name(&self) -> &str {
        "unknown"
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// Wall clock measured from the Unix epoch.
///
/// All processes sharing a segment read the same epoch, which makes the
/// timestamps they publish comparable.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> ClockTime {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        // A null reading would be indistinguishable from "purged".
        ClockTime::from(since_epoch).saturating_add(ClockTime::from_nanos(1))
    }

    fn name(&self) -> &str {
        "system"
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// A clock that only moves when told to.
///
/// # Example
///
/// ```rust
/// use discardable_shm::clock::{Clock, ClockTime, ManualClock};
///
/// let clock = ManualClock::new(ClockTime::from_secs(10));
/// clock.advance(ClockTime::from_secs(5));
/// assert_eq!(clock.now(), ClockTime::from_secs(15));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    ///
    /// `start` must not be [`ClockTime::NULL`]; segments treat a null usage
    /// time as purged.
    pub fn new(start: ClockTime) -> Self {
        Self {
            now: AtomicU64::new(start.nanos()),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, time: ClockTime) {
        self.now.store(time.nanos(), Ordering::Release);
    }

    /// Move forward by `delta` and return the new time.
    pub fn advance(&self, delta: ClockTime) -> ClockTime {
        let next = self.now().saturating_add(delta);
        self.now.store(next.nanos(), Ordering::Release);
        next
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> ClockTime {
        ClockTime::from_nanos(self.now.load(Ordering::Acquire))
    }

    fn name(&self) -> &str {
        "manual"
    }
}
