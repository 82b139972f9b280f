//! # discardable-shm
//!
//! Cross-process discardable shared memory.
//!
//! A [`DiscardableSegment`] is a shared memory region that a group of
//! processes lock while they use it and unlock when idle. Unlocked segments
//! may be purged: their pages are handed back to the OS. Each process keeps
//! its own possibly-stale view of when the segment was last used, and every
//! lock or purge settles races through a single atomic word stored in the
//! segment itself, so no coordinator is needed.
//!
//! ## Features
//!
//! - **memfd-backed**: segments are anonymous shared memory, shareable by fd
//! - **Timestamp arbitration**: stale purges never discard freshly used data
//! - **Page-granular locking**: lock and unlock independent page ranges
//! - **Debug validation**: overlapping lock/unlock ranges panic in debug builds
//!
//! ## Quick Start
//!
//! ```rust
//! use discardable_shm::{ClockTime, DiscardableSegment};
//! use discardable_shm::clock::{Clock, SystemClock};
//! use discardable_shm::memory::page_size;
//!
//! let mut segment = DiscardableSegment::new();
//! segment.create_and_map(8 * page_size())?;
//! segment.unlock(0, 0);
//!
//! // A reclaimer decides the segment has been idle long enough.
//! let now = SystemClock::new().now();
//! if segment.purge(now) {
//!     assert!(!segment.is_memory_resident());
//!     assert_eq!(segment.last_known_usage(), ClockTime::NULL);
//! }
//! # Ok::<(), discardable_shm::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod discardable;
pub mod error;
pub mod memory;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::clock::{Clock, ClockTime, ManualClock, SystemClock};
    pub use crate::discardable::{DiscardableSegment, SegmentOptions};
    pub use crate::error::{Error, Result};
    pub use crate::memory::{SharedMemoryHandle, page_size};
}

pub use clock::ClockTime;
pub use discardable::{DiscardableSegment, SegmentOptions};
pub use error::{Error, Result};
