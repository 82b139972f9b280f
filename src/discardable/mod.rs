//! Discardable segments: shared memory the platform may purge while unlocked.
//!
//! # Architecture
//!
//! - [`DiscardableSegment`]: per-process lock/unlock/purge state machine
//! - [`SegmentOptions`]: memfd name and time source
//! - `state`: the lock/usage word shared by every process
//! - `platform`: lock, unlock, purge and truncate round-trips on that word
//! - `validation`: debug-only record of locked pages
//!
//! # Lifecycle
//!
//! ```text
//! new() ── create_and_map() ─┐
//!                            ├─► locked ── unlock() ─► unlocked ── purge() ─► purged
//! from_handle() ── map() ────┘     ▲                      │                     │
//!                                  └──── lock() == true ──┘   lock() == false ◄─┘
//! ```

mod options;
pub(crate) mod platform;
pub(crate) mod state;
mod segment;
pub(crate) mod validation;

pub use options::{DEFAULT_SEGMENT_NAME, SegmentOptions};
pub use segment::DiscardableSegment;
