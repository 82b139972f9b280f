//! Raw shared memory underneath discardable segments.
//!
//! # Architecture
//!
//! - [`SharedMemory`]: memfd storage plus an optional shared mapping
//! - [`SharedMemoryHandle`]: cross-process capability for the same storage
//! - [`ipc`]: moving handles between processes with `SCM_RIGHTS`
//! - [`page`]: platform page size and alignment helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use discardable_shm::memory::SharedMemory;
//!
//! let mut shm = SharedMemory::new();
//! shm.create("cache-block", 64 * 1024)?;
//! shm.map(64 * 1024)?;
//!
//! // Hand a duplicate to another process...
//! let fd = shm.duplicate_handle()?;
//! ```

pub mod ipc;
pub mod page;
mod shared;

pub use page::{align_to_page, is_page_aligned, page_count, page_size};
pub use shared::{SharedMemory, SharedMemoryHandle};
