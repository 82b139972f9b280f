//! The discardable segment state machine.

use super::options::SegmentOptions;
use super::platform::{self, PurgeOutcome};
use super::state::{LockState, SHARED_STATE_SIZE, SharedState, StateWord};
use super::validation::LockedPages;
use crate::clock::{Clock, ClockTime};
use crate::error::{Error, Result};
use crate::memory::{SharedMemory, SharedMemoryHandle, is_page_aligned, page_count, page_size};
use rustix::fd::BorrowedFd;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

/// Bytes in front of the usable region reserved for the shared state.
#[inline]
fn header_size() -> usize {
    page_count(SHARED_STATE_SIZE) * page_size()
}

/// A shared memory segment whose pages may be purged while unlocked.
///
/// Each process holding the segment has its own `DiscardableSegment`. The
/// instance keeps a private, possibly stale view (how many pages it has
/// locked, when it last knew the segment was in use); every lock and purge
/// re-checks that view against the word shared by all processes.
///
/// Locked ranges are a cooperative convention: nothing stops two holders from
/// locking the same pages. Debug builds panic when one instance locks a page
/// twice or unlocks a page it never locked.
///
/// # Example
///
/// ```rust
/// use discardable_shm::DiscardableSegment;
/// use discardable_shm::memory::page_size;
///
/// let mut segment = DiscardableSegment::new();
/// segment.create_and_map(4 * page_size())?;
///
/// // Freshly created memory is locked; release it when idle.
/// segment.unlock(0, 0);
///
/// // Later, before touching it again:
/// if !segment.lock(0, 0) {
///     // Content was purged (or the lock raced a purge): re-populate.
/// }
/// # Ok::<(), discardable_shm::Error>(())
/// ```
pub struct DiscardableSegment {
    shm: SharedMemory,
    /// Usable bytes after the header page (0 until mapped).
    mapped_size: usize,
    /// Size recorded in the handle this segment was created from or with.
    handle_size: usize,
    locked_page_count: usize,
    locked_pages: LockedPages,
    /// NULL means known purged.
    last_known_usage: ClockTime,
    clock: Arc<dyn Clock>,
    name: String,
}

impl DiscardableSegment {
    /// An empty segment with default options. Call
    /// [`create_and_map`](Self::create_and_map) before use.
    pub fn new() -> Self {
        Self::with_options(SegmentOptions::default())
    }

    /// An empty segment with the given options.
    pub fn with_options(options: SegmentOptions) -> Self {
        let (name, clock) = options.into_parts();
        Self {
            shm: SharedMemory::new(),
            mapped_size: 0,
            handle_size: 0,
            locked_page_count: 0,
            locked_pages: LockedPages::new(),
            last_known_usage: ClockTime::NULL,
            clock,
            name,
        }
    }

    /// Attach to a segment shared by another process.
    ///
    /// By convention the sender hands the segment over locked, so after
    /// [`map`](Self::map) every page counts as locked by this instance.
    pub fn from_handle(handle: SharedMemoryHandle) -> Self {
        Self::from_handle_with_options(handle, SegmentOptions::default())
    }

    /// Attach to a shared segment with the given options.
    pub fn from_handle_with_options(handle: SharedMemoryHandle, options: SegmentOptions) -> Self {
        let (fd, size) = handle.into_parts();
        let mut segment = Self::with_options(options);
        segment.shm = SharedMemory::from_fd(fd);
        segment.handle_size = size;
        segment
    }

    /// Create fresh storage of at least `size` usable bytes and map it.
    ///
    /// The new segment starts locked in full: the creator holds the lock
    /// until it unlocks.
    ///
    /// # Errors
    ///
    /// Fails if `size` is 0, if this instance is already mapped, or if
    /// allocation or mapping fails. On failure the instance is unchanged.
    pub fn create_and_map(&mut self, size: usize) -> Result<()> {
        if self.shm.memory().is_some() {
            return Err(Error::AlreadyMapped);
        }
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }
        let total = header_size()
            .checked_add(size)
            .ok_or_else(|| Error::AllocationFailed(format!("size {size} overflows")))?;

        let mut shm = SharedMemory::new();
        shm.create(&self.name, total)?;
        shm.map(total)?;
        let base = shm
            .memory()
            .ok_or_else(|| Error::AllocationFailed("mapping missing after map".into()))?;
        // SAFETY: The mapping is page aligned, at least one page long and
        // owned by `shm`, which outlives this use.
        unsafe { SharedState::from_ptr(base) }
            .store(StateWord::new(LockState::Locked, ClockTime::NULL));

        self.shm = shm;
        self.handle_size = size;
        self.adopt_locked_mapping();

        tracing::debug!(
            name = %self.name,
            size,
            mapped_size = self.mapped_size,
            "created discardable segment"
        );
        Ok(())
    }

    /// Map a segment obtained through [`from_handle`](Self::from_handle).
    ///
    /// # Errors
    ///
    /// Fails if the handle is closed or invalid, the storage is smaller than
    /// `size`, this instance is already mapped, or `mmap` fails.
    pub fn map(&mut self, size: usize) -> Result<()> {
        if self.shm.memory().is_some() {
            return Err(Error::AlreadyMapped);
        }
        if size == 0 {
            return Err(Error::InvalidSegment(
                "mapping size must be greater than 0".into(),
            ));
        }
        let total = header_size()
            .checked_add(size)
            .ok_or_else(|| Error::InvalidSegment(format!("size {size} overflows")))?;

        self.shm.map(total)?;
        self.adopt_locked_mapping();

        tracing::debug!(size, mapped_size = self.mapped_size, "mapped discardable segment");
        Ok(())
    }

    fn adopt_locked_mapping(&mut self) {
        self.mapped_size = self.shm.mapped_size().saturating_sub(header_size());
        self.locked_page_count = page_count(self.mapped_size);
        self.locked_pages = LockedPages::new();
        self.locked_pages.lock(0..self.locked_page_count);
        self.last_known_usage = self.clock.now();
        debug_assert!(!self.last_known_usage.is_null(), "clock returned NULL");
    }

    /// Lock `length` bytes at `offset` against purging.
    ///
    /// Returns true if the content is still resident. Locking fails if the
    /// segment was purged, if the last known usage is out of date, or if
    /// another holder has it locked. On failure nothing is counted as locked
    /// and the last known usage becomes whatever the platform reported:
    /// the true last usage if the content survived, NULL otherwise.
    ///
    /// `offset` and `length` must be page aligned; a `length` of 0 means
    /// everything from `offset` onward. The range must cover at least one
    /// page and must not already be locked by this instance.
    pub fn lock(&mut self, offset: usize, length: usize) -> bool {
        let pages = self.page_range(offset, length);

        if self.last_known_usage.is_null() {
            tracing::trace!(offset, length, "lock refused, segment known purged");
            return false;
        }

        // An empty range would take the shared word with nothing to unlock.
        debug_assert!(!pages.is_empty(), "lock of an empty range at offset {offset}");
        if pages.is_empty() {
            return false;
        }

        // The shared word only has to be taken by the first range; while
        // any page is locked nobody can purge.
        if self.locked_page_count == 0 {
            let believed = self.last_known_usage;
            let Some(state) = self.shared_state() else {
                return false;
            };
            let outcome = platform::lock_pages(state, believed);
            self.last_known_usage = outcome.last_usage;
            if !outcome.resident {
                tracing::debug!(
                    offset,
                    length,
                    believed = %believed,
                    observed = %outcome.last_usage,
                    "lock failed"
                );
                return false;
            }
        }

        self.locked_page_count += pages.len();
        self.locked_pages.lock(pages);
        self.locked_pages.check_count(self.locked_page_count);
        true
    }

    /// Unlock a range previously locked by this instance.
    ///
    /// Same alignment rules as [`lock`](Self::lock). When the last locked
    /// page is released the segment becomes purgeable and the current time
    /// is published as its last usage.
    pub fn unlock(&mut self, offset: usize, length: usize) {
        let pages = self.page_range(offset, length);
        let count = pages.len();
        if count == 0 {
            return;
        }

        debug_assert!(
            count <= self.locked_page_count,
            "unlocking {count} pages with only {} locked",
            self.locked_page_count
        );
        self.locked_pages.unlock(pages);
        self.locked_page_count = self.locked_page_count.saturating_sub(count);
        self.locked_pages.check_count(self.locked_page_count);

        if self.locked_page_count > 0 {
            return;
        }

        let now = self.clock.now();
        debug_assert!(!now.is_null(), "clock returned NULL");
        if let Some(state) = self.shared_state() {
            platform::unlock_pages(state, now);
        }
        self.last_known_usage = now;
        tracing::trace!(last_usage = %now, "segment unlocked");
    }

    /// Base of the usable region, or `None` if not mapped.
    ///
    /// Only the pages of a range for which [`lock`](Self::lock) returned
    /// true may be read or written.
    pub fn memory(&self) -> Option<NonNull<u8>> {
        let base = self.shm.memory()?;
        // SAFETY: The mapping always spans the header page.
        Some(unsafe { base.add(header_size()) })
    }

    /// The usable region as a slice.
    ///
    /// # Safety
    ///
    /// The caller must hold a successful lock over every byte it reads and
    /// ensure no mutable references exist to this memory.
    pub unsafe fn as_slice(&self) -> Option<&[u8]> {
        let ptr = self.memory()?;
        // SAFETY: `mapped_size` bytes after the header are mapped.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.mapped_size) })
    }

    /// The usable region as a mutable slice.
    ///
    /// # Safety
    ///
    /// The caller must hold a successful lock over every byte it touches.
    /// Other processes sharing the segment see writes immediately.
    pub unsafe fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let ptr = self.memory()?;
        // SAFETY: `mapped_size` bytes after the header are mapped.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.mapped_size) })
    }

    /// Usable size of the mapping; at least the size that was requested.
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Pages this instance currently holds locked.
    pub fn locked_page_count(&self) -> usize {
        self.locked_page_count
    }

    /// The last time this instance knew the segment to be in use.
    ///
    /// May be earlier than the true last usage if another process used the
    /// segment since. [`ClockTime::NULL`] when known purged.
    pub fn last_known_usage(&self) -> ClockTime {
        self.last_known_usage
    }

    /// Try to discard the segment's content.
    ///
    /// Purging fails if any page is locked, or if the last known usage is out
    /// of date. On failure the last known usage is updated: to `current_time`
    /// when locked, to the true last usage otherwise. That makes a second call
    /// often succeed, but there is no guarantee: another process may lock and
    /// unlock in between every call.
    ///
    /// Returns true when the content is gone; the last known usage is then
    /// NULL.
    pub fn purge(&mut self, current_time: ClockTime) -> bool {
        if self.locked_page_count > 0 {
            self.last_known_usage = current_time;
            return false;
        }

        let believed = self.last_known_usage;
        let (Some(state), Some(data)) = (self.shared_state(), self.memory()) else {
            return false;
        };
        // SAFETY: `data` starts `mapped_size` mapped bytes of this segment.
        let outcome = unsafe { platform::purge_pages(state, data, self.mapped_size, believed) };

        match outcome {
            PurgeOutcome::Purged => {
                self.last_known_usage = ClockTime::NULL;
                tracing::debug!(mapped_size = self.mapped_size, "segment purged");
                true
            }
            PurgeOutcome::Locked => {
                self.last_known_usage = current_time;
                tracing::trace!("purge declined, locked by another holder");
                false
            }
            PurgeOutcome::UsedSince(last_usage) => {
                self.last_known_usage = last_usage;
                tracing::trace!(
                    believed = %believed,
                    last_usage = %last_usage,
                    "purge declined, used since last known usage"
                );
                false
            }
        }
    }

    /// Purge, then release as much backing storage as the platform allows.
    ///
    /// On Linux everything but the header page is returned to the OS. The
    /// mapping keeps its size; purged pages read back as zeros.
    pub fn purge_and_truncate(&mut self, current_time: ClockTime) -> bool {
        if !self.purge(current_time) {
            return false;
        }
        if !platform::truncate(&self.shm, header_size()) {
            tracing::debug!("purged segment storage was not truncated");
        }
        true
    }

    /// Whether the content is resident right now, according to the shared
    /// state. The answer can be stale by the time it is returned.
    pub fn is_memory_resident(&self) -> bool {
        self.shared_state().is_some_and(platform::is_resident)
    }

    /// Borrow the open handle, if any.
    pub fn handle(&self) -> Option<BorrowedFd<'_>> {
        self.shm.handle()
    }

    /// Create a handle another process can use to open the same segment.
    ///
    /// Lock state does not travel with the handle.
    ///
    /// # Errors
    ///
    /// Fails if the handle has been closed or cannot be duplicated.
    pub fn share_to_process(&self) -> Result<SharedMemoryHandle> {
        let fd = self.shm.duplicate_handle()?;
        let size = if self.mapped_size > 0 {
            self.mapped_size
        } else {
            self.handle_size
        };
        Ok(SharedMemoryHandle::new(fd, size))
    }

    /// Close the handle. The mapping stays usable until drop.
    ///
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        if !self.shm.is_closed() {
            tracing::trace!(name = %self.name, "closing discardable segment");
        }
        self.shm.close();
    }

    /// The memfd debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn shared_state(&self) -> Option<&SharedState> {
        let base = self.shm.memory()?;
        // SAFETY: The mapping starts with the header page and lives as long
        // as `self.shm`.
        Some(unsafe { SharedState::from_ptr(base) })
    }

    fn page_range(&self, offset: usize, length: usize) -> Range<usize> {
        debug_assert!(is_page_aligned(offset), "offset {offset} is not page aligned");
        debug_assert!(is_page_aligned(length), "length {length} is not page aligned");

        let end = if length == 0 {
            self.mapped_size
        } else {
            offset.saturating_add(length)
        };
        debug_assert!(
            end <= self.mapped_size,
            "range end {end} exceeds mapped size {}",
            self.mapped_size
        );

        let end = end.min(self.mapped_size);
        let start = offset.min(end);
        (start / page_size())..page_count(end)
    }
}

impl Default for DiscardableSegment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DiscardableSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscardableSegment")
            .field("name", &self.name)
            .field("mapped_size", &self.mapped_size)
            .field("locked_page_count", &self.locked_page_count)
            .field("last_known_usage", &self.last_known_usage)
            .field("closed", &self.shm.is_closed())
            .finish()
    }
}
