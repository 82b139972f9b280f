//! The platform purge mechanism.
//!
//! Every decision about whether content is still resident is made here, by a
//! single atomic round-trip on the [`SharedState`] word. Instances never cache
//! residency; they pass in what they believe and learn what is true.
//!
//! Releasing pages to the OS is platform specific: Linux and Android punch
//! the pages out of the memfd with `MADV_REMOVE`, elsewhere the mapping is
//! only advised `DONTNEED`.

use super::state::{LockState, SharedState, StateWord};
use crate::clock::ClockTime;
use crate::memory::SharedMemory;
use rustix::mm::Advice;
use std::ptr::NonNull;

#[cfg(any(target_os = "linux", target_os = "android"))]
const PURGE_ADVICE: Advice = Advice::LinuxRemove;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const PURGE_ADVICE: Advice = Advice::DontNeed;

/// Result of asking the platform to lock a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOutcome {
    /// The content is resident and now locked.
    pub resident: bool,
    /// The last usage timestamp the platform observed. Null when the content
    /// is gone or somebody else holds the lock.
    pub last_usage: ClockTime,
}

/// Result of asking the platform to purge a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// The content was discarded.
    Purged,
    /// Another holder has the segment locked.
    Locked,
    /// The segment was used more recently than believed.
    UsedSince(ClockTime),
}

/// Lock the segment if it is unlocked and was last used at `believed`.
pub fn lock_pages(state: &SharedState, believed: ClockTime) -> LockOutcome {
    let expected = StateWord::new(LockState::Unlocked, believed);
    let locked = StateWord::new(LockState::Locked, ClockTime::NULL);
    match state.compare_exchange(expected, locked) {
        Ok(observed) => LockOutcome {
            resident: true,
            last_usage: observed.timestamp(),
        },
        Err(observed) => LockOutcome {
            resident: false,
            last_usage: observed.timestamp(),
        },
    }
}

/// Release the lock and publish `now` as the last usage.
///
/// A purged word is left alone. Returns the word that was replaced.
pub fn unlock_pages(state: &SharedState, now: ClockTime) -> StateWord {
    let unlocked = StateWord::new(LockState::Unlocked, now);
    let result = state.update(|word| match word.lock_state() {
        LockState::Locked => Some(unlocked),
        LockState::Unlocked if word.timestamp().is_null() => None,
        LockState::Unlocked => Some(StateWord::new(
            LockState::Unlocked,
            word.timestamp().max(now),
        )),
    });
    match result {
        Ok(previous) => {
            if previous.lock_state() == LockState::Unlocked {
                // Typical for a segment attached from a handle after the
                // sender already unlocked it.
                tracing::debug!(
                    last_usage = %previous.timestamp(),
                    "segment was already unlocked"
                );
            }
            previous
        }
        Err(purged) => {
            tracing::warn!("unlocking a purged segment");
            purged
        }
    }
}

/// Discard the data pages if the segment is unlocked and was last used at
/// `believed`.
///
/// # Safety
///
/// `data` must be the start of a live mapping of `len` bytes belonging to
/// the same segment as `state`.
pub unsafe fn purge_pages(
    state: &SharedState,
    data: NonNull<u8>,
    len: usize,
    believed: ClockTime,
) -> PurgeOutcome {
    let expected = StateWord::new(LockState::Unlocked, believed);
    let purged = StateWord::new(LockState::Unlocked, ClockTime::NULL);
    if let Err(observed) = state.compare_exchange(expected, purged) {
        return match observed.lock_state() {
            LockState::Locked => PurgeOutcome::Locked,
            LockState::Unlocked => PurgeOutcome::UsedSince(observed.timestamp()),
        };
    }

    if len > 0 {
        // SAFETY: Caller guarantees `data..data + len` is mapped.
        if let Err(e) = unsafe { rustix::mm::madvise(data.as_ptr().cast(), len, PURGE_ADVICE) } {
            // The word already says purged; nobody may read the pages again.
            tracing::warn!(error = %e, len, "failed to release purged pages");
        }
    }
    PurgeOutcome::Purged
}

/// Release the backing storage past the first `keep` bytes.
///
/// The storage is shrunk to `keep` and grown back, so mappings stay valid
/// and the released pages read back as zeros. Returns false when the handle
/// is closed or the platform refuses.
pub fn truncate(shm: &SharedMemory, keep: usize) -> bool {
    let result = shm.storage_size().and_then(|size| {
        shm.set_storage_size(keep as u64)?;
        shm.set_storage_size(size)
    });
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "unable to truncate segment storage");
            false
        }
    }
}

/// Point-in-time residency query.
pub fn is_resident(state: &SharedState) -> bool {
    state.load().is_resident()
}
