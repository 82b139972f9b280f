//! The shared lock/usage word stored at the start of every segment.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ header page                                                  │
//! │ ┌──────────────────────────────────────────────────────────┐ │
//! │ │ state: AtomicU64                                         │ │
//! │ │   bit 63      lock state (1 = locked)                    │ │
//! │ │   bits 0..=62 last usage, nanoseconds (0 = null)         │ │
//! │ └──────────────────────────────────────────────────────────┘ │
//! ├──────────────────────────────────────────────────────────────┤
//! │ data pages (what `DiscardableSegment::memory` points at)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The word is the only state every process agrees on. A locked word always
//! carries a null timestamp. An unlocked word with a null timestamp means the
//! segment was purged.

use crate::clock::ClockTime;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

const LOCKED_BIT: u64 = 1 << 63;

/// Bytes reserved for the shared state, before page rounding.
pub const SHARED_STATE_SIZE: usize = std::mem::size_of::<SharedState>();

/// Whether some holder has the segment locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Eligible for purging.
    Unlocked,
    /// Protected from purging.
    Locked,
}

/// A decoded snapshot of the shared word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateWord(u64);

impl StateWord {
    /// Encode a lock state and timestamp.
    #[inline]
    pub fn new(lock: LockState, timestamp: ClockTime) -> Self {
        let bits = timestamp.nanos() & !LOCKED_BIT;
        match lock {
            LockState::Locked => Self(bits | LOCKED_BIT),
            LockState::Unlocked => Self(bits),
        }
    }

    /// The lock state.
    #[inline]
    pub fn lock_state(self) -> LockState {
        if self.0 & LOCKED_BIT != 0 {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }

    /// The last usage timestamp (null when locked or purged).
    #[inline]
    pub fn timestamp(self) -> ClockTime {
        ClockTime::from_nanos(self.0 & !LOCKED_BIT)
    }

    /// Whether the content behind this word is still backed.
    #[inline]
    pub fn is_resident(self) -> bool {
        self.lock_state() == LockState::Locked || !self.timestamp().is_null()
    }
}

/// The atomic word itself, living in shared memory.
#[repr(C, align(8))]
pub struct SharedState {
    value: AtomicU64,
}

impl SharedState {
    /// View the start of a mapping as the shared state.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live, 8-byte aligned mapping of at least
    /// [`SHARED_STATE_SIZE`] bytes that outlives `'a`.
    #[inline]
    pub unsafe fn from_ptr<'a>(ptr: NonNull<u8>) -> &'a SharedState {
        // SAFETY: Caller guarantees alignment, size and lifetime.
        unsafe { ptr.cast::<SharedState>().as_ref() }
    }

    /// Read the current word.
    #[inline]
    pub fn load(&self) -> StateWord {
        StateWord(self.value.load(Ordering::Acquire))
    }

    /// Overwrite the word. Only used when initializing fresh storage.
    #[inline]
    pub fn store(&self, word: StateWord) {
        self.value.store(word.0, Ordering::Release);
    }

    /// Replace `current` with `new` if nobody changed it.
    ///
    /// Returns the word that was observed, which equals `current` on success.
    #[inline]
    pub fn compare_exchange(&self, current: StateWord, new: StateWord) -> Result<StateWord, StateWord> {
        self.value
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(StateWord)
            .map_err(StateWord)
    }

    /// Apply `f` until it returns `None` or the swap lands.
    ///
    /// Returns the word the successful update started from, or the word that
    /// made `f` decline.
    #[inline]
    pub fn update(&self, mut f: impl FnMut(StateWord) -> Option<StateWord>) -> Result<StateWord, StateWord> {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                f(StateWord(raw)).map(|w| w.0)
            })
            .map(StateWord)
            .map_err(StateWord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_word_encoding() {
        let t = ClockTime::from_secs(42);

        let unlocked = StateWord::new(LockState::Unlocked, t);
        assert_eq!(unlocked.lock_state(), LockState::Unlocked);
        assert_eq!(unlocked.timestamp(), t);
        assert!(unlocked.is_resident());

        let locked = StateWord::new(LockState::Locked, ClockTime::NULL);
        assert_eq!(locked.lock_state(), LockState::Locked);
        assert!(locked.timestamp().is_null());
        assert!(locked.is_resident());

        let purged = StateWord::new(LockState::Unlocked, ClockTime::NULL);
        assert!(!purged.is_resident());
    }

    #[test]
    fn test_state_word_keeps_max_timestamp() {
        let word = StateWord::new(LockState::Unlocked, ClockTime::MAX);
        assert_eq!(word.lock_state(), LockState::Unlocked);
        assert_eq!(word.timestamp(), ClockTime::MAX);
    }

    #[test]
    fn test_shared_state_compare_exchange() {
        let state = SharedState {
            value: AtomicU64::new(0),
        };
        let t1 = ClockTime::from_secs(1);
        let t2 = ClockTime::from_secs(2);

        state.store(StateWord::new(LockState::Unlocked, t1));

        // Stale expectation is rejected and reports what was there.
        let stale = state.compare_exchange(
            StateWord::new(LockState::Unlocked, t2),
            StateWord::new(LockState::Locked, ClockTime::NULL),
        );
        assert_eq!(stale, Err(StateWord::new(LockState::Unlocked, t1)));

        let ok = state.compare_exchange(
            StateWord::new(LockState::Unlocked, t1),
            StateWord::new(LockState::Locked, ClockTime::NULL),
        );
        assert!(ok.is_ok());
        assert_eq!(state.load().lock_state(), LockState::Locked);
    }
}
