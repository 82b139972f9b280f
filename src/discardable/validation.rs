//! Debug-only tracking of exactly which pages are locked.
//!
//! In debug builds [`LockedPages`] remembers every locked page index and
//! panics when a range is locked twice or unlocked while not locked. In
//! release builds it is a zero-sized type whose methods compile to nothing.

use std::ops::Range;

#[cfg(debug_assertions)]
use std::collections::BTreeSet;

/// Set of locked page indices (debug builds only).
#[cfg(debug_assertions)]
#[derive(Debug, Default)]
pub struct LockedPages {
    pages: BTreeSet<usize>,
}

#[cfg(debug_assertions)]
impl LockedPages {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pages` as locked.
    ///
    /// # Panics
    ///
    /// Panics if any page in the range is already locked.
    pub fn lock(&mut self, pages: Range<usize>) {
        for page in pages {
            assert!(self.pages.insert(page), "page {page} is already locked");
        }
    }

    /// Record `pages` as unlocked.
    ///
    /// # Panics
    ///
    /// Panics if any page in the range is not locked.
    pub fn unlock(&mut self, pages: Range<usize>) {
        for page in pages {
            assert!(self.pages.remove(&page), "page {page} is not locked");
        }
    }

    /// Cross-check the instance's page counter.
    pub fn check_count(&self, locked_page_count: usize) {
        assert_eq!(
            self.pages.len(),
            locked_page_count,
            "locked page bookkeeping out of sync"
        );
    }
}

/// Set of locked page indices (compiled out).
#[cfg(not(debug_assertions))]
#[derive(Debug, Default)]
pub struct LockedPages;

#[cfg(not(debug_assertions))]
impl LockedPages {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn lock(&mut self, _pages: Range<usize>) {}

    #[inline(always)]
    pub fn unlock(&mut self, _pages: Range<usize>) {}

    #[inline(always)]
    pub fn check_count(&self, _locked_page_count: usize) {}
}

#[cfg(all(test, debug_assertions))]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock_disjoint_ranges() {
        let mut pages = LockedPages::new();
        pages.lock(0..2);
        pages.lock(2..4);
        pages.check_count(4);

        pages.unlock(0..2);
        pages.check_count(2);
        pages.lock(0..1);
        pages.check_count(3);
    }

    #[test]
    #[should_panic(expected = "page 1 is already locked")]
    fn test_double_lock_panics() {
        let mut pages = LockedPages::new();
        pages.lock(0..2);
        pages.lock(1..3);
    }

    #[test]
    #[should_panic(expected = "page 5 is not locked")]
    fn test_unlock_unlocked_panics() {
        let mut pages = LockedPages::new();
        pages.lock(0..5);
        pages.unlock(0..6);
    }

    #[test]
    #[should_panic(expected = "out of sync")]
    fn test_count_mismatch_panics() {
        let mut pages = LockedPages::new();
        pages.lock(0..3);
        pages.check_count(2);
    }
}
