//! Page size and page-alignment helpers.

/// The platform page size in bytes.
#[inline]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Round `size` up to the next multiple of the page size.
///
/// Returns `None` on overflow.
#[inline]
pub fn align_to_page(size: usize) -> Option<usize> {
    let page = page_size();
    size.checked_add(page - 1).map(|s| s & !(page - 1))
}

/// Whether `value` is a multiple of the page size.
#[inline]
pub fn is_page_aligned(value: usize) -> bool {
    value & (page_size() - 1) == 0
}

/// Number of pages covered by `len` bytes, rounding up.
#[inline]
pub fn page_count(len: usize) -> usize {
    len.div_ceil(page_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 4096);
    }

    #[test]
    fn test_align_to_page() {
        let page = page_size();
        assert_eq!(align_to_page(0), Some(0));
        assert_eq!(align_to_page(1), Some(page));
        assert_eq!(align_to_page(page), Some(page));
        assert_eq!(align_to_page(page + 1), Some(2 * page));
        assert_eq!(align_to_page(usize::MAX), None);
    }

    #[test]
    fn test_page_alignment_and_count() {
        let page = page_size();
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(3 * page));
        assert!(!is_page_aligned(page / 2));

        assert_eq!(page_count(0), 0);
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(8 * page), 8);
    }
}
