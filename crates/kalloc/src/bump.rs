//! Bootstrap placement allocator.
//!
//! Before paging is up and the arena exists, the kernel still needs memory
//! for page directories, descriptor tables and other bring-up structures.
//! This allocator hands it out by bumping a cursor that starts just past the
//! kernel image, inside the identity-mapped boot region, where virtual and
//! physical addresses coincide.
//!
//! Nothing allocated here is ever reclaimed; there is no release operation.
//! Running the cursor past the end of the boot region is fatal, since no
//! recovery is possible this early.

use crate::Align as _;

/// Monotonic bump allocator for the pre-heap phase.
#[derive(Debug)]
pub struct BumpAllocator {
    cursor: usize,
    end: usize,
}

impl BumpAllocator {
    /// Creates a bump allocator over the identity-mapped region
    /// `[start, end)`.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        assert!(start <= end);
        Self { cursor: start, end }
    }

    /// Allocates `size` bytes and returns their address, which is also the
    /// physical address.
    ///
    /// With `page_align` the cursor is first rounded up to the next page
    /// boundary, so the returned address is page-aligned.
    ///
    /// # Panics
    ///
    /// Panics when the allocation would run past the end of the boot
    /// region.
    pub fn allocate(&mut self, size: usize, page_align: bool) -> usize {
        if page_align {
            self.cursor = self.cursor.page_align_up();
        }
        let addr = self.cursor;
        let next = addr.checked_add(size).filter(|&next| next <= self.end);
        self.cursor = next.unwrap_or_else(|| {
            panic!("bootstrap allocator exhausted: {size} bytes past {addr:#x}")
        });
        addr
    }

    /// Current cursor position; the next unaligned allocation starts here.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn test_cursor_advances_monotonically() {
        let mut bump = BumpAllocator::new(0x10_0000, 0x20_0000);
        let a = bump.allocate(24, false);
        let b = bump.allocate(100, false);
        assert_eq!(a, 0x10_0000);
        assert_eq!(b, a + 24);
        assert_eq!(bump.cursor(), b + 100);
    }

    #[test]
    fn test_page_alignment_rounds_cursor_up() {
        let mut bump = BumpAllocator::new(0x10_0000, 0x20_0000);
        // An already aligned cursor is left in place.
        let a = bump.allocate(PAGE_SIZE, true);
        assert_eq!(a, 0x10_0000);
        bump.allocate(24, false);
        let b = bump.allocate(64, true);
        assert_eq!(b, 0x10_2000);
    }

    #[test]
    #[should_panic(expected = "bootstrap allocator exhausted")]
    fn test_exhaustion_is_fatal() {
        let mut bump = BumpAllocator::new(0x10_0000, 0x10_0040);
        bump.allocate(32, false);
        bump.allocate(64, false);
    }
}
