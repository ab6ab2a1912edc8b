//! Boundary-tag arena allocator.
//!
//! This module provides the kernel heap proper: a single growable arena of
//! variable-size blocks with `malloc`/`free`/`realloc` semantics. The arena
//! asks a [`GrowthProvider`] for fresh memory when no free block fits and
//! never returns memory to the provider.
//!
//! # Algorithm
//!
//! The allocator uses **best-fit** search over an **unordered intrusive free
//! list**, with **immediate coalescing** on release:
//!
//! - **Boundary tags**: every block stores its size field twice, in a header
//!   word and an identical footer word. The word immediately before a header
//!   is the previous block's footer, so both physical neighbors can be
//!   located without an external index.
//! - **Free list**: free blocks form a doubly-linked list threaded through
//!   their payload bytes. The list is unordered; membership is exactly the
//!   set of blocks whose free bit is set.
//! - **Allocation**: one pass over the free list picks the smallest block
//!   that fits (first seen wins ties). The block is split when the remainder
//!   is large enough to stand alone; a remainder bordering a free block is
//!   merged into it so no two free neighbors ever exist.
//! - **Release**: the freed block is merged with whichever physical
//!   neighbors are free, in a single four-way branch.
//! - **Resize**: growth first tries to absorb a free neighbor in place
//!   (forward, then backward with a payload move) and only then relocates;
//!   shrinking splits off the tail of the block as a new free block.
//!
//! # Memory Layout
//!
//! The arena is addressed by byte offsets from a fixed base pointer; every
//! header and footer access is a bounds-checked word access against the
//! mapped high-water mark. The first header sits one word before the first
//! 16-byte boundary so that every payload is 16-byte aligned.
//!
//! ```text
//! offset:  8                                    curr
//!          ┌──────┬─────────────┬──────┬ ─ ─ ─ ─ ┐
//!          │ hdr  │ payload     │ ftr  │ ...
//!          └──────┴─────────────┴──────┴ ─ ─ ─ ─ ┘
//!                 └─ 16-byte aligned
//!
//! free block payload:
//!          ┌────────────┬────────────┬───────────┐
//!          │ next: word │ prev: word │ unused    │
//!          └────────────┴────────────┴───────────┘
//! ```
//!
//! # Fatal conditions
//!
//! Growth-provider exhaustion, double release and boundary-tag corruption
//! all panic; the kernel has no recovery path for a broken heap. Zero-size
//! allocation and `resize(ptr, 0)` are the only soft edges: the former
//! returns `None`, the latter behaves as a release.
//!
//! # Thread Safety
//!
//! [`Arena`] is `Send` but not `Sync`. Every operation mutates the block
//! structure through several non-atomic writes; the caller must provide
//! mutual exclusion around every call.

use core::ptr::{self, NonNull};

use crate::{Align as _, GrowthProvider, PAGE_SIZE};

const WORD: usize = size_of::<usize>();
const HEADER_SIZE: usize = WORD;
const FOOTER_SIZE: usize = WORD;

/// Byte cost of the header/footer pair, not available to callers.
pub const OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Payload sizes are rounded up to this granularity, which is also the
/// guaranteed payload alignment.
pub const GRANULE: usize = 16;

/// Smallest payload a free block may have. Together with the 16-byte
/// granularity this guarantees room for the two free-list link words.
const MIN_PAYLOAD: usize = 8;

/// Offset of the first block header: one header before the first granule
/// boundary, so payloads land 16-byte aligned.
const FIRST_BLOCK: usize = GRANULE - HEADER_SIZE;

/// Free-list nil sentinel. Offset 0 is a valid (padding) offset, so the
/// all-ones pattern marks the end of the list instead.
const NIL: usize = usize::MAX;

const _: () = assert!(2 * WORD <= GRANULE, "link words must fit a minimal free payload");
const _: () = assert!(FIRST_BLOCK.is_multiple_of(WORD));

/// Point-in-time heap usage counters, as reported by [`Arena::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes the arena has carved into blocks (headers and footers
    /// included).
    pub heap_bytes: usize,
    /// Payload bytes of allocated blocks.
    pub used_bytes: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    /// Total number of blocks.
    pub block_count: usize,
    /// Number of free blocks.
    pub free_block_count: usize,
}

/// The boundary-tag heap manager.
///
/// An [`Arena`] owns the byte range `[base, base + curr)`, growable up to
/// `limit` bytes through its [`GrowthProvider`]. All internal addressing is
/// done with byte offsets from `base`; payload pointers are materialized
/// only at the public API boundary.
pub struct Arena<P> {
    provider: P,
    base: NonNull<u8>,
    /// One past the last mapped byte, as an offset from `base`.
    curr: usize,
    /// Maximum value `curr` may reach.
    limit: usize,
    /// Offset of the lowest block header. Set once, never moves.
    head: Option<usize>,
    /// Offset of the highest block header.
    tail: Option<usize>,
    /// Offset of the first free-list entry, `NIL` when the list is empty.
    free_head: usize,
}

unsafe impl<P> Send for Arena<P> where P: Send {}

impl<P> Arena<P>
where
    P: GrowthProvider,
{
    /// Creates an empty arena over the region starting at `base`.
    ///
    /// No blocks exist until the first allocation grows the arena through
    /// `provider`. `limit` bounds how far the arena may grow, in bytes from
    /// `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page-aligned. Page alignment makes every
    /// payload 16-byte aligned and lets page-aligned interior pointers be
    /// told apart from ordinary payload pointers on release.
    #[must_use]
    pub fn new(base: NonNull<u8>, limit: usize, provider: P) -> Self {
        assert!(
            base.addr().get().is_page_aligned(),
            "arena base must be page-aligned"
        );
        Self {
            provider,
            base,
            curr: 0,
            limit,
            head: None,
            tail: None,
            free_head: NIL,
        }
    }

    /// Returns the growth provider, for address translation.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Allocates `size` bytes and returns the payload pointer, 16-byte
    /// aligned.
    ///
    /// Returns `None` only for `size == 0`. When no free block fits, the
    /// arena grows; growth failure is fatal.
    ///
    /// # Panics
    ///
    /// Panics if the provider cannot extend the arena or the arena would
    /// outgrow its limit.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let rounded = size.align_up(GRANULE);
        let block = match self.best_fit(rounded) {
            Some(block) => {
                self.carve(block, rounded);
                block
            }
            None => self.grow(rounded + OVERHEAD),
        };
        self.debug_verify();
        Some(self.payload_ptr(block))
    }

    /// Releases an allocated block, merging it with any free physical
    /// neighbor.
    ///
    /// `ptr` is either the payload pointer returned by
    /// [`allocate`](Self::allocate)/[`resize`](Self::resize), or a
    /// page-aligned interior pointer (as handed out by the facade's
    /// page-aligned allocation service), which is resolved to its
    /// containing block.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not belong to the arena or the block is already
    /// free (double free).
    pub fn release(&mut self, ptr: NonNull<u8>) {
        let block = self.resolve(ptr);
        assert!(
            !self.is_free(block),
            "double free of heap block at offset {block:#x}"
        );
        self.free_block(block);
        self.debug_verify();
    }

    /// Resizes an allocated block to `new_size` bytes.
    ///
    /// Growth tries, in order: absorbing the next physical block when it is
    /// free (pointer unchanged), absorbing the previous one (payload moves
    /// down), and relocating to a fresh allocation. Shrinking splits off the
    /// reclaimable tail as a new free block and never moves the payload;
    /// remainders too small to stand alone are left in place.
    ///
    /// `resize(ptr, 0)` behaves as [`release`](Self::release) and returns
    /// `None`. In every other case the payload's first
    /// `min(old_size, new_size)` bytes are preserved.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not belong to the arena, the block is not
    /// allocated, or relocation hits growth exhaustion.
    pub fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 {
            self.release(ptr);
            return None;
        }
        let block = self.resolve(ptr);
        assert!(
            !self.is_free(block),
            "resize of heap block at offset {block:#x} that is not allocated"
        );
        let usable = self.block_usable(block);
        let rounded = new_size.align_up(GRANULE);
        let block = if rounded > usable {
            self.grow_block(block, rounded, new_size)
        } else {
            if rounded < usable {
                self.shrink_block(block, rounded);
            }
            block
        };
        self.debug_verify();
        Some(self.payload_ptr(block))
    }

    /// Returns the usable payload size recorded for an allocated block.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not belong to the arena.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let block = self.resolve(ptr);
        self.block_usable(block)
    }

    /// Walks all blocks and computes usage counters.
    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            heap_bytes: self.curr.saturating_sub(FIRST_BLOCK),
            used_bytes: 0,
            free_bytes: 0,
            block_count: 0,
            free_block_count: 0,
        };
        let mut cursor = self.head;
        while let Some(block) = cursor {
            let usable = self.block_usable(block);
            stats.block_count += 1;
            if self.is_free(block) {
                stats.free_block_count += 1;
                stats.free_bytes += usable;
            } else {
                stats.used_bytes += usable;
            }
            cursor = self.next_block(block);
        }
        stats
    }

    /// Checks every structural invariant of the arena.
    ///
    /// Verified between any two public calls: header and footer of every
    /// block agree; the blocks exactly partition the arena bytes from the
    /// first header to the high-water mark; no two physically adjacent
    /// blocks are both free; free-list membership is exactly the set of
    /// blocks with the free bit set.
    ///
    /// # Panics
    ///
    /// Panics on the first violation found.
    pub fn verify(&self) {
        let mut expected = FIRST_BLOCK;
        let mut prev_free = false;
        let mut free_blocks = 0;
        let mut cursor = self.head;
        if cursor.is_some() {
            assert_eq!(cursor, Some(FIRST_BLOCK), "head block moved");
        } else {
            assert_eq!(self.curr, 0, "mapped bytes without any block");
        }
        while let Some(block) = cursor {
            assert_eq!(block, expected, "gap or overlap between blocks");
            let field = self.word(block);
            let usable = field & !1;
            assert!(usable.is_multiple_of(GRANULE), "usable size off granularity");
            assert_eq!(
                field,
                self.word(block + HEADER_SIZE + usable),
                "boundary tag mismatch at offset {block:#x}"
            );
            let free = self.is_free(block);
            assert!(!(prev_free && free), "adjacent free blocks at offset {block:#x}");
            if free {
                free_blocks += 1;
            }
            prev_free = free;
            expected = block + OVERHEAD + usable;
            cursor = self.next_block(block);
            if cursor.is_none() {
                assert_eq!(self.tail, Some(block), "tail does not name the last block");
            }
        }
        if self.head.is_some() {
            assert_eq!(expected, self.curr, "blocks do not account for every mapped byte");
        }

        let mut listed = 0;
        let mut entry = self.free_head;
        let mut back = NIL;
        while entry != NIL {
            assert!(self.is_free(entry), "allocated block on the free list");
            assert_eq!(self.link_prev(entry), back, "free-list back link broken");
            back = entry;
            entry = self.link_next(entry);
            listed += 1;
            assert!(listed <= free_blocks, "free list longer than the free block set");
        }
        assert_eq!(listed, free_blocks, "free block missing from the free list");
    }

    #[cfg(debug_assertions)]
    fn debug_verify(&self) {
        self.verify();
    }

    #[cfg(not(debug_assertions))]
    fn debug_verify(&self) {}

    /// One pass over the free list for the smallest block with
    /// `usable >= rounded`; the first candidate seen wins ties.
    fn best_fit(&self, rounded: usize) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut entry = self.free_head;
        while entry != NIL {
            let usable = self.block_usable(entry);
            if usable >= rounded && best.is_none_or(|b| usable < self.block_usable(b)) {
                best = Some(entry);
            }
            entry = self.link_next(entry);
        }
        best
    }

    /// Turns the free block at `block` into an allocated block of `rounded`
    /// payload bytes, splitting off the remainder when it is viable.
    fn carve(&mut self, block: usize, rounded: usize) {
        let usable = self.block_usable(block);
        let following = self.next_block(block);
        self.unlink_free(block);
        let rest = usable - rounded;
        if rest < MIN_PAYLOAD + OVERHEAD {
            // Too small to stand alone; hand the whole block out.
            self.write_tags(block, usable, false);
            return;
        }
        self.write_tags(block, rounded, false);
        self.split_remainder(block, rounded, rest, following);
    }

    /// Makes a free block out of the `rest` bytes following the newly sized
    /// block at `block`, merging with `following` when that neighbor is
    /// free so invariant 3 survives the split.
    ///
    /// `following` is the physical successor as it stood before `block` was
    /// re-tagged.
    fn split_remainder(
        &mut self,
        block: usize,
        rounded: usize,
        rest: usize,
        following: Option<usize>,
    ) {
        let remainder = block + OVERHEAD + rounded;
        match following {
            Some(next) if self.is_free(next) => {
                self.unlink_free(next);
                self.write_tags(remainder, rest + self.block_usable(next), true);
                if self.tail == Some(next) {
                    self.tail = Some(remainder);
                }
            }
            _ => {
                self.write_tags(remainder, rest - OVERHEAD, true);
                if self.tail == Some(block) {
                    self.tail = Some(remainder);
                }
            }
        }
        self.push_free(remainder);
    }

    /// Appends a fresh allocated block of `block_size` total bytes at the
    /// high-water mark.
    fn grow(&mut self, block_size: usize) -> usize {
        let block = if self.head.is_none() { FIRST_BLOCK } else { self.curr };
        let target = block + block_size;
        assert!(
            target <= self.limit,
            "kernel heap exhausted: {target:#x} bytes needed, limit {:#x}",
            self.limit
        );
        let grow_by = target - self.curr;
        let region = self
            .provider
            .extend(grow_by)
            .unwrap_or_else(|| panic!("kernel heap exhausted: cannot map {grow_by} more bytes"));
        debug_assert_eq!(
            region.addr().get() - self.base.addr().get(),
            self.curr,
            "provider grew non-contiguously"
        );
        self.curr = target;
        if self.head.is_none() {
            self.head = Some(block);
        }
        self.tail = Some(block);
        self.write_tags(block, block_size - OVERHEAD, false);
        block
    }

    /// Marks `block` free, coalescing with free physical neighbors.
    fn free_block(&mut self, block: usize) {
        let prev = self.prev_block(block).filter(|&p| self.is_free(p));
        let next = self.next_block(block).filter(|&n| self.is_free(n));
        let usable = self.block_usable(block);
        match (prev, next) {
            (Some(prev), Some(next)) => {
                let merged =
                    self.block_usable(prev) + usable + self.block_usable(next) + 2 * OVERHEAD;
                self.unlink_free(next);
                self.write_tags(prev, merged, true);
                if self.tail == Some(next) {
                    self.tail = Some(prev);
                }
            }
            (Some(prev), None) => {
                let merged = self.block_usable(prev) + OVERHEAD + usable;
                self.write_tags(prev, merged, true);
                if self.tail == Some(block) {
                    self.tail = Some(prev);
                }
            }
            (None, Some(next)) => {
                let merged = usable + OVERHEAD + self.block_usable(next);
                self.unlink_free(next);
                self.write_tags(block, merged, true);
                if self.tail == Some(next) {
                    self.tail = Some(block);
                }
                self.push_free(block);
            }
            (None, None) => {
                self.write_tags(block, usable, true);
                self.push_free(block);
            }
        }
    }

    /// Grows the allocated block at `block` to at least `rounded` payload
    /// bytes, returning the (possibly new) block offset.
    fn grow_block(&mut self, block: usize, rounded: usize, new_size: usize) -> usize {
        let usable = self.block_usable(block);

        // Absorb the next physical block in place; the payload stays put.
        if let Some(next) = self.next_block(block).filter(|&n| self.is_free(n))
            && usable + OVERHEAD + self.block_usable(next) >= rounded
        {
            let merged = usable + OVERHEAD + self.block_usable(next);
            self.unlink_free(next);
            self.write_tags(block, merged, false);
            if self.tail == Some(next) {
                self.tail = Some(block);
            }
            return block;
        }

        // Absorb the previous physical block; the payload slides down to
        // the merged block's start. The ranges may overlap.
        if let Some(prev) = self.prev_block(block).filter(|&p| self.is_free(p))
            && usable + OVERHEAD + self.block_usable(prev) >= rounded
        {
            let merged = usable + OVERHEAD + self.block_usable(prev);
            self.unlink_free(prev);
            self.write_tags(prev, merged, false);
            if self.tail == Some(block) {
                self.tail = Some(prev);
            }
            unsafe {
                let src = self.base.as_ptr().add(payload(block));
                let dst = self.base.as_ptr().add(payload(prev));
                ptr::copy(src, dst, usable);
            }
            return prev;
        }

        // Neither neighbor helps; relocate.
        let dest = self
            .allocate(new_size)
            .unwrap_or_else(|| unreachable!("new_size is non-zero"));
        let dest_block = dest.addr().get() - self.base.addr().get() - HEADER_SIZE;
        unsafe {
            let src = self.base.as_ptr().add(payload(block));
            ptr::copy_nonoverlapping(src, dest.as_ptr(), usable);
        }
        self.free_block(block);
        dest_block
    }

    /// Shrinks the allocated block at `block` to `rounded` payload bytes,
    /// returning the tail portion to the free list. A remainder too small
    /// to stand alone leaves the block untouched.
    fn shrink_block(&mut self, block: usize, rounded: usize) {
        let usable = self.block_usable(block);
        let rest = usable - rounded;
        if rest < MIN_PAYLOAD + OVERHEAD {
            return;
        }
        let following = self.next_block(block);
        self.write_tags(block, rounded, false);
        self.split_remainder(block, rounded, rest, following);
    }

    /// Maps a caller pointer back to its block header offset.
    ///
    /// Payload pointers are resolved directly through the word before them.
    /// Page-aligned pointers cannot be trusted to sit right after a header
    /// (the facade's page-aligned service returns interior pointers), so
    /// they are resolved by walking the blocks from `head` to the one
    /// containing the offset.
    fn resolve(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.addr().get();
        let base = self.base.addr().get();
        assert!(
            addr > base && addr - base < self.curr,
            "pointer {addr:#x} does not belong to the kernel heap"
        );
        let offset = addr - base;
        if offset.is_page_aligned() {
            return self.block_containing(offset);
        }
        assert!(
            offset >= FIRST_BLOCK + HEADER_SIZE && offset.is_multiple_of(GRANULE),
            "pointer {addr:#x} is not a heap payload pointer"
        );
        let block = offset - HEADER_SIZE;
        let usable = self.block_usable(block);
        assert!(
            block + OVERHEAD + usable <= self.curr,
            "corrupt size field at offset {block:#x}"
        );
        debug_assert_eq!(
            self.word(block),
            self.word(block + HEADER_SIZE + usable),
            "boundary tag mismatch at offset {block:#x}"
        );
        block
    }

    /// Linear walk for the allocated block whose payload contains `offset`.
    fn block_containing(&self, offset: usize) -> usize {
        let mut cursor = self.head;
        while let Some(block) = cursor {
            let start = payload(block);
            let end = start + self.block_usable(block);
            if (start..end).contains(&offset) {
                return block;
            }
            cursor = self.next_block(block);
        }
        panic!("pointer at offset {offset:#x} is not inside any heap block");
    }

    /// Physical predecessor of `block`, found through the footer word right
    /// before its header. The head block has none.
    fn prev_block(&self, block: usize) -> Option<usize> {
        if self.head == Some(block) {
            return None;
        }
        let prev_usable = self.word(block - FOOTER_SIZE) & !1;
        Some(block - OVERHEAD - prev_usable)
    }

    /// Physical successor of `block`. The tail block has none.
    fn next_block(&self, block: usize) -> Option<usize> {
        if self.tail == Some(block) {
            return None;
        }
        Some(block + OVERHEAD + self.block_usable(block))
    }

    /// Writes matching header and footer for a block of `usable` payload
    /// bytes, packing the free flag into bit 0 of both words.
    fn write_tags(&mut self, block: usize, usable: usize, free: bool) {
        debug_assert!(usable.is_multiple_of(GRANULE), "usable sizes keep the granularity");
        let field = usable | usize::from(free);
        self.set_word(block, field);
        self.set_word(block + HEADER_SIZE + usable, field);
    }

    fn block_usable(&self, block: usize) -> usize {
        self.word(block) & !1
    }

    fn is_free(&self, block: usize) -> bool {
        self.word(block) & 1 != 0
    }

    fn payload_ptr(&self, block: usize) -> NonNull<u8> {
        unsafe { self.base.add(payload(block)) }
    }

    // Free-list links live in the first two payload words of a free block.

    fn link_next(&self, block: usize) -> usize {
        self.word(payload(block))
    }

    fn link_prev(&self, block: usize) -> usize {
        self.word(payload(block) + WORD)
    }

    /// Pushes a free block onto the front of the free list.
    fn push_free(&mut self, block: usize) {
        self.set_word(payload(block), self.free_head);
        self.set_word(payload(block) + WORD, NIL);
        if self.free_head != NIL {
            self.set_word(payload(self.free_head) + WORD, block);
        }
        self.free_head = block;
    }

    /// Unlinks a block from the free list.
    fn unlink_free(&mut self, block: usize) {
        let next = self.link_next(block);
        let prev = self.link_prev(block);
        if prev == NIL {
            self.free_head = next;
        } else {
            self.set_word(payload(prev), next);
        }
        if next != NIL {
            self.set_word(payload(next) + WORD, prev);
        }
    }

    /// Bounds-checked word read at a byte offset from the arena base.
    #[expect(clippy::cast_ptr_alignment)]
    fn word(&self, offset: usize) -> usize {
        assert!(
            offset.is_multiple_of(WORD) && offset + WORD <= self.curr,
            "heap word read out of bounds at offset {offset:#x}"
        );
        unsafe { self.base.as_ptr().add(offset).cast::<usize>().read() }
    }

    /// Bounds-checked word write at a byte offset from the arena base.
    #[expect(clippy::cast_ptr_alignment)]
    fn set_word(&mut self, offset: usize, value: usize) {
        assert!(
            offset.is_multiple_of(WORD) && offset + WORD <= self.curr,
            "heap word write out of bounds at offset {offset:#x}"
        );
        unsafe { self.base.as_ptr().add(offset).cast::<usize>().write(value) }
    }
}

/// Payload offset of the block headed at `block`.
fn payload(block: usize) -> usize {
    block + HEADER_SIZE
}
