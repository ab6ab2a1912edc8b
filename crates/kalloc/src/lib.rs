//! Memory allocators backing the kernel heap.
//!
//! This crate provides the two allocators the kernel uses over its lifetime,
//! both `no_std` compatible and designed for bare-metal environments:
//!
//! # Available Allocators
//!
//! ## [`BumpAllocator`](bump::BumpAllocator)
//!
//! A monotonic placement allocator used during early bring-up, before paging
//! and the heap exist. Best suited for:
//!
//! - Allocations that live for the whole kernel lifetime (page directories,
//!   descriptor tables, boot-time buffers)
//! - The identity-mapped boot region, where virtual and physical addresses
//!   coincide
//!
//! **Performance**: O(1) allocation; memory is never reclaimed.
//!
//! ## [`Arena`](arena::Arena)
//!
//! A boundary-tag arena allocator with best-fit search and immediate
//! coalescing. This is the real heap: it backs every post-boot allocation and
//! supports release and in-place resizing. Best suited for:
//!
//! - Variable-sized allocations with unpredictable lifetimes
//! - Low per-block overhead (two words per block)
//!
//! **Performance**: O(n) allocation where n is the number of free blocks,
//! O(1) release, O(1) in-place resize.
//!
//! # Memory Layout
//!
//! The arena manages one contiguous, growable region. Every block carries a
//! one-word header and an identical one-word footer (the boundary tag), so a
//! block can locate both physical neighbors without an external index:
//!
//! ```text
//! Block Layout:
//! ┌────────────────┬───────────────────────────────┬────────────────┐
//! │ header: usize  │ payload (usable size bytes)   │ footer: usize  │
//! │ size | free    │ free: next/prev link words    │ size | free    │
//! └────────────────┴───────────────────────────────┴────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```rust
//! use core::{alloc::Layout, ptr::NonNull};
//!
//! use kalloc::{GrowthProvider, PAGE_SIZE, arena::Arena};
//!
//! // A provider backed by one preallocated buffer; a real kernel maps pages.
//! struct FixedRegion {
//!     base: NonNull<u8>,
//!     mapped: usize,
//!     capacity: usize,
//! }
//!
//! impl GrowthProvider for FixedRegion {
//!     fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
//!         if self.mapped + bytes > self.capacity {
//!             return None;
//!         }
//!         let start = self.mapped;
//!         self.mapped += bytes;
//!         Some(unsafe { self.base.add(start) })
//!     }
//!
//!     fn translate(&self, vaddr: usize) -> Option<usize> {
//!         Some(vaddr)
//!     }
//! }
//!
//! let layout = Layout::from_size_align(65536, PAGE_SIZE).unwrap();
//! let base = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
//! let region = FixedRegion { base, mapped: 0, capacity: layout.size() };
//!
//! let mut arena = Arena::new(base, layout.size(), region);
//! let ptr = arena.allocate(64).unwrap();
//! let ptr = arena.resize(ptr, 128).unwrap();
//! arena.release(ptr);
//!
//! unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
//! ```
//!
//! # Thread Safety
//!
//! The allocators are `Send` but not `Sync`. Every operation mutates the
//! block structure through several non-atomic writes, so the caller must
//! provide mutual exclusion (a spin lock, or disabled interrupts) around
//! every call.

#![cfg_attr(not(test), no_std)]

use core::ptr::NonNull;

pub mod arena;
pub mod bump;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// Source of fresh backing memory for the arena.
///
/// The provider owns the mapping machinery (page tables, frame allocation);
/// the arena only asks it to push the high-water mark forward. Successive
/// [`extend`](Self::extend) calls must return contiguous memory: each new
/// region starts exactly where the previous one ended.
pub trait GrowthProvider {
    /// Maps `bytes` additional bytes at the current high-water mark and
    /// returns a pointer to the start of the new region.
    ///
    /// Returns `None` on physical-memory or page-table exhaustion. The arena
    /// treats that as fatal; there is no retry path.
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>>;

    /// Resolves the physical address backing a mapped virtual address.
    fn translate(&self, vaddr: usize) -> Option<usize>;
}

pub trait Align: Sized {
    fn align_up(&self, align: usize) -> Self;
    fn align_down(&self, align: usize) -> Self;
    fn is_aligned(&self, align: usize) -> bool;

    fn page_align_up(&self) -> Self {
        self.align_up(PAGE_SIZE)
    }

    fn page_align_down(&self) -> Self {
        self.align_down(PAGE_SIZE)
    }

    fn is_page_aligned(&self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }
}

impl Align for usize {
    fn align_up(&self, align: usize) -> Self {
        self.next_multiple_of(align)
    }

    fn align_down(&self, align: usize) -> Self {
        self / align * align
    }

    fn is_aligned(&self, align: usize) -> bool {
        self.is_multiple_of(align)
    }
}
