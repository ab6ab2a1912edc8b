//! Kernel allocation facade.
//!
//! Every kernel allocation goes through [`Kheap`], which dispatches to one
//! of two allocators depending on the boot lifecycle phase:
//!
//! - **Boot phase**: a [`BumpAllocator`] over the identity-mapped boot
//!   region. Memory handed out here lives forever and the physical address
//!   of an allocation is the allocation's own address.
//! - **Heap phase**: after [`Kheap::init_heap`], the boundary-tag
//!   [`Arena`], which supports release and resizing and grows on demand
//!   through a [`GrowthProvider`].
//!
//! On top of the raw allocators the facade layers the services drivers and
//! subsystems actually ask for: zero-initialized allocation, page-aligned
//! allocation for DMA-capable buffers, and allocation that also reports the
//! backing physical address.
//!
//! # Lifecycle
//!
//! ```text
//! Kheap::new(bump) ──► Boot phase ──► init_heap(..) ──► Heap phase
//!                      allocate only                    full malloc/free/realloc
//! ```
//!
//! `release` and `resize` are valid only in the heap phase; bootstrap
//! memory is never tracked and can never be returned.
//!
//! # Thread Safety
//!
//! [`Kheap`] itself requires the caller to provide mutual exclusion around
//! every call (disabled interrupts, or a lock). [`SharedHeap`] wraps it in
//! a spin mutex for subsystems that need ambient shared access.

#![cfg_attr(not(test), no_std)]

use core::ptr::{self, NonNull};

use kalloc::{
    Align as _, GrowthProvider, PAGE_SIZE,
    arena::{Arena, ArenaStats},
    bump::BumpAllocator,
};
use log::{info, trace};
use snafu::{Snafu, ensure};

/// Errors from [`Kheap::init_heap`].
#[derive(Debug, Snafu)]
pub enum HeapInitError {
    #[snafu(display("heap base address {base:#x} is not page-aligned"))]
    UnalignedBase {
        base: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("heap region of {limit} bytes cannot hold a single block"))]
    RegionTooSmall {
        limit: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("heap is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

enum Phase<P> {
    Boot(BumpAllocator),
    Heap(Arena<P>),
}

/// The kernel's allocation entry point.
///
/// Owns whichever allocator is current for the boot lifecycle phase and
/// routes every request to it. One `Kheap` exists per kernel; pass it
/// explicitly, or park it in a [`SharedHeap`].
pub struct Kheap<P> {
    phase: Phase<P>,
}

impl<P> Kheap<P>
where
    P: GrowthProvider,
{
    /// Creates a facade in the boot phase, backed by `boot`.
    #[must_use]
    pub const fn new(boot: BumpAllocator) -> Self {
        Self {
            phase: Phase::Boot(boot),
        }
    }

    /// Switches from the bootstrap allocator to the arena.
    ///
    /// The arena starts empty over the region at `base` and may grow up to
    /// `limit` bytes through `provider`. Bootstrap memory handed out before
    /// this call stays allocated forever.
    pub fn init_heap(
        &mut self,
        base: NonNull<u8>,
        limit: usize,
        provider: P,
    ) -> Result<(), HeapInitError> {
        let addr = base.addr().get();
        ensure!(addr.is_page_aligned(), UnalignedBaseSnafu { base: addr });
        ensure!(limit >= PAGE_SIZE, RegionTooSmallSnafu { limit });
        ensure!(
            matches!(self.phase, Phase::Boot(_)),
            AlreadyInitializedSnafu
        );
        info!("kernel heap enabled at {addr:#x}, limit {limit:#x} bytes");
        self.phase = Phase::Heap(Arena::new(base, limit, provider));
        Ok(())
    }

    /// Allocates `size` bytes, 16-byte aligned.
    ///
    /// Returns `None` only for `size == 0`; exhaustion of either phase's
    /// memory is fatal.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        match &mut self.phase {
            Phase::Boot(bump) => boot_ptr(bump.allocate(size, false)),
            Phase::Heap(arena) => arena.allocate(size),
        }
    }

    /// Allocates `count * size` bytes and zero-fills them.
    ///
    /// # Panics
    ///
    /// Panics when `count * size` overflows.
    pub fn zeroed_allocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count
            .checked_mul(size)
            .unwrap_or_else(|| panic!("zeroed allocation overflows: {count} * {size}"));
        let ptr = self.allocate(total)?;
        unsafe {
            ptr.as_ptr().write_bytes(0, total);
        }
        Some(ptr)
    }

    /// Allocates `size` bytes and reports the backing physical address.
    ///
    /// In the boot phase the region is identity-mapped, so the physical
    /// address is the returned address itself; in the heap phase it comes
    /// from the growth provider's translation.
    pub fn allocate_phys(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
        if size == 0 {
            return None;
        }
        match &mut self.phase {
            Phase::Boot(bump) => {
                let addr = bump.allocate(size, false);
                Some((boot_ptr(addr)?, addr))
            }
            Phase::Heap(arena) => {
                let ptr = arena.allocate(size)?;
                let phys = translate(arena, ptr.addr().get());
                Some((ptr, phys))
            }
        }
    }

    /// Allocates `size` bytes at a page-aligned address and reports the
    /// backing physical address, for DMA-capable buffers.
    ///
    /// In the heap phase the arena over-allocates by one page, so a
    /// page-aligned address always exists inside the block; the returned
    /// interior pointer can be passed to [`release`](Self::release), which
    /// resolves it back to its containing block.
    pub fn aligned_allocate(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
        if size == 0 {
            return None;
        }
        match &mut self.phase {
            Phase::Boot(bump) => {
                let addr = bump.allocate(size, true);
                Some((boot_ptr(addr)?, addr))
            }
            Phase::Heap(arena) => {
                let ptr = arena.allocate(size + PAGE_SIZE)?;
                let aligned = ptr.addr().get().align_down(PAGE_SIZE) + PAGE_SIZE;
                let aligned_ptr = unsafe { ptr.add(aligned - ptr.addr().get()) };
                let phys = translate(arena, aligned);
                trace!("page-aligned allocation of {size} bytes at {aligned:#x} (phys {phys:#x})");
                Some((aligned_ptr, phys))
            }
        }
    }

    /// Releases a heap allocation.
    ///
    /// # Panics
    ///
    /// Panics in the boot phase (bootstrap memory is untracked), on double
    /// free, and on pointers that do not belong to the heap.
    pub fn release(&mut self, ptr: NonNull<u8>) {
        match &mut self.phase {
            Phase::Boot(_) => panic!("release before the heap is initialized"),
            Phase::Heap(arena) => arena.release(ptr),
        }
    }

    /// Resizes a heap allocation, preserving the payload prefix.
    ///
    /// `resize(ptr, 0)` releases the block and returns `None`.
    ///
    /// # Panics
    ///
    /// Panics in the boot phase (bootstrap memory is untracked).
    pub fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        match &mut self.phase {
            Phase::Boot(_) => panic!("resize before the heap is initialized"),
            Phase::Heap(arena) => arena.resize(ptr, new_size),
        }
    }

    /// Arena usage counters; `None` while still in the boot phase.
    pub fn heap_stats(&self) -> Option<ArenaStats> {
        match &self.phase {
            Phase::Boot(_) => None,
            Phase::Heap(arena) => Some(arena.stats()),
        }
    }
}

/// Shared, spin-locked facade for subsystems without a `&mut Kheap` path.
///
/// The lock provides the mutual exclusion [`Kheap`] requires of its caller.
/// Interrupt handlers must not allocate through this while the lock could
/// be held on the same CPU.
pub struct SharedHeap<P> {
    inner: spin::Mutex<Kheap<P>>,
}

impl<P> SharedHeap<P>
where
    P: GrowthProvider,
{
    #[must_use]
    pub const fn new(boot: BumpAllocator) -> Self {
        Self {
            inner: spin::Mutex::new(Kheap::new(boot)),
        }
    }

    pub fn init_heap(
        &self,
        base: NonNull<u8>,
        limit: usize,
        provider: P,
    ) -> Result<(), HeapInitError> {
        self.inner.lock().init_heap(base, limit, provider)
    }

    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.lock().allocate(size)
    }

    pub fn zeroed_allocate(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.inner.lock().zeroed_allocate(count, size)
    }

    pub fn allocate_phys(&self, size: usize) -> Option<(NonNull<u8>, usize)> {
        self.inner.lock().allocate_phys(size)
    }

    pub fn aligned_allocate(&self, size: usize) -> Option<(NonNull<u8>, usize)> {
        self.inner.lock().aligned_allocate(size)
    }

    pub fn release(&self, ptr: NonNull<u8>) {
        self.inner.lock().release(ptr)
    }

    pub fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        self.inner.lock().resize(ptr, new_size)
    }
}

/// Materializes a bootstrap cursor address as a pointer. The boot region is
/// identity-mapped and starts well above address zero.
fn boot_ptr(addr: usize) -> Option<NonNull<u8>> {
    NonNull::new(ptr::with_exposed_provenance_mut(addr))
}

fn translate<P>(arena: &Arena<P>, vaddr: usize) -> usize
where
    P: GrowthProvider,
{
    arena
        .provider()
        .translate(vaddr)
        .unwrap_or_else(|| panic!("heap address {vaddr:#x} has no physical mapping"))
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use core::alloc::Layout;

    use super::*;
    use kalloc::Align as _;

    const PHYS_OFFSET: usize = 0x8000_0000;

    struct TestRegion {
        base: *mut u8,
        capacity: usize,
        mapped: usize,
    }

    impl GrowthProvider for TestRegion {
        fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
            if self.mapped + bytes > self.capacity {
                return None;
            }
            let start = self.mapped;
            self.mapped += bytes;
            NonNull::new(unsafe { self.base.add(start) })
        }

        fn translate(&self, vaddr: usize) -> Option<usize> {
            let offset = vaddr.checked_sub(self.base.addr())?;
            (offset < self.capacity).then(|| PHYS_OFFSET + offset)
        }
    }

    fn with_test_buffer<F>(capacity: usize, test_fn: F)
    where
        F: FnOnce(NonNull<u8>, usize),
    {
        unsafe {
            let layout = Layout::from_size_align(capacity, PAGE_SIZE).unwrap();
            let buf = alloc::alloc::alloc(layout);
            buf.write_bytes(0x11, capacity);
            test_fn(NonNull::new(buf).unwrap(), capacity);
            alloc::alloc::dealloc(buf, layout);
        }
    }

    /// A facade already switched to the heap phase over a fresh buffer.
    fn with_test_heap<F>(capacity: usize, test_fn: F)
    where
        F: FnOnce(&mut Kheap<TestRegion>),
    {
        with_test_buffer(capacity, |base, capacity| {
            let region = TestRegion {
                base: base.as_ptr(),
                capacity,
                mapped: 0,
            };
            let mut heap = Kheap::new(BumpAllocator::new(0x10_0000, 0x20_0000));
            heap.init_heap(base, capacity, region).unwrap();
            test_fn(&mut heap);
        });
    }

    #[test]
    fn test_boot_phase_allocates_from_identity_mapped_region() {
        with_test_buffer(1 << 16, |base, capacity| {
            let start = base.as_ptr().expose_provenance();
            let mut heap = Kheap::<TestRegion>::new(BumpAllocator::new(start, start + capacity));

            let ptr = heap.allocate(64).unwrap();
            assert_eq!(ptr.addr().get(), start);
            unsafe {
                ptr.as_ptr().write_bytes(0xAB, 64);
            }

            // Identity mapping: the physical address is the address itself.
            let (ptr, phys) = heap.allocate_phys(32).unwrap();
            assert_eq!(phys, ptr.addr().get());

            let (ptr, phys) = heap.aligned_allocate(128).unwrap();
            assert!(ptr.addr().get().is_page_aligned());
            assert_eq!(phys, ptr.addr().get());
        });
    }

    #[test]
    #[should_panic(expected = "release before the heap is initialized")]
    fn test_boot_phase_release_panics() {
        let mut heap = Kheap::<TestRegion>::new(BumpAllocator::new(0x10_0000, 0x20_0000));
        let ptr = heap.allocate(16).unwrap();
        heap.release(ptr);
    }

    #[test]
    fn test_init_heap_rejects_unaligned_base() {
        with_test_buffer(1 << 16, |base, capacity| {
            let region = TestRegion {
                base: base.as_ptr(),
                capacity,
                mapped: 0,
            };
            let mut heap = Kheap::new(BumpAllocator::new(0x10_0000, 0x20_0000));
            let unaligned = unsafe { base.add(8) };
            assert!(matches!(
                heap.init_heap(unaligned, capacity - 8, region),
                Err(HeapInitError::UnalignedBase { .. })
            ));
        });
    }

    #[test]
    fn test_init_heap_rejects_double_init() {
        with_test_buffer(1 << 16, |base, capacity| {
            let make_region = |base: NonNull<u8>| TestRegion {
                base: base.as_ptr(),
                capacity,
                mapped: 0,
            };
            let mut heap = Kheap::new(BumpAllocator::new(0x10_0000, 0x20_0000));
            heap.init_heap(base, capacity, make_region(base)).unwrap();
            assert!(matches!(
                heap.init_heap(base, capacity, make_region(base)),
                Err(HeapInitError::AlreadyInitialized { .. })
            ));
        });
    }

    #[test]
    fn test_init_heap_rejects_tiny_region() {
        with_test_buffer(1 << 16, |base, capacity| {
            let region = TestRegion {
                base: base.as_ptr(),
                capacity,
                mapped: 0,
            };
            let mut heap = Kheap::new(BumpAllocator::new(0x10_0000, 0x20_0000));
            assert!(matches!(
                heap.init_heap(base, 64, region),
                Err(HeapInitError::RegionTooSmall { .. })
            ));
        });
    }

    #[test]
    fn test_heap_phase_allocate_release_cycle() {
        with_test_heap(1 << 16, |heap| {
            let a = heap.allocate(64).unwrap();
            let b = heap.allocate(64).unwrap();
            heap.release(a);
            let c = heap.allocate(64).unwrap();
            assert_eq!(c, a, "freed slot must be reused");
            heap.release(b);
            heap.release(c);
            assert_eq!(heap.heap_stats().unwrap().used_bytes, 0);
        });
    }

    #[test]
    fn test_zeroed_allocate_clears_recycled_memory() {
        with_test_heap(1 << 16, |heap| {
            let dirty = heap.allocate(256).unwrap();
            unsafe {
                dirty.as_ptr().write_bytes(0xFF, 256);
            }
            heap.release(dirty);

            let ptr = heap.zeroed_allocate(16, 16).unwrap();
            assert_eq!(ptr, dirty, "should recycle the dirtied block");
            for i in 0..256 {
                assert_eq!(unsafe { ptr.as_ptr().add(i).read() }, 0);
            }
            heap.release(ptr);
        });
    }

    #[test]
    #[should_panic(expected = "zeroed allocation overflows")]
    fn test_zeroed_allocate_overflow_panics() {
        with_test_heap(1 << 16, |heap| {
            let _ptr = heap.zeroed_allocate(usize::MAX, 2);
        });
    }

    #[test]
    fn test_allocate_phys_reports_translation() {
        with_test_heap(1 << 16, |heap| {
            let (ptr, phys) = heap.allocate_phys(64).unwrap();
            // First allocation: payload sits 16 bytes into the region.
            assert_eq!(phys, PHYS_OFFSET + 16);
            heap.release(ptr);
        });
    }

    #[test]
    fn test_aligned_allocate_returns_releasable_interior_pointer() {
        with_test_heap(1 << 16, |heap| {
            let (ptr, phys) = heap.aligned_allocate(256).unwrap();
            assert!(ptr.addr().get().is_page_aligned());
            unsafe {
                ptr.as_ptr().write_bytes(0xC3, 256);
            }
            let offset = phys - PHYS_OFFSET;
            assert!(offset.is_page_aligned());

            heap.release(ptr);
            assert_eq!(heap.heap_stats().unwrap().used_bytes, 0);
        });
    }

    #[test]
    fn test_resize_through_facade_preserves_data() {
        with_test_heap(1 << 16, |heap| {
            let ptr = heap.allocate(40).unwrap();
            unsafe {
                ptr.as_ptr().write_bytes(0x6E, 40);
            }
            let ptr = heap.resize(ptr, 400).unwrap();
            for i in 0..40 {
                assert_eq!(unsafe { ptr.as_ptr().add(i).read() }, 0x6E);
            }
            assert!(heap.resize(ptr, 0).is_none());
            assert_eq!(heap.heap_stats().unwrap().used_bytes, 0);
        });
    }

    #[test]
    fn test_shared_heap_serializes_access() {
        with_test_buffer(1 << 16, |base, capacity| {
            let region = TestRegion {
                base: base.as_ptr(),
                capacity,
                mapped: 0,
            };
            let shared = SharedHeap::new(BumpAllocator::new(0x10_0000, 0x20_0000));
            shared.init_heap(base, capacity, region).unwrap();

            let a = shared.allocate(48).unwrap();
            let b = shared.zeroed_allocate(4, 12).unwrap();
            shared.release(a);
            shared.release(b);
        });
    }
}
