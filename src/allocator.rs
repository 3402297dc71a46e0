//! The process-aware heap allocator
//!
//! A singly linked list of [`MemoryChunk`] headers, growing up from the
//! heap base. Each chunk knows whether it is in use, which task owns it
//! (for future bulk-free-on-exit bookkeeping), and where the next chunk
//! starts; there is no length field, because the next chunk's address
//! doubles as "one past the end of this one". The last chunk in the list
//! is always unused and has `next` set to null; `top_of_heap()` is that
//! chunk's address plus one header, which must always stay strictly below
//! [`crate::scheduler::Scheduler::beginning_of_stacks`].
//!
//! Allocation is first-fit: the first unused chunk big enough for the
//! request wins, optionally split in two if it has enough spare room left
//! over to be worth turning into its own chunk. Freeing eagerly coalesces
//! with both neighbours, so free memory never fragments into runs of tiny
//! unusable chunks the way a lazy-coalescing allocator can.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::mem::size_of;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::critical;
use crate::error::{self, ErrorKind};
use crate::pcb::Pid;

/// A chunk is only worth splitting if the leftover space can hold at least
/// this many bytes of payload, on top of the new header it would need
const MIN_EXCESS_TO_SPLIT: usize = size_of::<usize>();

/// A node in the chunk list
#[repr(C)]
struct MemoryChunk {
    used: bool,
    owner: Pid,
    next: *mut MemoryChunk,
}

impl MemoryChunk {
    /// The usable payload size of this chunk: the gap between its header
    /// and the next chunk's header
    ///
    /// # Safety
    /// `self.next` must be a valid, non-null `MemoryChunk`, or null if this
    /// is the last chunk (in which case the returned size is 0).
    unsafe fn size(&self) -> usize {
        let this_addr = self as *const Self as usize;
        let next_addr = self.next as usize;
        next_addr.saturating_sub(this_addr).saturating_sub(size_of::<MemoryChunk>())
    }

    /// The first byte of this chunk's payload
    fn payload(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(size_of::<MemoryChunk>()) }
    }
}

/// The kernel's heap allocator
pub struct Allocator {
    root: AtomicPtr<MemoryChunk>,
    last: AtomicPtr<MemoryChunk>,
}

impl Allocator {
    const fn new() -> Allocator {
        Allocator {
            root: AtomicPtr::new(core::ptr::null_mut()),
            last: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Initialise the heap
    ///
    /// # Safety
    /// `heap_base` must point to memory not otherwise in use, with at
    /// least `size_of::<MemoryChunk>()` bytes of headroom below
    /// `beginning_of_stacks()`, and this must be called exactly once,
    /// before any task runs.
    pub(crate) unsafe fn init(&self, heap_base: *mut u8) {
        let root = heap_base as *mut MemoryChunk;
        // SAFETY: caller guarantees heap_base is valid and unused.
        unsafe {
            root.write(MemoryChunk {
                used: false,
                owner: Pid::NULL,
                next: core::ptr::null_mut(),
            });
        }
        self.root.store(root, Ordering::Release);
        self.last.store(root, Ordering::Release);
        defmt::info!("heap base @ {=usize:08x}", heap_base as usize);
    }

    /// Allocate `count` bytes, stamped as owned by the current task
    ///
    /// Returns a null pointer if no chunk is free and big enough.
    pub(crate) fn allocate(&self, count: usize) -> *mut u8 {
        critical::with(|| unsafe { self.allocate_locked(count) })
    }

    /// Free a pointer previously returned by [`Allocator::allocate`]
    ///
    /// Coalesces with both neighbouring chunks if they are also unused.
    pub(crate) fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        critical::with(|| unsafe { self.free_locked(ptr) });
    }

    /// The address one past the last chunk header: the current top of the
    /// heap, which must stay below the PCB chain
    pub(crate) fn top_of_heap(&self) -> *mut u8 {
        let last = self.last.load(Ordering::Relaxed);
        if last.is_null() {
            return core::ptr::null_mut();
        }
        (last as usize + size_of::<MemoryChunk>()) as *mut u8
    }

    /// # Safety
    /// Must be called from inside a critical section.
    unsafe fn allocate_locked(&self, count: usize) -> *mut u8 {
        let root = self.root.load(Ordering::Relaxed);
        if root.is_null() {
            panic!("allocator not initialised");
        }

        let owner = crate::scheduler::SCHEDULER.current_pid();
        let mut cursor = root;
        loop {
            // SAFETY: cursor is always a valid MemoryChunk, reached via
            // `root` or `.next()` chains built by this module.
            let chunk = unsafe { &mut *cursor };
            let size = unsafe { chunk.size() };
            if !chunk.used && size >= count {
                unsafe { self.try_to_partition(chunk, count) };
                chunk.used = true;
                chunk.owner = owner;
                return chunk.payload();
            }
            if cursor == self.last.load(Ordering::Relaxed) {
                // Reached the last real chunk with nothing big enough; try
                // to grow the heap by moving `last`/the heap boundary up.
                return unsafe { self.grow_and_allocate(count, owner) };
            }
            cursor = chunk.next;
        }
    }

    /// Extend the heap by turning the last, always-unused chunk into the
    /// new allocation in place, then appending a fresh unused chunk above
    /// it to remain the new last chunk, if there is room below
    /// `beginning_of_stacks()`
    ///
    /// # Safety
    /// Must be called from inside a critical section, with `self.last`
    /// pointing at the current last chunk.
    unsafe fn grow_and_allocate(&self, count: usize, owner: Pid) -> *mut u8 {
        let last = self.last.load(Ordering::Relaxed);
        let last_addr = last as usize;
        let new_tail_addr = last_addr + size_of::<MemoryChunk>() + count;
        let new_tail_end = new_tail_addr + size_of::<MemoryChunk>();

        let stacks_begin = crate::scheduler::SCHEDULER.beginning_of_stacks() as usize;
        if stacks_begin != 0 && new_tail_end > stacks_begin {
            error::fatal(ErrorKind::OutOfMemory);
        }

        let new_tail = new_tail_addr as *mut MemoryChunk;
        // SAFETY: new_tail_addr sits strictly below beginning_of_stacks()
        // and above every existing chunk, in RAM not otherwise in use.
        unsafe {
            new_tail.write(MemoryChunk {
                used: false,
                owner: Pid::NULL,
                next: core::ptr::null_mut(),
            });
        }

        // SAFETY: last is always valid once initialised.
        let last_chunk = unsafe { &mut *last };
        last_chunk.used = true;
        last_chunk.owner = owner;
        last_chunk.next = new_tail;
        self.last.store(new_tail, Ordering::Relaxed);

        last_chunk.payload()
    }

    /// If `chunk` has more than `count` bytes of payload and the leftover
    /// is worth its own header, split it into a `count`-byte chunk
    /// followed by a fresh unused chunk holding the remainder
    ///
    /// # Safety
    /// `chunk` must be a valid, currently-unused chunk in the list.
    unsafe fn try_to_partition(&self, chunk: &mut MemoryChunk, count: usize) {
        let size = unsafe { chunk.size() };
        let excess = size - count;
        if excess < size_of::<MemoryChunk>() + MIN_EXCESS_TO_SPLIT {
            return;
        }

        let chunk_addr = chunk as *const MemoryChunk as usize;
        let new_chunk_addr = chunk_addr + size_of::<MemoryChunk>() + count;
        let new_chunk = new_chunk_addr as *mut MemoryChunk;

        // SAFETY: new_chunk_addr sits strictly inside chunk's own payload,
        // below its end, so it does not alias anything else.
        unsafe {
            new_chunk.write(MemoryChunk {
                used: false,
                owner: Pid::NULL,
                next: chunk.next,
            });
        }

        if chunk.next == self.last.load(Ordering::Relaxed) as *mut MemoryChunk
            || core::ptr::eq(chunk, unsafe { &*self.last.load(Ordering::Relaxed) })
        {
            self.last.store(new_chunk, Ordering::Relaxed);
        }

        chunk.next = new_chunk;
    }

    /// # Safety
    /// Must be called from inside a critical section, with `ptr` a value
    /// previously returned by [`Allocator::allocate`] that has not already
    /// been freed.
    unsafe fn free_locked(&self, ptr: *mut u8) {
        let chunk_addr = (ptr as usize).saturating_sub(size_of::<MemoryChunk>());
        let chunk = chunk_addr as *mut MemoryChunk;
        // SAFETY: ptr was returned by a previous allocate(), so chunk_addr
        // points at that allocation's header.
        let chunk_ref = unsafe { &mut *chunk };
        chunk_ref.used = false;
        chunk_ref.owner = Pid::NULL;

        self.merge_with_next(chunk);
        self.merge_with_previous(chunk);
    }

    /// Absorb the chunk immediately after `chunk` into `chunk`, if it is
    /// also unused
    ///
    /// # Safety
    /// `chunk` must be a valid chunk in the list.
    unsafe fn merge_with_next(&self, chunk: *mut MemoryChunk) {
        let chunk_ref = unsafe { &mut *chunk };
        if chunk_ref.next.is_null() {
            // chunk IS the last chunk; nothing to merge with.
            return;
        }
        // SAFETY: chunk_ref.next is non-null, so it is a valid chunk.
        let next_ref = unsafe { &*chunk_ref.next };
        if next_ref.used {
            return;
        }
        if chunk_ref.next == self.last.load(Ordering::Relaxed) {
            self.last.store(chunk, Ordering::Relaxed);
        }
        chunk_ref.next = next_ref.next;
    }

    /// Absorb `chunk` into the chunk immediately before it, if that chunk
    /// is also unused
    ///
    /// Walks the list from `root` to find the previous chunk, because the
    /// list is singly linked.
    ///
    /// # Safety
    /// `chunk` must be a valid chunk in the list.
    unsafe fn merge_with_previous(&self, chunk: *mut MemoryChunk) {
        let root = self.root.load(Ordering::Relaxed);
        if chunk == root {
            // chunk IS the first chunk; nothing before it.
            return;
        }
        let previous = unsafe { self.get_previous(chunk) };
        // SAFETY: get_previous only ever returns a valid chunk pointer.
        let previous_ref = unsafe { &*previous };
        if previous_ref.used {
            return;
        }
        let chunk_ref = unsafe { &*chunk };
        if chunk == self.last.load(Ordering::Relaxed) {
            self.last.store(previous, Ordering::Relaxed);
        }
        unsafe { &mut *previous }.next = chunk_ref.next;
    }

    /// Find the chunk immediately before `target` in the list
    ///
    /// # Safety
    /// `target` must be a chunk reachable from `root`, and must not be
    /// `root` itself.
    unsafe fn get_previous(&self, target: *mut MemoryChunk) -> *mut MemoryChunk {
        let mut prev = self.root.load(Ordering::Relaxed);
        loop {
            // SAFETY: prev is always a valid chunk, reached via `root` or
            // `.next()` chains.
            let prev_ref = unsafe { &*prev };
            let chunk = prev_ref.next;
            if chunk == target {
                return prev;
            }
            if chunk.is_null() {
                error::fatal(ErrorKind::Unreachable);
            }
            prev = chunk;
        }
    }
}

/// The kernel's one heap
pub(crate) static ALLOCATOR: Allocator = Allocator::new();

/// Initialise the heap at `heap_base`
///
/// # Safety
/// See [`Allocator::init`].
pub(crate) unsafe fn init(heap_base: *mut u8) {
    unsafe { ALLOCATOR.init(heap_base) };
}

/// Allocate `count` bytes from the kernel heap
pub fn allocate(count: usize) -> *mut u8 {
    ALLOCATOR.allocate(count)
}

/// Free a pointer previously returned by [`allocate`]
pub fn free(ptr: *mut u8) {
    ALLOCATOR.free(ptr);
}

/// The current top of the heap
pub(crate) fn top_of_heap() -> *mut u8 {
    ALLOCATOR.top_of_heap()
}

/// A `core::alloc::GlobalAlloc` wrapper around the kernel heap
///
/// Opt in with the `global-allocator` feature and:
/// ```ignore
/// #[global_allocator]
/// static HEAP: vole::allocator::GlobalAllocProxy = vole::allocator::GlobalAllocProxy;
/// ```
#[cfg(feature = "global-allocator")]
pub struct GlobalAllocProxy;

#[cfg(feature = "global-allocator")]
unsafe impl core::alloc::GlobalAlloc for GlobalAllocProxy {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        // The chunk list only guarantees `align_of::<MemoryChunk>()`
        // alignment for payloads; anything stricter than that cannot be
        // satisfied by this allocator.
        if layout.align() > core::mem::align_of::<usize>() {
            return core::ptr::null_mut();
        }
        allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        free(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny simulated RAM region for exercising the allocator on the host
    #[repr(align(8))]
    struct Ram([u8; 1024]);

    fn new_allocator(ram: &mut Ram) -> Allocator {
        let allocator = Allocator::new();
        unsafe { allocator.init(ram.0.as_mut_ptr()) };
        allocator
    }

    #[test]
    fn first_allocation_comes_from_heap_base() {
        let mut ram = Ram([0u8; 1024]);
        let base = ram.0.as_mut_ptr();
        let allocator = new_allocator(&mut ram);

        let p = allocator.allocate(16);
        assert!(!p.is_null());
        assert_eq!(p as usize, base as usize + size_of::<MemoryChunk>());
    }

    #[test]
    fn free_then_reallocate_reuses_the_chunk() {
        let mut ram = Ram([0u8; 1024]);
        let allocator = new_allocator(&mut ram);

        let a = allocator.allocate(32);
        allocator.free(a);
        let b = allocator.allocate(32);
        assert_eq!(a, b);
    }

    #[test]
    fn successive_allocations_do_not_alias() {
        let mut ram = Ram([0u8; 1024]);
        let allocator = new_allocator(&mut ram);

        let a = allocator.allocate(32);
        let b = allocator.allocate(32);
        let c = allocator.allocate(32);

        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);

        // each allocation's payload must not overlap either neighbour's
        let chunk_span = 32 + size_of::<MemoryChunk>();
        assert!((b as usize) >= (a as usize) + chunk_span);
        assert!((c as usize) >= (b as usize) + chunk_span);

        // writing through one allocation must not corrupt another
        unsafe {
            core::ptr::write_bytes(a, 0xAA, 32);
            core::ptr::write_bytes(b, 0xBB, 32);
            core::ptr::write_bytes(c, 0xCC, 32);
            assert_eq!(*a, 0xAA);
            assert_eq!(*b, 0xBB);
            assert_eq!(*c, 0xCC);
        }
    }

    #[test]
    fn freeing_adjacent_chunks_coalesces_them() {
        let mut ram = Ram([0u8; 1024]);
        let allocator = new_allocator(&mut ram);

        let a = allocator.allocate(32);
        let b = allocator.allocate(32);
        let c = allocator.allocate(32);

        allocator.free(a);
        allocator.free(c);
        allocator.free(b);

        // After freeing all three in a scrambled order, the heap should be
        // back to one fully coalesced free chunk big enough for a large
        // allocation that spans what used to be all three chunks plus
        // their now-removed headers.
        let big = allocator.allocate(96 + 2 * size_of::<MemoryChunk>());
        assert!(!big.is_null());
    }

    #[test]
    fn allocations_are_stamped_with_the_requesting_task() {
        // Without a running scheduler, current_pid() is Pid::NULL; this
        // just exercises that the owner field round-trips through free.
        let mut ram = Ram([0u8; 1024]);
        let allocator = new_allocator(&mut ram);
        let p = allocator.allocate(8);
        let chunk = (p as usize - size_of::<MemoryChunk>()) as *const MemoryChunk;
        assert!(unsafe { &*chunk }.used);
    }
}

// End of File
