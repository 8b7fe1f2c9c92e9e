// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's anonymous page pool and heap.
//!
//! The [`AnonPool`] hands out page-granular kernel virtual memory
//! from the [`memlayout::ANON_POOL`] window: each allocation advances
//! a watermark and maps one fresh physical page per page of virtual
//! space through the kernel page tables.
//!
//! Only the most recent allocation can be returned to the pool
//! (rolling the watermark back); interior frees are accepted and
//! leak. This is a known limitation; the pool's only client is the
//! kernel heap, which grows and never shrinks.
//!
//! [`KernelHeap`] is the kernel's `GlobalAlloc`: a free-list
//! allocator over a contiguous run of anon-pool memory, extended on
//! demand. The `kernel` crate registers it as the global allocator
//! and calls [`KernelHeap::init`] during memory bring-up, after the
//! physical allocator and kernel page tables are live.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use linked_list_allocator::Heap;
use memlayout::{ANON_POOL, PAGE_SIZE};
use pagetable::{kernel_tables, AddressMapper, PageFlags};
use spin::Mutex;
use x86_64::VirtAddr;

/// The number of pages the heap starts with.
///
const INITIAL_HEAP_PAGES: usize = 128;

/// The number of pages the heap grows by when exhausted, at
/// minimum.
///
const GROW_PAGES: usize = 64;

/// The kernel's anonymous page pool.
///
pub struct AnonPool {
    /// The watermark: the next virtual address to hand out.
    next: VirtAddr,
    /// The most recent allocation, the only one that can be
    /// returned.
    last: Option<(VirtAddr, usize)>,
}

/// The pool singleton.
///
static POOL: Mutex<AnonPool> = Mutex::new(AnonPool {
    next: ANON_POOL.start(),
    last: None,
});

/// Allocates `num_pages` pages of mapped kernel virtual
/// memory from the pool.
///
/// Returns `None` when physical memory or the pool's window is
/// exhausted. The memory is not zeroed.
///
pub fn allocate_pages(num_pages: usize) -> Option<VirtAddr> {
    if num_pages == 0 {
        return None;
    }

    let mut pool = POOL.lock();
    let base = pool.next;
    if !ANON_POOL.contains_range(base, num_pages * PAGE_SIZE) {
        return None;
    }

    let mut tables = kernel_tables().lock();
    for i in 0..num_pages {
        let phys = match physmem::allocate_page() {
            Some(phys) => phys,
            None => {
                // Unwind the pages mapped so far.
                for j in 0..i {
                    let virt = base + (j * PAGE_SIZE) as u64;
                    if let Ok(phys) = tables.unmap_page(virt) {
                        unsafe { physmem::deallocate_page(phys) };
                    }
                }

                return None;
            }
        };

        let virt = base + (i * PAGE_SIZE) as u64;
        if tables
            .map_page(phys, virt, PageFlags::WRITE | PageFlags::GLOBAL)
            .is_err()
        {
            unsafe { physmem::deallocate_page(phys) };
            return None;
        }
    }

    pool.next = base + (num_pages * PAGE_SIZE) as u64;
    pool.last = Some((base, num_pages));

    Some(base)
}

/// Returns pages to the pool.
///
/// Only the allocation most recently returned by
/// [`allocate_pages`] is actually reclaimed, by rolling the
/// watermark back; anything else is accepted and leaks.
///
pub fn free_pages(base: VirtAddr, num_pages: usize) {
    let mut pool = POOL.lock();
    if pool.last != Some((base, num_pages)) {
        // Interior free; the virtual window and its pages
        // are leaked.
        return;
    }

    let mut tables = kernel_tables().lock();
    for i in 0..num_pages {
        let virt = base + (i * PAGE_SIZE) as u64;
        if let Ok(phys) = tables.unmap_page(virt) {
            unsafe { physmem::deallocate_page(phys) };
        }
    }

    pool.next = base;
    pool.last = None;
}

/// The kernel heap: a growable free-list allocator over
/// anon-pool memory.
///
pub struct KernelHeap {
    heap: Mutex<Heap>,
}

impl KernelHeap {
    /// Returns an empty, uninitialised heap.
    ///
    pub const fn empty() -> Self {
        KernelHeap {
            heap: Mutex::new(Heap::empty()),
        }
    }

    /// Gives the heap its initial memory.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, after the physical allocator and
    /// kernel page tables are initialised and before the first
    /// allocation.
    ///
    /// # Panics
    ///
    /// `init` will panic if the initial heap memory cannot be
    /// allocated; the kernel cannot run without a heap.
    ///
    pub unsafe fn init(&self) {
        let base = allocate_pages(INITIAL_HEAP_PAGES).expect("failed to allocate kernel heap");
        self.heap
            .lock()
            .init(base.as_u64() as usize, INITIAL_HEAP_PAGES * PAGE_SIZE);
    }

    /// Grows the heap by at least `needed` bytes.
    ///
    /// The heap's only memory source is the anon pool, and the heap
    /// is the pool's only client, so every extension is contiguous
    /// with the existing heap.
    ///
    fn grow(&self, needed: usize) -> bool {
        let pages = ((needed + PAGE_SIZE - 1) / PAGE_SIZE).max(GROW_PAGES);
        match allocate_pages(pages) {
            Some(_) => {
                unsafe { self.heap.lock().extend(pages * PAGE_SIZE) };
                true
            }
            None => false,
        }
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if let Ok(allocation) = self.heap.lock().allocate_first_fit(layout) {
            return allocation.as_ptr();
        }

        // Grow and retry once.
        if !self.grow(layout.size() + layout.align()) {
            return ptr::null_mut();
        }

        match self.heap.lock().allocate_first_fit(layout) {
            Ok(allocation) => allocation.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = core::ptr::NonNull::new(ptr) {
            self.heap.lock().deallocate(ptr, layout);
        }
    }
}
