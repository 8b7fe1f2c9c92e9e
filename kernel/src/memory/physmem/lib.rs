// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical memory management: a buddy allocator over the machine's
//! RAM regions.
//!
//! Each qualifying RAM region becomes a [`Region`]: its top holds the
//! allocator's own bookkeeping (per-order allocation bitmaps and a
//! pool of block descriptors), and the rest is tiled into naturally
//! aligned power-of-two blocks kept on per-order free lists.
//! Allocation rounds the request up to the next power of two, popping
//! a free block of that order or splitting a larger one; freeing
//! coalesces buddies back into larger blocks.
//!
//! The platform registers regions with [`add_region`] during early
//! boot, while physical memory is still reachable through the boot
//! aperture. Once the kernel's own address space is live, each
//! region's bookkeeping is remapped into its [`memlayout::REGION_INFO`]
//! window and [`region_vm_available`] retargets the region at its new
//! window. Free-list links are slot indices into the region's
//! descriptor pool rather than pointers, so retargeting a region means
//! swapping a single base address.
//!
//! ## Usage
//!
//! ```no_run
//! // Allocate and free a run of four contiguous pages.
//! let addr = physmem::allocate(4).unwrap();
//! unsafe { physmem::deallocate(addr, 4) };
//! ```

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

mod region;

pub use crate::region::{Region, MAX_ALLOC_PAGES, NUM_ORDERS};

use serial::println;
use spin::Mutex;
use x86_64::PhysAddr;

/// The maximum number of physical regions the allocator
/// manages. Regions beyond this are ignored.
///
pub const MAX_REGIONS: usize = 8;

/// The registered physical regions.
///
static REGIONS: [Mutex<Option<Region>>; MAX_REGIONS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Mutex<Option<Region>> = Mutex::new(None);
    [EMPTY; MAX_REGIONS]
};

/// Registers a RAM region with the allocator.
///
/// `early_aperture` is the virtual address at which the first byte of
/// the region is currently reachable; the region's bookkeeping is
/// built through it. Returns `false` if the region is too small to
/// qualify or the region table is full.
///
/// # Safety
///
/// The caller must have exclusive control of the described memory,
/// and `early_aperture` must map the entire region read-write.
///
pub unsafe fn add_region(base: PhysAddr, length: usize, early_aperture: usize) -> bool {
    if !Region::can_allocate(length) {
        return false;
    }

    for slot in REGIONS.iter() {
        let mut slot = slot.lock();
        if slot.is_none() {
            *slot = Some(Region::new(base, length, early_aperture));
            return true;
        }
    }

    false
}

/// Allocates `num_pages` contiguous physical pages.
///
/// The request is rounded up to the next power of two and the
/// returned address is aligned on `PAGE_SIZE` times that power.
/// Requests for zero pages, or for more than [`MAX_ALLOC_PAGES`],
/// fail.
///
pub fn allocate(num_pages: usize) -> Option<PhysAddr> {
    if num_pages == 0 || num_pages > MAX_ALLOC_PAGES {
        return None;
    }

    for slot in REGIONS.iter() {
        let mut slot = slot.lock();
        if let Some(region) = slot.as_mut() {
            if let Some(addr) = region.alloc(num_pages) {
                return Some(addr);
            }
        }
    }

    None
}

/// Allocates a single physical page.
///
pub fn allocate_page() -> Option<PhysAddr> {
    allocate(1)
}

/// Returns `num_pages` contiguous pages to the allocator.
///
/// # Safety
///
/// The memory must have been returned by [`allocate`] with the same
/// page count, and must no longer be referenced anywhere.
///
/// # Panics
///
/// `deallocate` will panic if no registered region owns `addr`, or if
/// the block is not currently allocated.
///
pub unsafe fn deallocate(addr: PhysAddr, num_pages: usize) {
    for slot in REGIONS.iter() {
        let mut slot = slot.lock();
        if let Some(region) = slot.as_mut() {
            if region.owns(addr) {
                region.free(addr, num_pages);
                return;
            }
        }
    }

    panic!("deallocate: no region owns {:#x}", addr.as_u64());
}

/// Returns a single page to the allocator.
///
/// # Safety
///
/// As for [`deallocate`].
///
pub unsafe fn deallocate_page(addr: PhysAddr) {
    deallocate(addr, 1);
}

/// Carves the page containing `addr` out of the free space
/// and marks it allocated. Used at bring-up for pages the
/// firmware or the boot protocol still owns.
///
/// Returns `false` if the page is not in any region's free
/// space.
///
pub fn reserve(addr: PhysAddr) -> bool {
    for slot in REGIONS.iter() {
        let mut slot = slot.lock();
        if let Some(region) = slot.as_mut() {
            if region.owns(addr) {
                return region.reserve(addr);
            }
        }
    }

    false
}

/// Returns the number of free pages across all regions.
///
pub fn free_page_count() -> usize {
    let mut total = 0;
    for slot in REGIONS.iter() {
        let slot = slot.lock();
        if let Some(region) = slot.as_ref() {
            total += region.free_page_count();
        }
    }

    total
}

/// Returns the physical range of the indexed region's
/// bookkeeping, for remapping into its `REGION_INFO` window.
///
pub fn metadata_range(index: usize) -> Option<(PhysAddr, usize)> {
    let slot = REGIONS.get(index)?.lock();
    slot.as_ref().map(|region| region.metadata_range())
}

/// Retargets the indexed region's bookkeeping at
/// `metadata_aperture`, the virtual address at which the
/// range returned by [`metadata_range`] is now mapped.
///
/// This is a one-shot operation, performed once per region when the
/// kernel address space comes up; the boot aperture may be torn down
/// afterwards.
///
/// # Safety
///
/// `metadata_aperture` must map the region's entire metadata range
/// read-write for the lifetime of the allocator.
///
pub unsafe fn region_vm_available(index: usize, metadata_aperture: usize) {
    if let Some(slot) = REGIONS.get(index) {
        let mut slot = slot.lock();
        if let Some(region) = slot.as_mut() {
            region.vm_available(metadata_aperture);
        }
    }
}

/// Prints debug information about every region.
///
pub fn debug() {
    for (i, slot) in REGIONS.iter().enumerate() {
        let slot = slot.lock();
        if let Some(region) = slot.as_ref() {
            println!("phys region {}:", i);
            region.debug();
        }
    }
}
