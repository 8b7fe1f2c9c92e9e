// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel stack pool.
//!
//! The [`memlayout::KERNEL_STACKS`] window is divided into equal
//! slots of [`memlayout::KERNEL_STACK_SIZE`] bytes. The lowest page
//! of each slot is left unmapped as a guard, so overrunning a stack
//! faults instead of silently corrupting its neighbour.
//!
//! [`get`] finds a free slot by bitmap, maps and zeroes its pages and
//! returns the usable bounds; [`release`] zeroes and unmaps the pages
//! and returns the physical memory.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use bitmap_index::Bitmap;
use memlayout::{KERNEL_STACKS, KERNEL_STACK_SIZE, PAGE_SIZE};
use pagetable::{kernel_tables, AddressMapper, PageFlags};
use spin::Mutex;
use x86_64::VirtAddr;

/// The number of stack slots in the pool.
///
pub const NUM_STACKS: usize = {
    // KERNEL_STACKS.size() is not a const fn, so spell the
    // window size out; the unit test keeps this honest.
    0x2000_0000 / KERNEL_STACK_SIZE
};

/// The usable pages of one stack slot, excluding the guard
/// page.
///
const STACK_PAGES: usize = KERNEL_STACK_SIZE / PAGE_SIZE - 1;

/// The pool's slot bitmap. A set bit marks a slot in use.
///
static SLOTS: Mutex<Option<Bitmap>> = Mutex::new(None);

/// The bounds of one kernel stack.
///
/// `start` is the lowest usable address and `end` the address one
/// past the top; the stack grows downwards from `end`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    start: VirtAddr,
    end: VirtAddr,
}

impl StackBounds {
    /// Returns the lowest usable address.
    ///
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the address one past the stack top.
    ///
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Returns whether `addr` falls within the stack.
    ///
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Initialises the stack pool. Requires the kernel heap.
///
/// # Panics
///
/// `init` will panic if called more than once.
///
pub fn init() {
    let mut slots = SLOTS.lock();
    assert!(slots.is_none(), "stack pool already initialised");
    *slots = Some(Bitmap::new_unset(NUM_STACKS));
}

/// Returns the virtual range of the indexed slot, including
/// its guard page.
///
fn slot_range(index: usize) -> (VirtAddr, VirtAddr) {
    let base = KERNEL_STACKS.start() + (index * KERNEL_STACK_SIZE) as u64;
    (base, base + KERNEL_STACK_SIZE as u64)
}

/// Allocates a kernel stack: finds a free slot, maps its
/// pages above the guard and zeroes them.
///
/// Returns `None` when the pool or physical memory is exhausted.
///
/// # Panics
///
/// `get` will panic if the pool has not been initialised.
///
pub fn get() -> Option<StackBounds> {
    let mut slots = SLOTS.lock();
    let slots = slots.as_mut().expect("stack pool not initialised");

    let index = slots.next_unset()?;
    slots.set(index);

    let (slot_base, slot_end) = slot_range(index);
    let usable_base = slot_base + PAGE_SIZE as u64;

    let mut tables = kernel_tables().lock();
    for i in 0..STACK_PAGES {
        let phys = match physmem::allocate_page() {
            Some(phys) => phys,
            None => {
                // Unwind the partially built stack.
                for j in 0..i {
                    let virt = usable_base + (j * PAGE_SIZE) as u64;
                    if let Ok(phys) = tables.unmap_page(virt) {
                        unsafe { physmem::deallocate_page(phys) };
                    }
                }

                slots.unset(index);
                return None;
            }
        };

        let virt = usable_base + (i * PAGE_SIZE) as u64;
        if tables.map_page(phys, virt, PageFlags::WRITE).is_err() {
            unsafe { physmem::deallocate_page(phys) };
            slots.unset(index);
            return None;
        }
    }
    drop(tables);

    // Zero the whole stack before handing it out.
    unsafe {
        core::ptr::write_bytes(
            usable_base.as_mut_ptr::<u8>(),
            0,
            STACK_PAGES * PAGE_SIZE,
        );
    }

    Some(StackBounds {
        start: usable_base,
        end: slot_end,
    })
}

/// Returns a stack to the pool, zeroing and unmapping its
/// pages and freeing the physical memory.
///
/// # Panics
///
/// `release` will panic if `bounds` does not name an allocated slot
/// from this pool.
///
pub fn release(bounds: StackBounds) {
    let offset = (bounds.start().as_u64() - KERNEL_STACKS.start().as_u64()) as usize;
    assert!(
        offset % KERNEL_STACK_SIZE == PAGE_SIZE,
        "stack bounds {:p} do not start above a guard page",
        bounds.start()
    );
    let index = offset / KERNEL_STACK_SIZE;

    let mut slots = SLOTS.lock();
    let slots = slots.as_mut().expect("stack pool not initialised");
    assert!(slots.get(index), "releasing stack {} that is not in use", index);

    let mut tables = kernel_tables().lock();
    for i in 0..STACK_PAGES {
        let virt = bounds.start() + (i * PAGE_SIZE) as u64;

        // Zero while still mapped, then unmap and free.
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        match tables.unmap_page(virt) {
            Ok(phys) => unsafe { physmem::deallocate_page(phys) },
            Err(_) => panic!("stack page {:p} was not mapped", virt),
        }
    }

    slots.unset(index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_geometry() {
        // The hand-written pool size must match the window.
        assert_eq!(NUM_STACKS, KERNEL_STACKS.size() / KERNEL_STACK_SIZE);

        // Slots tile the window exactly, and their usable
        // ranges stay clear of the guard pages.
        let (first_base, first_end) = slot_range(0);
        assert_eq!(first_base, KERNEL_STACKS.start());

        let (last_base, last_end) = slot_range(NUM_STACKS - 1);
        assert_eq!(last_end.as_u64(), KERNEL_STACKS.end().as_u64() + 1);
        assert!(last_base < last_end);

        for index in [0, 1, NUM_STACKS / 2, NUM_STACKS - 1].iter().copied() {
            let (base, end) = slot_range(index);
            assert_eq!((end - base) as usize, KERNEL_STACK_SIZE);
            assert!(KERNEL_STACKS.contains_addr(base));

            let usable = base + PAGE_SIZE as u64;
            let bounds = StackBounds {
                start: usable,
                end,
            };
            assert!(bounds.contains(usable));
            assert!(bounds.contains(end - 1u64));
            assert!(!bounds.contains(base));
            assert!(!bounds.contains(end));
        }

        // Adjacent slots do not overlap.
        assert_eq!(first_end, slot_range(1).0);
    }
}
