// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Memory objects: the reference-counted backing of virtual memory.
//!
//! A [`MapEntry`] describes a run of memory that can be mapped into
//! one or more address spaces. Physically backed entries map a fixed
//! physical range; anonymous entries own physical pages that are
//! allocated lazily when first touched and zero-filled.
//!
//! An entry keeps a back-reference to every map it is installed in so
//! that shrinking it can withdraw trimmed pages from all of them, and
//! records the page counter of the task that faulted each anonymous
//! page in, for per-task memory accounting.

use crate::{Map, MapFailure};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use align::{align_up, is_aligned};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use memlayout::PAGE_SIZE;
use pagetable::PageFlags;
use spin::RwLock;
use syscalls::{Handle, VmFlags};
use x86_64::{PhysAddr, VirtAddr};

/// Counts the physical pages attributed to one task.
///
/// The task owns the counter; the VM layer bumps it when the task
/// faults an anonymous page in and drops it when the page is
/// released.
///
#[derive(Debug, Default)]
pub struct PageCounter(AtomicUsize);

impl PageCounter {
    /// Returns a fresh counter at zero.
    ///
    pub fn new() -> Arc<PageCounter> {
        Arc::new(PageCounter(AtomicUsize::new(0)))
    }

    /// Returns the current count.
    ///
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// What backs a memory object.
///
enum Backing {
    /// A fixed physical range starting at the given
    /// address.
    Phys(PhysAddr),
    /// Lazily allocated, zero-filled physical pages.
    Anon,
}

/// One lazily allocated page of an anonymous entry.
///
struct AnonPage {
    /// Page index within the entry.
    index: usize,
    /// The physical page backing it.
    phys: PhysAddr,
    /// The accounting counter of the task that faulted the
    /// page in.
    owner: Weak<PageCounter>,
}

/// A map this entry is installed in.
///
struct MapRef {
    map: Weak<Map>,
    /// Base virtual address of the entry's window in that
    /// map.
    base: VirtAddr,
    /// Permission mask the mapping was installed with.
    mask: VmFlags,
}

struct EntryInner {
    /// Logical length in bytes; always a page multiple.
    length: usize,
    /// Default permissions for new mappings and fault-ins.
    flags: VmFlags,
    /// Maps currently mapping this entry.
    maps: Vec<MapRef>,
    /// The anonymous pages allocated so far.
    pages: Vec<AnonPage>,
}

/// A reference-counted memory object.
///
pub struct MapEntry {
    kernel: bool,
    backing: Backing,
    handle: AtomicU64,
    inner: RwLock<EntryInner>,
}

impl MapEntry {
    /// Creates a memory object over a fixed physical range.
    ///
    /// The length is rounded up to a page multiple. The mapping is
    /// installed eagerly whenever the entry is added to a map.
    ///
    pub fn make_phys(
        phys: PhysAddr,
        length: usize,
        flags: VmFlags,
        kernel: bool,
    ) -> Arc<MapEntry> {
        Arc::new(MapEntry {
            kernel,
            backing: Backing::Phys(phys),
            handle: AtomicU64::new(Handle::INVALID.as_raw()),
            inner: RwLock::new(EntryInner {
                length: align_up(length, PAGE_SIZE),
                flags,
                maps: Vec::new(),
                pages: Vec::new(),
            }),
        })
    }

    /// Creates an anonymous memory object of the given
    /// logical length, rounded up to a page multiple.
    ///
    pub fn make_anon(length: usize, flags: VmFlags, kernel: bool) -> Arc<MapEntry> {
        Arc::new(MapEntry {
            kernel,
            backing: Backing::Anon,
            handle: AtomicU64::new(Handle::INVALID.as_raw()),
            inner: RwLock::new(EntryInner {
                length: align_up(length, PAGE_SIZE),
                flags,
                maps: Vec::new(),
                pages: Vec::new(),
            }),
        })
    }

    /// Returns whether the entry is anonymous.
    ///
    pub fn is_anon(&self) -> bool {
        matches!(self.backing, Backing::Anon)
    }

    /// Returns whether the entry is kernel-only.
    ///
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Returns the entry's logical length in bytes.
    ///
    pub fn length(&self) -> usize {
        self.inner.read().length
    }

    /// Returns the entry's current default flags.
    ///
    pub fn flags(&self) -> VmFlags {
        self.inner.read().flags
    }

    /// Returns the number of anonymous pages currently
    /// allocated.
    ///
    pub fn owned_page_count(&self) -> usize {
        self.inner.read().pages.len()
    }

    /// Returns the entry's handle.
    ///
    pub fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Acquire))
    }

    /// Records the entry's handle. Called by whoever
    /// registers the entry with the handle manager.
    ///
    pub fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.as_raw(), Ordering::Release);
    }

    /// Replaces the entry's access permissions.
    ///
    /// The permission bits (read, write, execute, MMIO) are replaced
    /// wholesale; other flags are kept. The change applies to new
    /// mappings and future fault-ins; existing translations are left
    /// as they are.
    ///
    pub fn update_flags(&self, new: VmFlags) {
        let mut inner = self.inner.write();
        let kept = inner.flags - VmFlags::PERMISSION_MASK;
        inner.flags = kept | (new & VmFlags::PERMISSION_MASK);
    }

    /// Resizes the entry.
    ///
    /// Growing only extends the logical length. Shrinking releases
    /// every anonymous page beyond the new end, withdrawing it from
    /// all maps the entry is installed in first. Mapping windows keep
    /// their original span; faults beyond the new end simply fail.
    ///
    pub fn resize(&self, new_length: usize) -> Result<(), MapFailure> {
        if new_length == 0 || !is_aligned(new_length, PAGE_SIZE) {
            return Err(MapFailure::BadSize);
        }

        let mut inner = self.inner.write();
        if new_length >= inner.length {
            inner.length = new_length;
            return Ok(());
        }

        inner.length = new_length;
        let end_index = new_length / PAGE_SIZE;

        let mut i = 0;
        while i < inner.pages.len() {
            if inner.pages[i].index < end_index {
                i += 1;
                continue;
            }

            let page = inner.pages.remove(i);

            // Withdraw the page from every map before the
            // frame goes back to the allocator.
            for map_ref in inner.maps.iter() {
                if let Some(map) = map_ref.map.upgrade() {
                    let virt = map_ref.base + (page.index * PAGE_SIZE) as u64;
                    map.table_unmap(virt);
                }
            }

            release_anon_page(page);
        }

        Ok(())
    }

    /// Callback invoked when this entry is installed into a
    /// map at `base`.
    ///
    /// Physically backed entries map their whole range eagerly;
    /// anonymous entries map only the pages already faulted in.
    ///
    pub(crate) fn added_to_map(
        &self,
        map: &Arc<Map>,
        base: VirtAddr,
        mask: VmFlags,
    ) -> Result<(), MapFailure> {
        let mut inner = self.inner.write();
        let flags = self.page_flags(effective_flags(inner.flags, mask));

        match &self.backing {
            Backing::Phys(phys) => {
                let mut offset = 0;
                while offset < inner.length {
                    map.table_map(*phys + offset as u64, base + offset as u64, flags)?;
                    offset += PAGE_SIZE;
                }
            }
            Backing::Anon => {
                for page in inner.pages.iter() {
                    let virt = base + (page.index * PAGE_SIZE) as u64;
                    map.table_map(page.phys, virt, flags)?;
                }
            }
        }

        inner.maps.push(MapRef {
            map: Arc::downgrade(map),
            base,
            mask,
        });

        Ok(())
    }

    /// Callback invoked after this entry is removed from a
    /// map; withdraws the window's translations and drops
    /// the back-reference.
    ///
    pub(crate) fn removed_from_map(&self, map: &Map, base: VirtAddr, length: usize) {
        let mut inner = self.inner.write();

        let mut offset = 0;
        while offset < length {
            map.table_unmap(base + offset as u64);
            offset += PAGE_SIZE;
        }

        inner
            .maps
            .retain(|map_ref| map_ref.map.as_ptr() != map as *const Map);
    }

    /// Handles a page fault at `offset` bytes into this
    /// entry's window in `map`.
    ///
    /// Only a non-present fault on an anonymous entry, within the
    /// current logical length, can be satisfied; everything else is
    /// reported unhandled.
    ///
    pub(crate) fn handle_pagefault(
        &self,
        map: &Arc<Map>,
        base: VirtAddr,
        offset: usize,
        present: bool,
        _write: bool,
        counter: &Arc<PageCounter>,
    ) -> bool {
        if !self.is_anon() || present {
            return false;
        }
        if offset >= self.inner.read().length {
            return false;
        }

        self.fault_in(map, base, offset / PAGE_SIZE, counter)
    }

    /// Faults one anonymous page in: either maps the
    /// already-allocated page (the shared memory case) or
    /// allocates, zeroes and maps a fresh one.
    ///
    pub(crate) fn fault_in(
        &self,
        map: &Arc<Map>,
        base: VirtAddr,
        page_index: usize,
        counter: &Arc<PageCounter>,
    ) -> bool {
        let mut inner = self.inner.write();
        let virt = base + (page_index * PAGE_SIZE) as u64;
        let mask = inner
            .maps
            .iter()
            .find(|map_ref| map_ref.map.as_ptr() == Arc::as_ptr(map))
            .map(|map_ref| map_ref.mask)
            .unwrap_or(VmFlags::empty());
        let flags = self.page_flags(effective_flags(inner.flags, mask));

        // Another address space may have faulted this page
        // in already; just install the translation.
        for page in inner.pages.iter() {
            if page.index == page_index {
                return map.table_map(page.phys, virt, flags).is_ok();
            }
        }

        let phys = match physmem::allocate_page() {
            Some(phys) => phys,
            None => return false,
        };

        // Zero before the page becomes visible.
        map.zero_frame(phys);

        counter.increment();
        inner.pages.push(AnonPage {
            index: page_index,
            phys,
            owner: Arc::downgrade(counter),
        });

        map.table_map(phys, virt, flags).is_ok()
    }

    /// Converts VM flags into hardware page flags for this
    /// entry.
    ///
    fn page_flags(&self, flags: VmFlags) -> PageFlags {
        let mut page = PageFlags::empty();
        if flags.contains(VmFlags::WRITE) {
            page |= PageFlags::WRITE;
        }
        if flags.contains(VmFlags::EXEC) {
            page |= PageFlags::EXEC;
        }
        if flags.contains(VmFlags::MMIO) {
            page |= PageFlags::NO_CACHE;
        }
        if flags.contains(VmFlags::WRITE_THROUGH) {
            page |= PageFlags::WRITE_THROUGH;
        }

        if self.kernel {
            page |= PageFlags::GLOBAL;
        } else {
            page |= PageFlags::USER;
        }

        page
    }

}

impl Drop for MapEntry {
    fn drop(&mut self) {
        // Return the anonymous pages. Every map holding a
        // reference has already gone, so no translations
        // remain.
        let inner = self.inner.get_mut();
        for page in inner.pages.drain(..) {
            release_anon_page(page);
        }
    }
}

/// Applies a mapping's permission mask to an entry's flags:
/// an empty mask passes the flags through, otherwise the
/// mask filters the permission bits.
///
fn effective_flags(flags: VmFlags, mask: VmFlags) -> VmFlags {
    if mask.is_empty() {
        return flags;
    }

    (flags - VmFlags::PERMISSION_MASK) | (flags & mask & VmFlags::PERMISSION_MASK)
}

fn release_anon_page(page: AnonPage) {
    if let Some(owner) = page.owner.upgrade() {
        owner.decrement();
    }

    unsafe { physmem::deallocate_page(page.phys) };
}
