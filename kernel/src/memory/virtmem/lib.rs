// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Virtual memory: address spaces and the memory objects
//! mapped into them.
//!
//! A [`Map`] is one address space: a hardware page table (behind the
//! [`pagetable::AddressMapper`] seam) plus an ordered set of views,
//! each view being a [`MapEntry`] installed at a base address. Views
//! never overlap. Mapping a [`MapEntry`] into several maps shares its
//! backing memory between those address spaces.
//!
//! Page faults route through the faulting task's map: a non-present
//! fault inside an anonymous view allocates one zero-filled page,
//! installs the translation and records the page against the faulting
//! task's [`PageCounter`]. Everything else is reported unhandled and
//! becomes a thread fault.
//!
//! The kernel's own map is built once at bring-up over the kernel
//! page tables ([`init_kernel_map`]); every user map aliases its
//! kernel half.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod entry;

pub use crate::entry::{MapEntry, PageCounter};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use align::{align_up, is_aligned};
use memlayout::{phys_to_virt_addr, PAGE_SIZE};
use pagetable::{kernel_tables, AddressMapper, MapError, PageFlags, PteHandler};
use spin::{Once, RwLock};
use syscalls::VmFlags;
use x86_64::{PhysAddr, VirtAddr};

/// The ways a virtual memory operation can fail.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapFailure {
    /// The requested window overlaps an existing view, or
    /// the entry is already installed in this map.
    Overlap,
    /// No hole large enough exists in the search range.
    NoSpace,
    /// The entry is not installed in this map.
    NotFound,
    /// A length or address is malformed.
    BadSize,
    /// Physical memory or page table space is exhausted.
    NoMemory,
}

/// Where to install a view.
///
#[derive(Clone, Copy, Debug)]
pub enum Placement {
    /// Exactly at the given base address.
    Fixed(VirtAddr),
    /// The first hole of sufficient size in `[start, end)`,
    /// scanning upwards.
    Search { start: VirtAddr, end: VirtAddr },
}

/// One view: a memory object installed at a base address.
///
/// The permission mask the view was installed with lives on the
/// entry's back-reference, where the fault path needs it.
///
struct View {
    entry: Arc<MapEntry>,
    /// The window's span in bytes, fixed when the view is
    /// created.
    size: usize,
}

/// One address space.
///
pub struct Map {
    us: Weak<Map>,
    kernel: bool,
    /// The hardware translations.
    table: RwLock<Box<dyn AddressMapper>>,
    /// The views, keyed by base address.
    views: RwLock<BTreeMap<u64, View>>,
}

/// The kernel's address space.
///
static KERNEL_MAP: Once<Arc<Map>> = Once::new();

/// Builds the kernel's map over the kernel page tables.
/// Called once during memory bring-up, after
/// [`pagetable::set_kernel_tables`].
///
pub fn init_kernel_map() {
    KERNEL_MAP.call_once(|| Map::with_table(Box::new(KernelTables), true));
}

/// Returns the kernel's address space.
///
/// # Panics
///
/// `kern` will panic before [`init_kernel_map`]; boot order is part
/// of the contract.
///
pub fn kern() -> &'static Arc<Map> {
    KERNEL_MAP.get().expect("kernel map used before initialisation")
}

impl Map {
    /// Builds a map over the given address-space
    /// implementation.
    ///
    pub fn with_table(table: Box<dyn AddressMapper>, kernel: bool) -> Arc<Map> {
        Arc::new_cyclic(|us| Map {
            us: us.clone(),
            kernel,
            table: RwLock::new(table),
            views: RwLock::new(BTreeMap::new()),
        })
    }

    /// Builds a fresh user address space whose kernel half
    /// aliases the kernel map.
    ///
    /// Returns `None` if page table memory is exhausted.
    ///
    pub fn new_user() -> Option<Arc<Map>> {
        let handler = PteHandler::new(Some(&*kernel_tables().lock()))?;
        Some(Map::with_table(Box::new(handler), false))
    }

    /// Returns whether this is the kernel's map.
    ///
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Installs a view of `entry` into this address space.
    ///
    /// The window spans the entry's current length. Physically backed
    /// entries are mapped eagerly; anonymous entries map their
    /// already-faulted pages, plus everything else immediately when
    /// the entry asks for eager backing. Returns the window's base
    /// address.
    ///
    pub fn add(
        &self,
        entry: &Arc<MapEntry>,
        counter: &Arc<PageCounter>,
        placement: Placement,
        mask: VmFlags,
    ) -> Result<VirtAddr, MapFailure> {
        let length = entry.length();
        if length == 0 {
            return Err(MapFailure::BadSize);
        }

        let base;
        {
            let mut views = self.views.write();

            // One view per entry per map.
            if views.values().any(|view| Arc::ptr_eq(&view.entry, entry)) {
                return Err(MapFailure::Overlap);
            }

            base = match placement {
                Placement::Fixed(addr) => {
                    if !is_aligned(addr.as_u64() as usize, PAGE_SIZE) {
                        return Err(MapFailure::BadSize);
                    }
                    if overlaps(&views, addr.as_u64(), length as u64) {
                        return Err(MapFailure::Overlap);
                    }

                    addr
                }
                Placement::Search { start, end } => {
                    find_gap(&views, start, end, length).ok_or(MapFailure::NoSpace)?
                }
            };

            views.insert(
                base.as_u64(),
                View {
                    entry: entry.clone(),
                    size: length,
                },
            );
        }

        let map = self.us.upgrade().expect("map add during teardown");
        if let Err(failure) = entry.added_to_map(&map, base, mask) {
            // Unwind the partial installation.
            self.views.write().remove(&base.as_u64());
            entry.removed_from_map(self, base, length);
            return Err(failure);
        }

        // Eager backing: fault every page in up front.
        if entry.is_anon() && entry.flags().contains(VmFlags::NO_LAZY_ALLOC) {
            for index in 0..(length / PAGE_SIZE) {
                if !entry.fault_in(&map, base, index, counter) {
                    break;
                }
            }
        }

        Ok(base)
    }

    /// Removes `entry`'s view from this address space,
    /// withdrawing all of its translations.
    ///
    pub fn remove_entry(&self, entry: &Arc<MapEntry>) -> Result<(), MapFailure> {
        let (base, size) = {
            let mut views = self.views.write();
            let found = views
                .iter()
                .find(|(_, view)| Arc::ptr_eq(&view.entry, entry))
                .map(|(base, view)| (*base, view.size));

            match found {
                Some((base, size)) => {
                    views.remove(&base);
                    (VirtAddr::new(base), size)
                }
                None => return Err(MapFailure::NotFound),
            }
        };

        entry.removed_from_map(self, base, size);
        Ok(())
    }

    /// Removes raw translations for `[base, base+length)`,
    /// ignoring pages that are not mapped. Low-level; view
    /// bookkeeping is not consulted.
    ///
    pub fn unmap_range(&self, base: VirtAddr, length: usize) {
        let mut offset = 0;
        while offset < length {
            self.table_unmap(base + offset as u64);
            offset += PAGE_SIZE;
        }
    }

    /// Looks `virt` up in the hardware translations.
    ///
    pub fn get(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.table.read().translate(virt)
    }

    /// Returns whether `entry` is installed in this map.
    ///
    pub fn contains(&self, entry: &Arc<MapEntry>) -> bool {
        self.region_base(entry).is_some()
    }

    /// Returns the base address of `entry`'s window in this
    /// map.
    ///
    pub fn region_base(&self, entry: &Arc<MapEntry>) -> Option<VirtAddr> {
        let views = self.views.read();
        views
            .iter()
            .find(|(_, view)| Arc::ptr_eq(&view.entry, entry))
            .map(|(base, _)| VirtAddr::new(*base))
    }

    /// Returns the base, length and flags of `entry`'s
    /// mapping in this map.
    ///
    pub fn region_info(&self, entry: &Arc<MapEntry>) -> Option<(VirtAddr, usize, VmFlags)> {
        let base = self.region_base(entry)?;
        Some((base, entry.length(), entry.flags()))
    }

    /// Returns the entry whose window covers `virt`, and the
    /// offset of `virt` into it.
    ///
    pub fn find_region(&self, virt: VirtAddr) -> Option<(Arc<MapEntry>, usize)> {
        let views = self.views.read();
        let (base, view) = views.range(..=virt.as_u64()).next_back()?;
        let offset = (virt.as_u64() - base) as usize;
        if offset >= view.size {
            return None;
        }

        Some((view.entry.clone(), offset))
    }

    /// Attempts to resolve a page fault at `virt`.
    ///
    /// Newly allocated backing is charged to `counter`, the faulting
    /// task's page counter. Returns whether the fault was handled;
    /// an unhandled fault becomes a thread fault.
    ///
    pub fn handle_pagefault(
        &self,
        virt: VirtAddr,
        present: bool,
        write: bool,
        counter: &Arc<PageCounter>,
    ) -> bool {
        let covering = {
            let views = self.views.read();
            views
                .range(..=virt.as_u64())
                .next_back()
                .filter(|(base, view)| ((virt.as_u64() - *base) as usize) < view.size)
                .map(|(base, view)| (VirtAddr::new(*base), view.entry.clone()))
        };

        match covering {
            Some((base, entry)) => {
                let map = self.us.upgrade().expect("fault during map teardown");
                let offset = (virt.as_u64() - base.as_u64()) as usize;
                entry.handle_pagefault(&map, base, offset, present, write, counter)
            }
            None => false,
        }
    }

    /// Switches the calling core to this address space.
    ///
    pub fn activate(&self) {
        self.table.read().activate();
    }

    /// Returns whether this address space is installed on
    /// the calling core.
    ///
    pub fn is_active(&self) -> bool {
        self.table.read().is_active()
    }

    // The entry callbacks drive the hardware table through
    // these.

    pub(crate) fn table_map(
        &self,
        phys: PhysAddr,
        virt: VirtAddr,
        flags: PageFlags,
    ) -> Result<(), MapFailure> {
        match self.table.write().map_page(phys, virt, flags) {
            Ok(()) => Ok(()),
            // An existing translation for the same window is
            // idempotent; racing faults hit this.
            Err(MapError::AlreadyMapped) => Ok(()),
            Err(MapError::NoMemory) => Err(MapFailure::NoMemory),
        }
    }

    pub(crate) fn table_unmap(&self, virt: VirtAddr) {
        let _ = self.table.write().unmap_page(virt);
    }

    pub(crate) fn zero_frame(&self, phys: PhysAddr) {
        self.table.write().zero_frame(phys);
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        // Withdraw the views in reverse order; the page
        // tables themselves are torn down last, when the
        // table box drops.
        let views: alloc::vec::Vec<(u64, View)> = {
            let mut views = self.views.write();
            let keys: alloc::vec::Vec<u64> = views.keys().rev().copied().collect();
            keys.into_iter()
                .map(|key| {
                    let view = views.remove(&key).unwrap();
                    (key, view)
                })
                .collect()
        };

        for (base, view) in views {
            view.entry
                .removed_from_map(self, VirtAddr::new(base), view.size);
        }
    }
}

/// Returns whether `[base, base+length)` intersects any
/// existing view.
///
fn overlaps(views: &BTreeMap<u64, View>, base: u64, length: u64) -> bool {
    // A view starting inside the window?
    if views.range(base..base + length).next().is_some() {
        return true;
    }

    // A view starting below that runs into it?
    if let Some((below, view)) = views.range(..base).next_back() {
        if below + view.size as u64 > base {
            return true;
        }
    }

    false
}

/// Scans `[start, end)` upwards for the first hole of
/// `length` bytes.
///
fn find_gap(
    views: &BTreeMap<u64, View>,
    start: VirtAddr,
    end: VirtAddr,
    length: usize,
) -> Option<VirtAddr> {
    let mut candidate = align_up(start.as_u64() as usize, PAGE_SIZE) as u64;
    let length = length as u64;

    for (base, view) in views.iter() {
        let view_end = base + view.size as u64;
        if view_end <= candidate {
            continue;
        }

        if candidate + length <= *base {
            break;
        }

        candidate = view_end;
    }

    if candidate + length <= end.as_u64() {
        Some(VirtAddr::new(candidate))
    } else {
        None
    }
}

/// The kernel map's address-space implementation: an
/// adapter over the shared kernel page tables.
///
struct KernelTables;

impl AddressMapper for KernelTables {
    fn map_page(
        &mut self,
        phys: PhysAddr,
        virt: VirtAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        kernel_tables().lock().map_page(phys, virt, flags)
    }

    fn unmap_page(&mut self, virt: VirtAddr) -> Result<PhysAddr, pagetable::UnmapError> {
        kernel_tables().lock().unmap_page(virt)
    }

    fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        kernel_tables().lock().translate(virt)
    }

    fn zero_frame(&mut self, phys: PhysAddr) {
        unsafe { core::ptr::write_bytes(phys_to_virt_addr(phys).as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
    }

    fn activate(&self) {
        kernel_tables().lock().activate();
    }

    fn is_active(&self) -> bool {
        kernel_tables().lock().is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Mutex;

    /// A map-backed address space for tests. Test "physical"
    /// addresses are real host pointers into an arena, so
    /// zeroing and data access work for real.
    ///
    struct FakeMapper {
        translations: Mutex<BTreeMap<u64, (u64, PageFlags)>>,
        active: AtomicBool,
    }

    impl FakeMapper {
        fn new() -> FakeMapper {
            FakeMapper {
                translations: Mutex::new(BTreeMap::new()),
                active: AtomicBool::new(false),
            }
        }
    }

    impl AddressMapper for FakeMapper {
        fn map_page(
            &mut self,
            phys: PhysAddr,
            virt: VirtAddr,
            flags: PageFlags,
        ) -> Result<(), MapError> {
            let mut translations = self.translations.lock();
            if translations.contains_key(&virt.as_u64()) {
                return Err(MapError::AlreadyMapped);
            }

            translations.insert(virt.as_u64(), (phys.as_u64(), flags));
            Ok(())
        }

        fn unmap_page(&mut self, virt: VirtAddr) -> Result<PhysAddr, pagetable::UnmapError> {
            self.translations
                .lock()
                .remove(&virt.as_u64())
                .map(|(phys, _)| PhysAddr::new(phys))
                .ok_or(pagetable::UnmapError::NotMapped)
        }

        fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
            self.translations
                .lock()
                .get(&virt.as_u64())
                .map(|(phys, flags)| (PhysAddr::new(*phys), *flags))
        }

        fn zero_frame(&mut self, phys: PhysAddr) {
            // Test physical addresses are host pointers.
            unsafe { core::ptr::write_bytes(phys.as_u64() as *mut u8, 0, PAGE_SIZE) };
        }

        fn activate(&self) {
            self.active.store(true, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    /// Registers one identity arena with the global physical
    /// allocator, shared by every test in this crate.
    ///
    fn setup_physmem() {
        static INIT: spin::Once<()> = spin::Once::new();
        INIT.call_once(|| {
            const ARENA: usize = 24 * 1024 * 1024;
            let arena = vec![0u64; ARENA / 8].into_boxed_slice();
            let raw = alloc::boxed::Box::leak(arena).as_ptr() as usize;

            // Align the region inside the arena so block
            // tiling sees naturally aligned addresses.
            let base = align_up(raw, 4 * 1024 * 1024);
            let length = (raw + ARENA - base) & !(PAGE_SIZE - 1);

            let added = unsafe { physmem::add_region(PhysAddr::new(base as u64), length, base) };
            assert!(added);
        });
    }

    fn test_map() -> Arc<Map> {
        setup_physmem();
        Map::with_table(Box::new(FakeMapper::new()), false)
    }

    fn rw() -> VmFlags {
        VmFlags::READ | VmFlags::WRITE
    }

    const BASE_A: u64 = 0x9000_0000;
    const BASE_B: u64 = 0x5000_0000;

    #[test]
    fn views_never_overlap() {
        let map = test_map();
        let counter = PageCounter::new();

        let first = MapEntry::make_anon(4 * PAGE_SIZE, rw(), false);
        let base = map
            .add(&first, &counter, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();
        assert_eq!(base.as_u64(), BASE_A);

        // Any window touching the existing view is refused.
        for overlap in [
            BASE_A,
            BASE_A + PAGE_SIZE as u64,
            BASE_A - PAGE_SIZE as u64,
            BASE_A + 3 * PAGE_SIZE as u64,
        ]
        .iter()
        {
            let second = MapEntry::make_anon(2 * PAGE_SIZE, rw(), false);
            let result = map.add(
                &second,
                &counter,
                Placement::Fixed(VirtAddr::new(*overlap)),
                VmFlags::empty(),
            );
            assert_eq!(result, Err(MapFailure::Overlap), "window at {:#x}", overlap);
        }

        // A disjoint window is fine.
        let second = MapEntry::make_anon(2 * PAGE_SIZE, rw(), false);
        let base = map
            .add(
                &second,
                &counter,
                Placement::Fixed(VirtAddr::new(BASE_A + 4 * PAGE_SIZE as u64)),
                VmFlags::empty(),
            )
            .unwrap();
        assert_eq!(base.as_u64(), BASE_A + 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn search_placement_scans_upwards() {
        let map = test_map();
        let counter = PageCounter::new();

        // Occupy [BASE_B + 2 pages, BASE_B + 4 pages).
        let blocker = MapEntry::make_anon(2 * PAGE_SIZE, rw(), false);
        map.add(
            &blocker,
            &counter,
            Placement::Fixed(VirtAddr::new(BASE_B + 2 * PAGE_SIZE as u64)),
            VmFlags::empty(),
        )
        .unwrap();

        // A two-page search fits below the blocker.
        let small = MapEntry::make_anon(2 * PAGE_SIZE, rw(), false);
        let base = map
            .add(
                &small,
                &counter,
                Placement::Search {
                    start: VirtAddr::new(BASE_B),
                    end: VirtAddr::new(BASE_B + 0x100_0000),
                },
                VmFlags::empty(),
            )
            .unwrap();
        assert_eq!(base.as_u64(), BASE_B);

        // A four-page search lands after the blocker.
        let large = MapEntry::make_anon(4 * PAGE_SIZE, rw(), false);
        let base = map
            .add(
                &large,
                &counter,
                Placement::Search {
                    start: VirtAddr::new(BASE_B),
                    end: VirtAddr::new(BASE_B + 0x100_0000),
                },
                VmFlags::empty(),
            )
            .unwrap();
        assert_eq!(base.as_u64(), BASE_B + 4 * PAGE_SIZE as u64);

        // A search range with no room fails.
        let hopeless = MapEntry::make_anon(16 * PAGE_SIZE, rw(), false);
        let result = map.add(
            &hopeless,
            &counter,
            Placement::Search {
                start: VirtAddr::new(BASE_B),
                end: VirtAddr::new(BASE_B + 8 * PAGE_SIZE as u64),
            },
            VmFlags::empty(),
        );
        assert_eq!(result, Err(MapFailure::NoSpace));
    }

    #[test]
    fn anon_faults_allocate_once() {
        let map = test_map();
        let counter = PageCounter::new();

        let entry = MapEntry::make_anon(8 * PAGE_SIZE, rw(), false);
        let base = map
            .add(&entry, &counter, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();

        // Nothing is resident before the first touch.
        assert!(map.get(base).is_none());
        assert_eq!(entry.owned_page_count(), 0);

        // Fault the first page, then a page in the middle.
        assert!(map.handle_pagefault(base, false, true, &counter));
        assert!(map.handle_pagefault(base + 0x5000u64, false, false, &counter));
        assert_eq!(entry.owned_page_count(), 2);
        assert_eq!(counter.count(), 2);

        // Faulting the same address again allocates nothing
        // further.
        assert!(map.handle_pagefault(base, false, true, &counter));
        assert!(map.handle_pagefault(base + 0x5234u64, false, false, &counter));
        assert_eq!(entry.owned_page_count(), 2);
        assert_eq!(counter.count(), 2);

        // The resident translations are page-aligned and
        // distinct.
        let (first, _) = map.get(base).unwrap();
        let (second, _) = map.get(base + 0x5000u64).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.as_u64() % PAGE_SIZE as u64, 0);

        // The fresh page was zeroed.
        let bytes = unsafe { core::slice::from_raw_parts(first.as_u64() as *const u8, PAGE_SIZE) };
        assert!(bytes.iter().all(|&byte| byte == 0));

        // Faults outside every view, or marked present, are
        // not handled.
        assert!(!map.handle_pagefault(VirtAddr::new(0x100_0000), false, false, &counter));
        assert!(!map.handle_pagefault(base, true, true, &counter));
    }

    #[test]
    fn shared_entry_shares_pages() {
        let map_a = test_map();
        let map_b = test_map();
        let counter_a = PageCounter::new();
        let counter_b = PageCounter::new();

        let entry = MapEntry::make_anon(4 * PAGE_SIZE, rw(), false);
        let base_a = map_a
            .add(&entry, &counter_a, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();

        // Task A faults page 0 in and writes to it.
        assert!(map_a.handle_pagefault(base_a, false, true, &counter_a));
        let (phys, _) = map_a.get(base_a).unwrap();
        unsafe {
            core::ptr::copy_nonoverlapping(b"PING".as_ptr(), phys.as_u64() as *mut u8, 4);
        }

        // Task B maps the same entry at a different base;
        // the already-faulted page arrives with the view.
        let base_b = map_b
            .add(&entry, &counter_b, Placement::Fixed(VirtAddr::new(BASE_B)), VmFlags::empty())
            .unwrap();
        let (phys_b, _) = map_b.get(base_b).unwrap();
        assert_eq!(phys, phys_b);

        // B reads exactly what A wrote, and no new page was
        // allocated on B's behalf.
        let bytes = unsafe { core::slice::from_raw_parts(phys_b.as_u64() as *const u8, 4) };
        assert_eq!(bytes, b"PING");
        assert_eq!(entry.owned_page_count(), 1);
        assert_eq!(counter_a.count(), 1);
        assert_eq!(counter_b.count(), 0);

        // A fault taken through B's map on a fresh page is
        // charged to B.
        assert!(map_b.handle_pagefault(base_b + PAGE_SIZE as u64, false, true, &counter_b));
        assert_eq!(entry.owned_page_count(), 2);
        assert_eq!(counter_b.count(), 1);

        // And A sees that page on its next fault without a
        // further allocation.
        assert!(map_a.handle_pagefault(base_a + PAGE_SIZE as u64, false, false, &counter_a));
        assert_eq!(entry.owned_page_count(), 2);
        assert_eq!(counter_a.count(), 1);
    }

    #[test]
    fn phys_entries_map_eagerly() {
        setup_physmem();
        let map = test_map();
        let counter = PageCounter::new();

        // Back the entry with real pages so the identity
        // arithmetic below is meaningful.
        let backing = physmem::allocate(4).unwrap();
        let entry = MapEntry::make_phys(backing, 4 * PAGE_SIZE, rw(), false);
        let base = map
            .add(&entry, &counter, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();

        // Every page of the window is resident, and the
        // translation is base-plus-offset.
        for i in 0..4u64 {
            let (phys, _) = map.get(base + i * PAGE_SIZE as u64).unwrap();
            assert_eq!(phys.as_u64(), backing.as_u64() + i * PAGE_SIZE as u64);
        }

        // Phys entries never fault.
        assert!(!map.handle_pagefault(base, false, true, &counter));

        map.remove_entry(&entry).unwrap();
        assert!(map.get(base).is_none());
        drop(entry);
        unsafe { physmem::deallocate(backing, 4) };
    }

    #[test]
    fn resize_trims_all_maps() {
        let map_a = test_map();
        let map_b = test_map();
        let counter = PageCounter::new();

        let entry = MapEntry::make_anon(6 * PAGE_SIZE, rw(), false);
        let base_a = map_a
            .add(&entry, &counter, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();
        let base_b = map_b
            .add(&entry, &counter, Placement::Fixed(VirtAddr::new(BASE_B)), VmFlags::empty())
            .unwrap();

        // Fault pages 0 and 4 through A.
        assert!(map_a.handle_pagefault(base_a, false, true, &counter));
        assert!(map_a.handle_pagefault(base_a + 4 * PAGE_SIZE as u64, false, true, &counter));
        assert!(map_b.handle_pagefault(base_b + 4 * PAGE_SIZE as u64, false, false, &counter));
        assert_eq!(entry.owned_page_count(), 2);

        // Shrink below page 4: the page vanishes from both
        // address spaces and the accounting drops.
        entry.resize(2 * PAGE_SIZE).unwrap();
        assert_eq!(entry.length(), 2 * PAGE_SIZE);
        assert_eq!(entry.owned_page_count(), 1);
        assert_eq!(counter.count(), 1);
        assert!(map_a.get(base_a + 4 * PAGE_SIZE as u64).is_none());
        assert!(map_b.get(base_b + 4 * PAGE_SIZE as u64).is_none());
        assert!(map_a.get(base_a).is_some());

        // Faults beyond the new end are refused.
        assert!(!map_a.handle_pagefault(base_a + 3 * PAGE_SIZE as u64, false, true, &counter));

        // Growing restores the logical length but no pages.
        entry.resize(6 * PAGE_SIZE).unwrap();
        assert_eq!(entry.length(), 6 * PAGE_SIZE);
        assert_eq!(entry.owned_page_count(), 1);

        // Bad sizes are rejected.
        assert_eq!(entry.resize(0), Err(MapFailure::BadSize));
        assert_eq!(entry.resize(PAGE_SIZE + 7), Err(MapFailure::BadSize));
    }

    #[test]
    fn update_flags_applies_to_new_faults() {
        let map = test_map();
        let counter = PageCounter::new();

        let entry = MapEntry::make_anon(4 * PAGE_SIZE, rw(), false);
        let base = map
            .add(&entry, &counter, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();

        assert!(map.handle_pagefault(base, false, true, &counter));
        let (_, flags) = map.get(base).unwrap();
        assert!(flags.contains(PageFlags::WRITE));

        // Drop the write permission; already-resident pages
        // keep their translation, new faults come in
        // read-only.
        entry.update_flags(VmFlags::READ);
        assert!(map.handle_pagefault(base + PAGE_SIZE as u64, false, false, &counter));

        let (_, old) = map.get(base).unwrap();
        assert!(old.contains(PageFlags::WRITE));
        let (_, new) = map.get(base + PAGE_SIZE as u64).unwrap();
        assert!(!new.contains(PageFlags::WRITE));
    }

    #[test]
    fn find_region_reports_offsets() {
        let map = test_map();
        let counter = PageCounter::new();

        let entry = MapEntry::make_anon(4 * PAGE_SIZE, rw(), false);
        let base = map
            .add(&entry, &counter, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();

        let (found, offset) = map.find_region(base + 0x1234u64).unwrap();
        assert!(Arc::ptr_eq(&found, &entry));
        assert_eq!(offset, 0x1234);

        assert!(map.find_region(base - 1u64).is_none());
        assert!(map.find_region(base + 4 * PAGE_SIZE as u64).is_none());

        assert!(map.contains(&entry));
        assert_eq!(map.region_base(&entry), Some(base));
        let (info_base, info_len, info_flags) = map.region_info(&entry).unwrap();
        assert_eq!(info_base, base);
        assert_eq!(info_len, 4 * PAGE_SIZE);
        assert_eq!(info_flags, rw());
    }

    #[test]
    fn eager_backing_populates_at_map_time() {
        let map = test_map();
        let counter = PageCounter::new();

        let entry = MapEntry::make_anon(4 * PAGE_SIZE, rw() | VmFlags::NO_LAZY_ALLOC, false);
        let base = map
            .add(&entry, &counter, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();

        assert_eq!(entry.owned_page_count(), 4);
        assert_eq!(counter.count(), 4);
        for i in 0..4u64 {
            assert!(map.get(base + i * PAGE_SIZE as u64).is_some());
        }
    }

    #[test]
    fn dropping_map_releases_views() {
        let map = test_map();
        let counter = PageCounter::new();

        let entry = MapEntry::make_anon(2 * PAGE_SIZE, rw(), false);
        let base = map
            .add(&entry, &counter, Placement::Fixed(VirtAddr::new(BASE_A)), VmFlags::empty())
            .unwrap();
        assert!(map.handle_pagefault(base, false, true, &counter));

        drop(map);

        // The entry survives its mapping and keeps its
        // page; accounting is untouched until the entry
        // itself goes.
        assert_eq!(entry.owned_page_count(), 1);
        assert_eq!(counter.count(), 1);

        drop(entry);
        assert_eq!(counter.count(), 0);
    }
}
