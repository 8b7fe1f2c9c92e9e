// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Hardware page table manipulation.
//!
//! [`PteHandler`] owns one address space's 4-level page table tree.
//! Intermediate tables are allocated from the physical allocator and
//! reached through the physical memory aperture. A handler built from
//! a reference handler aliases the reference's kernel half, so every
//! address space shares the kernel's upper-half page tables.
//!
//! The [`AddressMapper`] trait captures the mapping contract the
//! virtual memory layer programs against: install or remove one leaf
//! translation, translate a virtual address, and switch the address
//! space onto the calling core. `PteHandler` is its hardware
//! implementation; tests elsewhere substitute a map-backed fake.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use bitflags::bitflags;
use memlayout::phys_to_virt_addr;
use spin::{Mutex, Once};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

bitflags! {
    /// The attributes of one page mapping.
    ///
    pub struct PageFlags: u64 {
        /// The page is writable.
        const WRITE = 1 << 0;
        /// The page is executable.
        const EXEC = 1 << 1;
        /// The translation survives address space switches.
        const GLOBAL = 1 << 2;
        /// The page is accessible from user mode.
        const USER = 1 << 3;
        /// Caching is disabled for the page.
        const NO_CACHE = 1 << 4;
        /// The page uses write-through caching.
        const WRITE_THROUGH = 1 << 5;
    }
}

/// A failure to install a translation.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// The virtual address already has a translation.
    AlreadyMapped,
    /// An intermediate table could not be allocated.
    NoMemory,
}

/// A failure to remove a translation.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmapError {
    /// The virtual address has no translation.
    NotMapped,
}

/// The mapping contract of one address space.
///
/// The virtual memory layer drives its address spaces exclusively
/// through this trait.
///
pub trait AddressMapper: Send + Sync {
    /// Installs a translation from `virt` to `phys`.
    ///
    fn map_page(&mut self, phys: PhysAddr, virt: VirtAddr, flags: PageFlags)
        -> Result<(), MapError>;

    /// Removes the translation at `virt`, returning the
    /// physical address it mapped.
    ///
    fn unmap_page(&mut self, virt: VirtAddr) -> Result<PhysAddr, UnmapError>;

    /// Returns the physical address and flags mapped at
    /// `virt`, or `None`.
    ///
    fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)>;

    /// Zeroes the physical frame at `phys` through this
    /// implementation's access to physical memory. Used to scrub
    /// anonymous pages before they become visible.
    ///
    fn zero_frame(&mut self, phys: PhysAddr);

    /// Installs this address space on the calling core.
    ///
    fn activate(&self);

    /// Returns whether this address space is installed on
    /// the calling core.
    ///
    fn is_active(&self) -> bool;
}

/// The kernel's own page tables, shared by reference with
/// every address space's kernel half.
///
static KERNEL_TABLES: Once<Mutex<PteHandler>> = Once::new();

/// Hands the kernel's page tables to this crate. Called once during
/// memory bring-up, before any other address space is built.
///
/// # Panics
///
/// `set_kernel_tables` will panic if called more than once.
///
pub fn set_kernel_tables(handler: PteHandler) {
    let mut stored = false;
    KERNEL_TABLES.call_once(|| {
        stored = true;
        Mutex::new(handler)
    });

    if !stored {
        panic!("kernel page tables already initialised");
    }
}

/// Returns the kernel's page tables.
///
/// # Panics
///
/// `kernel_tables` will panic if called before
/// [`set_kernel_tables`]; boot order is part of the contract.
///
pub fn kernel_tables() -> &'static Mutex<PteHandler> {
    KERNEL_TABLES
        .get()
        .expect("kernel page tables used before initialisation")
}

/// The hardware page tables of one address space.
///
pub struct PteHandler {
    pml4: PhysFrame,
}

// PML4 indices 256..512 cover the kernel half of the
// address space.
const KERNEL_HALF_START: usize = 256;

unsafe fn table_at(frame: PhysFrame) -> &'static mut PageTable {
    &mut *(phys_to_virt_addr(frame.start_address()).as_mut_ptr::<PageTable>())
}

fn new_table() -> Option<PhysFrame> {
    let frame = physmem::allocate_page()?;
    let frame = PhysFrame::from_start_address(frame).ok()?;
    unsafe { table_at(frame).zero() };

    Some(frame)
}

impl PteHandler {
    /// Builds an empty address space.
    ///
    /// With a `reference` handler, the new address space aliases the
    /// reference's kernel half: the upper 256 PML4 entries are copied,
    /// so the kernel's intermediate tables are shared rather than
    /// duplicated.
    ///
    /// Returns `None` if the top-level table cannot be allocated.
    ///
    pub fn new(reference: Option<&PteHandler>) -> Option<PteHandler> {
        let pml4 = new_table()?;

        if let Some(reference) = reference {
            let src = unsafe { table_at(reference.pml4) };
            let dst = unsafe { table_at(pml4) };
            for i in KERNEL_HALF_START..512 {
                if !src[i].is_unused() {
                    dst[i].set_addr(src[i].addr(), src[i].flags());
                }
            }
        }

        Some(PteHandler { pml4 })
    }

    /// Adopts the currently installed page tables. Used once at boot
    /// to wrap the tables the boot protocol handed over.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other handler owns these tables.
    ///
    pub unsafe fn current() -> PteHandler {
        let (frame, _) = Cr3::read();
        PteHandler { pml4: frame }
    }

    /// Returns the physical address of the top-level table.
    ///
    pub fn root(&self) -> PhysAddr {
        self.pml4.start_address()
    }

    /// Walks to the leaf table covering `virt`, optionally
    /// allocating missing intermediate tables.
    ///
    fn leaf_table(&self, virt: VirtAddr, create: bool) -> Option<&'static mut PageTable> {
        let indices = [
            u16::from(virt.p4_index()) as usize,
            u16::from(virt.p3_index()) as usize,
            u16::from(virt.p2_index()) as usize,
        ];

        let user = virt.as_u64() < 0xffff_8000_0000_0000;
        let mut table = unsafe { table_at(self.pml4) };
        for &index in indices.iter() {
            let entry = &mut table[index];
            if entry.is_unused() {
                if !create {
                    return None;
                }

                let frame = new_table()?;
                let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
                if user {
                    flags |= PageTableFlags::USER_ACCESSIBLE;
                }
                entry.set_addr(frame.start_address(), flags);
            } else if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                // Huge mappings are never installed by this
                // handler.
                return None;
            }

            let frame = PhysFrame::from_start_address(entry.addr()).ok()?;
            table = unsafe { table_at(frame) };
        }

        Some(table)
    }

    fn leaf_entry(&self, virt: VirtAddr) -> Option<&'static mut PageTableEntry> {
        let table = self.leaf_table(virt, false)?;
        let entry = &mut table[u16::from(virt.p1_index()) as usize];
        if entry.is_unused() {
            return None;
        }

        Some(entry)
    }

    /// Invalidates the translation for `virt` if this
    /// address space is installed.
    ///
    fn flush(&self, virt: VirtAddr) {
        if self.is_active() {
            x86_64::instructions::tlb::flush(virt);
        }
    }
}

impl AddressMapper for PteHandler {
    fn map_page(
        &mut self,
        phys: PhysAddr,
        virt: VirtAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let table = self.leaf_table(virt, true).ok_or(MapError::NoMemory)?;
        let entry = &mut table[u16::from(virt.p1_index()) as usize];
        if !entry.is_unused() {
            return Err(MapError::AlreadyMapped);
        }

        let mut hw = PageTableFlags::PRESENT;
        if flags.contains(PageFlags::WRITE) {
            hw |= PageTableFlags::WRITABLE;
        }
        if !flags.contains(PageFlags::EXEC) {
            hw |= PageTableFlags::NO_EXECUTE;
        }
        if flags.contains(PageFlags::GLOBAL) {
            hw |= PageTableFlags::GLOBAL;
        }
        if flags.contains(PageFlags::USER) {
            hw |= PageTableFlags::USER_ACCESSIBLE;
        }
        if flags.contains(PageFlags::NO_CACHE) {
            hw |= PageTableFlags::NO_CACHE;
        }
        if flags.contains(PageFlags::WRITE_THROUGH) {
            hw |= PageTableFlags::WRITE_THROUGH;
        }

        entry.set_addr(phys, hw);
        self.flush(virt);

        Ok(())
    }

    fn unmap_page(&mut self, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
        let entry = self.leaf_entry(virt).ok_or(UnmapError::NotMapped)?;
        let phys = entry.addr();
        entry.set_unused();
        self.flush(virt);

        Ok(phys)
    }

    fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let entry = self.leaf_entry(virt)?;
        let hw = entry.flags();

        let mut flags = PageFlags::empty();
        if hw.contains(PageTableFlags::WRITABLE) {
            flags |= PageFlags::WRITE;
        }
        if !hw.contains(PageTableFlags::NO_EXECUTE) {
            flags |= PageFlags::EXEC;
        }
        if hw.contains(PageTableFlags::GLOBAL) {
            flags |= PageFlags::GLOBAL;
        }
        if hw.contains(PageTableFlags::USER_ACCESSIBLE) {
            flags |= PageFlags::USER;
        }
        if hw.contains(PageTableFlags::NO_CACHE) {
            flags |= PageFlags::NO_CACHE;
        }
        if hw.contains(PageTableFlags::WRITE_THROUGH) {
            flags |= PageFlags::WRITE_THROUGH;
        }

        Some((entry.addr(), flags))
    }

    fn zero_frame(&mut self, phys: PhysAddr) {
        let virt = phys_to_virt_addr(phys);
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, memlayout::PAGE_SIZE) };
    }

    fn activate(&self) {
        unsafe { Cr3::write(self.pml4, Cr3Flags::empty()) };
    }

    fn is_active(&self) -> bool {
        Cr3::read().0 == self.pml4
    }
}

impl Drop for PteHandler {
    fn drop(&mut self) {
        // Free the user half's intermediate tables. Leaf
        // frames belong to the memory objects mapped here
        // and the kernel half's tables are shared; neither
        // is ours to free.
        let pml4 = unsafe { table_at(self.pml4) };
        for i in 0..KERNEL_HALF_START {
            let entry = &pml4[i];
            if entry.is_unused() {
                continue;
            }

            let pdpt = unsafe { table_at(PhysFrame::containing_address(entry.addr())) };
            for pdpe in pdpt.iter() {
                if pdpe.is_unused() {
                    continue;
                }

                let pdt = unsafe { table_at(PhysFrame::containing_address(pdpe.addr())) };
                for pde in pdt.iter() {
                    if !pde.is_unused() {
                        unsafe { physmem::deallocate_page(pde.addr()) };
                    }
                }

                unsafe { physmem::deallocate_page(pdpe.addr()) };
            }

            unsafe { physmem::deallocate_page(entry.addr()) };
        }

        unsafe { physmem::deallocate_page(self.pml4.start_address()) };
    }
}
