// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the kernel's virtual memory layout.
//!
//! This crate is the single place where the address space is carved
//! up. Each region is a [`VirtAddrRange`] with a prescribed purpose:
//!
//! - [`NULL_PAGE`]: reserved so null dereferences fault.
//! - [`USERSPACE`]: the lower half, used by user tasks.
//! - [`KERNEL_BINARY`]: where the kernel image is mapped.
//! - [`REGION_INFO`]: windows onto each physical region's allocator
//!   metadata, one stride per region.
//! - [`ANON_POOL`]: the kernel's anonymous page pool, from which the
//!   heap and slab-backed structures draw memory.
//! - [`KERNEL_STACKS`]: the kernel stack pool, divided into
//!   fixed-size slots with trailing guard pages.
//! - [`PHYSICAL_MEMORY`]: the aperture through which all physical
//!   memory is reachable at a fixed offset.
//!
//! The layout is summarised below:
//!
//! | Region             |           Start address |            Last address |      Size |
//! | ------------------ | ----------------------: | ----------------------: | --------: |
//! | [`NULL_PAGE`]      |                   `0x0` |             `0x1f_ffff` |     2 MiB |
//! | [`USERSPACE`]      |             `0x20_0000` |      `0x7fff_ffff_ffff` | < 128 TiB |
//! | [`KERNEL_BINARY`]  | `0xffff_8000_0000_0000` | `0xffff_8000_3fff_ffff` |     1 GiB |
//! | [`REGION_INFO`]    | `0xffff_8000_4000_0000` | `0xffff_8000_5fff_ffff` |   512 MiB |
//! | [`ANON_POOL`]      | `0xffff_8000_6000_0000` | `0xffff_8000_9fff_ffff` |     1 GiB |
//! | [`KERNEL_STACKS`]  | `0xffff_8000_a000_0000` | `0xffff_8000_bfff_ffff` |   512 MiB |
//! | [`PHYSICAL_MEMORY`]| `0xffff_8100_0000_0000` | `0xffff_feff_ffff_ffff` | < 127 TiB |

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

use core::fmt;
use x86_64::{PhysAddr, VirtAddr};

/// The platform page size, in bytes.
///
pub const PAGE_SIZE: usize = 4096;

/// A contiguous, inclusive range of virtual addresses.
///
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VirtAddrRange {
    first: VirtAddr,
    last: VirtAddr,
}

impl VirtAddrRange {
    /// Returns a new range from `start` to `end`, inclusive.
    ///
    pub const fn new(start: VirtAddr, end: VirtAddr) -> Self {
        VirtAddrRange {
            first: start,
            last: end,
        }
    }

    /// Returns the first address in the range.
    ///
    pub const fn start(&self) -> VirtAddr {
        self.first
    }

    /// Returns the last address in the range.
    ///
    pub const fn end(&self) -> VirtAddr {
        self.last
    }

    /// Returns the number of addresses in the range.
    ///
    pub fn size(&self) -> usize {
        (self.last.as_u64() - self.first.as_u64()) as usize + 1
    }

    /// Returns whether `addr` falls within the range.
    ///
    pub fn contains_addr(&self, addr: VirtAddr) -> bool {
        self.first <= addr && addr <= self.last
    }

    /// Returns whether `[start, start+len)` falls entirely
    /// within the range.
    ///
    pub fn contains_range(&self, start: VirtAddr, len: usize) -> bool {
        if len == 0 {
            return false;
        }

        match start.as_u64().checked_add(len as u64 - 1) {
            None => false,
            Some(last) => self.contains_addr(start) && last <= self.last.as_u64(),
        }
    }
}

impl fmt::Debug for VirtAddrRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:p}-{:p}", self.first, self.last)
    }
}

const fn addr(value: u64) -> VirtAddr {
    VirtAddr::new_truncate(value)
}

/// The first virtual pages, reserved so null pointer
/// dereferences cause a page fault.
///
pub const NULL_PAGE: VirtAddrRange = VirtAddrRange::new(addr(0), addr(0x1f_ffff));

/// The lower half of virtual memory, used by user tasks.
///
pub const USERSPACE: VirtAddrRange = VirtAddrRange::new(addr(0x20_0000), addr(0x7fff_ffff_ffff));

/// The higher half of virtual memory, used by the kernel.
///
pub const KERNELSPACE: VirtAddrRange =
    VirtAddrRange::new(addr(0xffff_8000_0000_0000), addr(0xffff_ffff_ffff_ffff));

/// The kernel binary is mapped within this range.
///
pub const KERNEL_BINARY: VirtAddrRange =
    VirtAddrRange::new(addr(0xffff_8000_0000_0000), addr(0xffff_8000_3fff_ffff));

/// Windows onto the physical regions' allocator metadata.
///
/// Each physical region is assigned one stride of this range, into
/// which its block bitmaps and descriptor slab are mapped once virtual
/// memory is available.
///
pub const REGION_INFO: VirtAddrRange =
    VirtAddrRange::new(addr(0xffff_8000_4000_0000), addr(0xffff_8000_5fff_ffff));

/// The size of each physical region's metadata window.
///
pub const REGION_INFO_STRIDE: usize = 32 * 1024 * 1024;

/// The kernel's anonymous page pool.
///
pub const ANON_POOL: VirtAddrRange =
    VirtAddrRange::new(addr(0xffff_8000_6000_0000), addr(0xffff_8000_9fff_ffff));

/// The kernel stack pool.
///
pub const KERNEL_STACKS: VirtAddrRange =
    VirtAddrRange::new(addr(0xffff_8000_a000_0000), addr(0xffff_8000_bfff_ffff));

/// The size of one kernel stack slot, including its guard
/// page.
///
pub const KERNEL_STACK_SIZE: usize = 128 * PAGE_SIZE;

/// The region into which all physical memory is mapped.
///
pub const PHYSICAL_MEMORY: VirtAddrRange =
    VirtAddrRange::new(addr(0xffff_8100_0000_0000), addr(0xffff_feff_ffff_ffff));

/// The offset at which all physical memory is mapped.
///
pub const PHYSICAL_MEMORY_OFFSET: u64 = 0xffff_8100_0000_0000;

/// Returns the virtual address at which the given physical
/// address can be accessed through the physical memory
/// aperture.
///
pub fn phys_to_virt_addr(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(PHYSICAL_MEMORY_OFFSET + phys.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_disjoint() {
        // The kernel windows must not overlap one another.
        let windows = [
            KERNEL_BINARY,
            REGION_INFO,
            ANON_POOL,
            KERNEL_STACKS,
            PHYSICAL_MEMORY,
        ];

        for (i, a) in windows.iter().enumerate() {
            for (j, b) in windows.iter().enumerate() {
                if i == j {
                    continue;
                }

                assert!(
                    !a.contains_addr(b.start()) && !a.contains_addr(b.end()),
                    "window {:?} overlaps {:?}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_range_queries() {
        assert!(USERSPACE.contains_addr(VirtAddr::new(0x20_0000)));
        assert!(!USERSPACE.contains_addr(VirtAddr::new(0x1000)));
        assert!(USERSPACE.contains_range(VirtAddr::new(0x20_0000), PAGE_SIZE));
        assert!(!USERSPACE.contains_range(VirtAddr::new(0x7fff_ffff_f000), 0x2000));
        assert!(!USERSPACE.contains_range(VirtAddr::new(0x20_0000), 0));

        assert_eq!(NULL_PAGE.size(), 0x20_0000);
        assert_eq!(KERNEL_STACKS.size() % KERNEL_STACK_SIZE, 0);
        assert_eq!(REGION_INFO.size() % REGION_INFO_STRIDE, 0);
    }

    #[test]
    fn test_phys_to_virt() {
        let phys = PhysAddr::new(0x1234_5000);
        let virt = phys_to_virt_addr(phys);
        assert_eq!(virt.as_u64(), PHYSICAL_MEMORY_OFFSET + 0x1234_5000);
        assert!(PHYSICAL_MEMORY.contains_addr(virt));
    }
}
