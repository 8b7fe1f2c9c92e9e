// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A single physical RAM region and its buddy bookkeeping.
//!
//! A region's metadata lives at the top of the region itself: first a
//! pool of block descriptors (with its own free bitmap), then one
//! allocation bitmap per order. The space below the metadata is tiled
//! into naturally aligned power-of-two blocks at construction and
//! handed out through per-order free lists.
//!
//! A block descriptor records a free block's region-relative address
//! and order. Free lists link descriptors by pool slot index, not by
//! pointer, so when the metadata moves to its permanent virtual
//! window only the region's aperture changes.

use align::{align_up, is_aligned, log2, max_aligned_order, order_for_pages};
use memlayout::PAGE_SIZE;
use pretty::Bytes;
use serial::println;
use x86_64::PhysAddr;

/// The number of block orders. A block of order `k` holds
/// `2^k` pages; the largest block is `2^(NUM_ORDERS-1)`
/// pages.
///
pub const NUM_ORDERS: usize = 10;

/// The largest order.
///
const TOP_ORDER: usize = NUM_ORDERS - 1;

/// The largest allocation the buddy allocator will attempt,
/// in pages.
///
pub const MAX_ALLOC_PAGES: usize = 1 << TOP_ORDER;

/// Extra block descriptors reserved beyond the worst case
/// of the initial tiling, to feed later splits and frees.
///
const DESCRIPTOR_RESERVE: usize = 512;

/// Marks the end of a free list.
///
const NO_BLOCK: u32 = u32::MAX;

/// Returns the size in bytes of a block of the given order.
///
fn block_bytes(order: usize) -> usize {
    PAGE_SIZE << order
}

/// A free block descriptor, stored in the region's
/// descriptor pool.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct Block {
    /// Region-relative byte offset of the block.
    addr: u64,
    /// Pool slot of the next free block of the same order,
    /// or `NO_BLOCK`.
    next: u32,
    /// The block's order.
    order: u16,
    _reserved: u16,
}

/// Per-order state: the free list head and the allocation
/// bitmap.
///
#[derive(Clone, Copy, Debug, Default)]
struct Order {
    /// Number of blocks of this order that fit in the
    /// region.
    num_blocks: usize,
    /// Region-relative offset of the order's allocation
    /// bitmap. A set bit marks an allocated block.
    bitmap_off: usize,
    /// Pool slot of the first free block, or `NO_BLOCK`.
    free_head: u32,
}

/// The descriptor pool's placement within the region.
///
#[derive(Clone, Copy, Debug)]
struct DescriptorPool {
    /// Region-relative offset of the pool's free bitmap.
    /// A set bit marks a free slot.
    bitmap_off: usize,
    /// Region-relative offset of the descriptor storage.
    storage_off: usize,
    /// Number of descriptor slots.
    num_slots: usize,
}

/// One physical RAM region under buddy management.
///
pub struct Region {
    /// Physical address of the first byte.
    base: PhysAddr,
    /// Length of the region, in bytes.
    length: usize,
    /// Region-relative offset at which the metadata starts;
    /// everything below is allocatable space.
    metadata_off: usize,
    /// Virtual address at which the metadata is currently
    /// reachable.
    metadata_va: usize,
    /// Whether the metadata has moved to its permanent
    /// window.
    retargeted: bool,

    orders: [Order; NUM_ORDERS],
    pool: DescriptorPool,

    /// Bytes of allocatable space tiled at construction.
    allocatable: usize,
}

impl Region {
    /// Returns whether a region of `length` bytes is worth
    /// managing: it must fit at least one block of the top
    /// order plus a slack for the metadata.
    ///
    pub fn can_allocate(length: usize) -> bool {
        length > block_bytes(TOP_ORDER) + 64 * 1024
    }

    /// Builds the buddy bookkeeping for a region.
    ///
    /// The allocation bitmaps and the descriptor pool are carved off
    /// the top of the region; the remaining space is walked bottom-up,
    /// at each step placing the largest naturally aligned block that
    /// fits on the corresponding free list.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive control of the described
    /// memory, and `early_aperture` must map the whole region
    /// read-write.
    ///
    /// # Panics
    ///
    /// `new` will panic if `base` or `length` is not page-aligned, or
    /// the region is too small (see [`Region::can_allocate`]).
    ///
    pub unsafe fn new(base: PhysAddr, length: usize, early_aperture: usize) -> Region {
        assert!(is_aligned(base.as_u64() as usize, PAGE_SIZE));
        assert!(is_aligned(length, PAGE_SIZE));
        assert!(Region::can_allocate(length));

        let pages = length / PAGE_SIZE;

        // Lay out the per-order allocation bitmaps, each
        // padded with a trailing overflow word.
        let mut orders = [Order::default(); NUM_ORDERS];
        let mut bitmap_total = 0;
        for (i, order) in orders.iter_mut().enumerate() {
            order.num_blocks = pages >> i;
            order.free_head = NO_BLOCK;
            if order.num_blocks == 0 {
                continue;
            }

            order.bitmap_off = bitmap_total;
            bitmap_total += align_up((order.num_blocks + 7) / 8 + 8, 8);
        }

        let bitmap_area = align_up(bitmap_total, PAGE_SIZE);
        let bitmap_off = length - bitmap_area;
        for order in orders.iter_mut() {
            if order.num_blocks != 0 {
                order.bitmap_off += bitmap_off;
            }
        }

        // Size the descriptor pool: the top-order block
        // count, a couple of partial blocks per order from
        // the tiling, and a reserve for later splits.
        let num_slots = (pages >> TOP_ORDER) + NUM_ORDERS * 2 + DESCRIPTOR_RESERVE;
        let pool_bitmap_bytes = align_up((num_slots + 7) / 8, 8);
        let pool_area = align_up(pool_bitmap_bytes + num_slots * core::mem::size_of::<Block>(), PAGE_SIZE);
        let pool_off = bitmap_off - pool_area;

        let pool = DescriptorPool {
            bitmap_off: pool_off,
            storage_off: pool_off + pool_bitmap_bytes,
            num_slots,
        };

        let mut region = Region {
            base,
            length,
            metadata_off: pool_off,
            metadata_va: early_aperture + pool_off,
            retargeted: false,
            orders,
            pool,
            allocatable: 0,
        };

        // Zero the metadata: bitmaps all-clear (nothing is
        // allocated), then mark every descriptor slot free.
        for off in region.metadata_off..region.length {
            region.ptr(off).write(0);
        }
        for slot in 0..num_slots {
            region.set_pool_bit(slot);
        }

        // Tile the allocatable space bottom-up.
        let mut offset = 0;
        while region.metadata_off - offset >= PAGE_SIZE {
            let remaining_pages = (region.metadata_off - offset) / PAGE_SIZE;
            let mut order = log2(remaining_pages);
            if order > TOP_ORDER {
                order = TOP_ORDER;
            }

            // Shrink until the block is naturally aligned
            // on its own size.
            let abs = base.as_u64() as usize + offset;
            if abs != 0 {
                order = max_aligned_order(abs, PAGE_SIZE, order);
            }

            let slot = region
                .alloc_descriptor()
                .expect("region tiling exhausted the descriptor pool");
            region.write_block(
                slot,
                Block {
                    addr: offset as u64,
                    next: NO_BLOCK,
                    order: order as u16,
                    _reserved: 0,
                },
            );
            region.push_free(order, slot);

            offset += block_bytes(order);
        }

        region.allocatable = offset;
        region
    }

    /// Returns whether `addr` falls in the region's
    /// allocatable space.
    ///
    pub fn owns(&self, addr: PhysAddr) -> bool {
        let base = self.base.as_u64();
        addr.as_u64() >= base && addr.as_u64() < base + self.metadata_off as u64
    }

    /// Returns the physical range holding the region's
    /// metadata.
    ///
    pub fn metadata_range(&self) -> (PhysAddr, usize) {
        (
            self.base + self.metadata_off as u64,
            self.length - self.metadata_off,
        )
    }

    /// Retargets the metadata at its permanent virtual
    /// window.
    ///
    /// # Safety
    ///
    /// `metadata_aperture` must map the range returned by
    /// [`Region::metadata_range`] read-write for the allocator's
    /// lifetime.
    ///
    /// # Panics
    ///
    /// `vm_available` will panic if called twice; the fixup is
    /// one-shot.
    ///
    pub unsafe fn vm_available(&mut self, metadata_aperture: usize) {
        assert!(!self.retargeted, "region metadata already retargeted");
        self.metadata_va = metadata_aperture;
        self.retargeted = true;
    }

    /// Attempts to allocate a block of `num_pages` pages,
    /// rounded up to the next power of two.
    ///
    pub fn alloc(&mut self, num_pages: usize) -> Option<PhysAddr> {
        if num_pages == 0 || num_pages > MAX_ALLOC_PAGES {
            return None;
        }

        self.alloc_order(order_for_pages(num_pages))
    }

    /// Allocates a block of exactly the given order.
    ///
    fn alloc_order(&mut self, want: usize) -> Option<PhysAddr> {
        // The fast path: a free block of the right size.
        if let Some(slot) = self.pop_free(want) {
            let block = self.read_block(slot);
            self.free_descriptor(slot);

            return Some(self.base + block.addr);
        }

        // Scan the larger orders for a block to split.
        let mut found = None;
        for order in (want + 1)..NUM_ORDERS {
            if let Some(slot) = self.pop_free(order) {
                found = Some(slot);
                break;
            }
        }

        let slot = found?;
        let block = self.read_block(slot);
        self.free_descriptor(slot);

        // Split the block down to the wanted order. At each
        // step the upper half goes back on the next-lower
        // free list and we keep the lower half.
        let addr = block.addr as usize;
        let mut order = block.order as usize;
        while order > want {
            order -= 1;

            let upper = addr + block_bytes(order);
            let slot = match self.alloc_descriptor() {
                Some(slot) => slot,
                // Out of descriptors mid-split; the block
                // being split is lost.
                None => return None,
            };

            self.write_block(
                slot,
                Block {
                    addr: upper as u64,
                    next: NO_BLOCK,
                    order: order as u16,
                    _reserved: 0,
                },
            );
            self.clear_order_bit(order, upper);
            self.push_free(order, slot);

            self.set_order_bit(order, addr);
        }

        Some(self.base + addr as u64)
    }

    /// Returns a block to the free lists, coalescing with
    /// its buddy where possible.
    ///
    /// # Panics
    ///
    /// `free` will panic if the block is not currently allocated, or
    /// if the descriptor pool is exhausted.
    ///
    pub fn free(&mut self, addr: PhysAddr, num_pages: usize) {
        assert!(self.owns(addr), "free of address outside region");

        let mut order = order_for_pages(num_pages);
        let mut offset = (addr.as_u64() - self.base.as_u64()) as usize;
        assert!(
            is_aligned(addr.as_u64() as usize, block_bytes(order)),
            "free of misaligned block {:#x}",
            addr.as_u64()
        );

        if !self.order_bit(order, offset) {
            panic!(
                "free of block {:#x} (order {}) that is not allocated",
                addr.as_u64(),
                order
            );
        }
        self.clear_order_bit(order, offset);

        // Merge with the buddy while it is also free. Blocks
        // tile naturally aligned on their absolute address,
        // so the buddy is found by toggling the order bit of
        // the absolute address. The bitmap gives the quick
        // answer; the free list walk confirms the buddy
        // really is an independent free block rather than
        // untiled space.
        let base = self.base.as_u64() as usize;
        while order < TOP_ORDER {
            let buddy_abs = (base + offset) ^ block_bytes(order);
            if buddy_abs < base {
                break;
            }

            let buddy = buddy_abs - base;
            if buddy >= self.metadata_off || self.order_bit(order, buddy) {
                break;
            }

            let buddy_slot = match self.unlink_free(order, buddy) {
                Some(slot) => slot,
                None => break,
            };
            self.free_descriptor(buddy_slot);

            offset = offset.min(buddy);
            order += 1;
            self.clear_order_bit(order, offset);
        }

        let slot = self
            .alloc_descriptor()
            .expect("free: descriptor pool exhausted");
        self.write_block(
            slot,
            Block {
                addr: offset as u64,
                next: NO_BLOCK,
                order: order as u16,
                _reserved: 0,
            },
        );
        self.push_free(order, slot);
    }

    /// Carves the page containing `addr` out of whichever
    /// free block covers it, and marks it allocated.
    ///
    /// Returns `false` if no free block covers the page.
    ///
    pub fn reserve(&mut self, addr: PhysAddr) -> bool {
        let target = align_down_page((addr.as_u64() - self.base.as_u64()) as usize);

        // Find and unlink the free block covering the page.
        let mut covering = None;
        'orders: for order in 0..NUM_ORDERS {
            let mut slot = self.orders[order].free_head;
            while slot != NO_BLOCK {
                let block = self.read_block(slot);
                let start = block.addr as usize;
                if start <= target && target < start + block_bytes(order) {
                    self.unlink_free(order, start);
                    covering = Some((start, order));
                    break 'orders;
                }

                slot = block.next;
            }
        }

        let (mut start, mut order) = match covering {
            Some(found) => found,
            None => return false,
        };

        // Split down to a single page, keeping the half
        // that covers the target.
        while order > 0 {
            order -= 1;

            let half = block_bytes(order);
            let other = if target < start + half {
                start + half
            } else {
                let other = start;
                start += half;
                other
            };

            let slot = self
                .alloc_descriptor()
                .expect("reserve: descriptor pool exhausted");
            self.write_block(
                slot,
                Block {
                    addr: other as u64,
                    next: NO_BLOCK,
                    order: order as u16,
                    _reserved: 0,
                },
            );
            self.clear_order_bit(order, other);
            self.push_free(order, slot);
        }

        self.set_order_bit(0, target);
        true
    }

    /// Returns the number of free pages in the region.
    ///
    pub fn free_page_count(&self) -> usize {
        let mut pages = 0;
        for order in 0..NUM_ORDERS {
            let mut slot = self.orders[order].free_head;
            while slot != NO_BLOCK {
                pages += 1 << order;
                slot = self.read_block(slot).next;
            }
        }

        pages
    }

    /// Prints the region's free lists.
    ///
    pub fn debug(&self) {
        println!(
            "  base {:#x}, {} allocatable",
            self.base.as_u64(),
            Bytes::from_usize(self.allocatable)
        );
        for order in 0..NUM_ORDERS {
            let mut blocks = 0;
            let mut slot = self.orders[order].free_head;
            while slot != NO_BLOCK {
                blocks += 1;
                slot = self.read_block(slot).next;
            }

            if blocks != 0 {
                println!(
                    "  order {:2}: {:4} free blocks ({})",
                    order,
                    blocks,
                    Bytes::from_usize(blocks * block_bytes(order))
                );
            }
        }
    }

    // Metadata access. All bookkeeping lives in the region
    // itself and is reached through the current aperture.

    fn ptr(&self, off: usize) -> *mut u8 {
        assert!(off >= self.metadata_off && off < self.length);
        (self.metadata_va + (off - self.metadata_off)) as *mut u8
    }

    fn descriptor_ptr(&self, slot: u32) -> *mut Block {
        assert!((slot as usize) < self.pool.num_slots);
        let off = self.pool.storage_off + slot as usize * core::mem::size_of::<Block>();
        self.ptr(off) as *mut Block
    }

    fn read_block(&self, slot: u32) -> Block {
        unsafe { self.descriptor_ptr(slot).read() }
    }

    fn write_block(&mut self, slot: u32, block: Block) {
        unsafe { self.descriptor_ptr(slot).write(block) };
    }

    // The descriptor pool's free bitmap: a set bit marks a
    // free slot.

    fn pool_bit(&self, slot: usize) -> bool {
        let byte = unsafe { self.ptr(self.pool.bitmap_off + slot / 8).read() };
        byte & (1 << (slot % 8)) != 0
    }

    fn set_pool_bit(&mut self, slot: usize) {
        let ptr = self.ptr(self.pool.bitmap_off + slot / 8);
        unsafe { ptr.write(ptr.read() | 1 << (slot % 8)) };
    }

    fn clear_pool_bit(&mut self, slot: usize) {
        let ptr = self.ptr(self.pool.bitmap_off + slot / 8);
        unsafe { ptr.write(ptr.read() & !(1 << (slot % 8))) };
    }

    /// Takes a free descriptor slot, or `None` if the pool
    /// is exhausted.
    ///
    fn alloc_descriptor(&mut self) -> Option<u32> {
        for slot in 0..self.pool.num_slots {
            if self.pool_bit(slot) {
                self.clear_pool_bit(slot);
                return Some(slot as u32);
            }
        }

        None
    }

    /// Returns a descriptor slot to the pool.
    ///
    /// # Panics
    ///
    /// `free_descriptor` will panic if the slot is already free.
    ///
    fn free_descriptor(&mut self, slot: u32) {
        assert!(
            !self.pool_bit(slot as usize),
            "descriptor {} is not allocated",
            slot
        );

        self.write_block(
            slot,
            Block {
                addr: 0,
                next: NO_BLOCK,
                order: 0,
                _reserved: 0,
            },
        );
        self.set_pool_bit(slot as usize);
    }

    // Per-order allocation bitmaps: a set bit marks an
    // allocated block.

    fn order_bit(&self, order: usize, offset: usize) -> bool {
        let index = offset / block_bytes(order);
        let byte = unsafe { self.ptr(self.orders[order].bitmap_off + index / 8).read() };
        byte & (1 << (index % 8)) != 0
    }

    fn set_order_bit(&mut self, order: usize, offset: usize) {
        let index = offset / block_bytes(order);
        let ptr = self.ptr(self.orders[order].bitmap_off + index / 8);
        unsafe { ptr.write(ptr.read() | 1 << (index % 8)) };
    }

    fn clear_order_bit(&mut self, order: usize, offset: usize) {
        let index = offset / block_bytes(order);
        let ptr = self.ptr(self.orders[order].bitmap_off + index / 8);
        unsafe { ptr.write(ptr.read() & !(1 << (index % 8))) };
    }

    // Free lists, linked by descriptor slot.

    /// Pushes a descriptor onto its order's free list.
    ///
    fn push_free(&mut self, order: usize, slot: u32) {
        let mut block = self.read_block(slot);
        block.next = self.orders[order].free_head;
        self.write_block(slot, block);
        self.orders[order].free_head = slot;
    }

    /// Pops the head of an order's free list and marks the
    /// block allocated.
    ///
    fn pop_free(&mut self, order: usize) -> Option<u32> {
        let slot = self.orders[order].free_head;
        if slot == NO_BLOCK {
            return None;
        }

        let block = self.read_block(slot);
        self.orders[order].free_head = block.next;
        self.set_order_bit(order, block.addr as usize);

        Some(slot)
    }

    /// Unlinks the free block at `offset` from its order's
    /// list, without marking it allocated. Returns the
    /// descriptor slot, or `None` if no such block is free.
    ///
    fn unlink_free(&mut self, order: usize, offset: usize) -> Option<u32> {
        let mut prev = NO_BLOCK;
        let mut slot = self.orders[order].free_head;

        while slot != NO_BLOCK {
            let block = self.read_block(slot);
            if block.addr as usize == offset {
                if prev == NO_BLOCK {
                    self.orders[order].free_head = block.next;
                } else {
                    let mut before = self.read_block(prev);
                    before.next = block.next;
                    self.write_block(prev, before);
                }

                return Some(slot);
            }

            prev = slot;
            slot = block.next;
        }

        None
    }
}

fn align_down_page(off: usize) -> usize {
    off & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate alloc;
    use alloc::vec;
    use alloc::vec::Vec;

    const TEST_BASE: u64 = 0x40_0000;
    const TEST_LEN: usize = 8 * 1024 * 1024;

    struct TestRegion {
        // Keeps the arena alive for the region's lifetime.
        _arena: Vec<u64>,
        region: Region,
    }

    fn test_region() -> TestRegion {
        let arena = vec![0u64; TEST_LEN / 8];
        let aperture = arena.as_ptr() as usize;
        let region = unsafe { Region::new(PhysAddr::new(TEST_BASE), TEST_LEN, aperture) };

        TestRegion {
            _arena: arena,
            region,
        }
    }

    #[test]
    fn qualification() {
        assert!(!Region::can_allocate(2 * 1024 * 1024));
        assert!(!Region::can_allocate(2 * 1024 * 1024 + 64 * 1024));
        assert!(Region::can_allocate(4 * 1024 * 1024));
    }

    #[test]
    fn single_page_round_trip() {
        let mut t = test_region();
        let before = t.region.free_page_count();
        assert!(before > 0);

        let addr = t.region.alloc(1).unwrap();
        assert!(t.region.owns(addr));
        assert_eq!(addr.as_u64() % PAGE_SIZE as u64, 0);
        assert_eq!(t.region.free_page_count(), before - 1);

        t.region.free(addr, 1);
        assert_eq!(t.region.free_page_count(), before);

        // The same address comes back out: coalescing
        // restored the original block shape.
        let again = t.region.alloc(1).unwrap();
        assert_eq!(again, addr);
        t.region.free(again, 1);
    }

    #[test]
    fn alignment_invariant() {
        let mut t = test_region();
        for &pages in &[1usize, 2, 3, 4, 5, 8, 17, 64, 100, 512] {
            let addr = t.region.alloc(pages).unwrap();
            let align = (PAGE_SIZE * pages.next_power_of_two()) as u64;
            assert_eq!(
                addr.as_u64() % align,
                0,
                "alloc({}) returned unaligned {:#x}",
                pages,
                addr.as_u64()
            );
            t.region.free(addr, pages);
        }
    }

    #[test]
    fn rejects_bad_sizes() {
        let mut t = test_region();
        assert!(t.region.alloc(0).is_none());
        assert!(t.region.alloc(MAX_ALLOC_PAGES + 1).is_none());
        assert!(t.region.alloc(MAX_ALLOC_PAGES).is_some());
    }

    #[test]
    fn split_and_coalesce() {
        let mut t = test_region();
        let before = t.region.free_page_count();

        // Many small allocations force larger blocks to
        // split.
        let mut held = vec![];
        for _ in 0..64 {
            held.push(t.region.alloc(3).unwrap());
        }
        assert_eq!(t.region.free_page_count(), before - 64 * 4);

        // All addresses are distinct and disjoint.
        for (i, a) in held.iter().enumerate() {
            for b in held.iter().skip(i + 1) {
                let gap = a.as_u64().max(b.as_u64()) - a.as_u64().min(b.as_u64());
                assert!(gap >= (4 * PAGE_SIZE) as u64);
            }
        }

        // Freeing everything coalesces back to the original
        // free page count.
        for addr in held {
            t.region.free(addr, 3);
        }
        assert_eq!(t.region.free_page_count(), before);

        // And a top-order allocation still succeeds.
        let big = t.region.alloc(MAX_ALLOC_PAGES).unwrap();
        t.region.free(big, MAX_ALLOC_PAGES);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut t = test_region();
        let mut held = vec![];
        while let Some(addr) = t.region.alloc(MAX_ALLOC_PAGES) {
            held.push(addr);
        }

        assert!(!held.is_empty());

        // Smaller requests may still succeed on leftover
        // fragments; drain those too.
        while let Some(addr) = t.region.alloc(1) {
            held.push(addr);
        }
        assert_eq!(t.region.free_page_count(), 0);
        assert!(t.region.alloc(1).is_none());
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn double_free_panics() {
        let mut t = test_region();
        let addr = t.region.alloc(1).unwrap();
        t.region.free(addr, 1);
        t.region.free(addr, 1);
    }

    #[test]
    fn reserve_excludes_page() {
        let mut t = test_region();
        let before = t.region.free_page_count();

        // Reserve a page in the middle of the region.
        let target = PhysAddr::new(TEST_BASE + 5 * PAGE_SIZE as u64);
        assert!(t.region.reserve(target));
        assert_eq!(t.region.free_page_count(), before - 1);

        // No allocation may return the reserved page.
        let mut held = vec![];
        while let Some(addr) = t.region.alloc(1) {
            assert_ne!(addr, target);
            held.push(addr);
        }

        for addr in held {
            t.region.free(addr, 1);
        }

        // Releasing the reservation restores the region.
        t.region.free(target, 1);
        assert_eq!(t.region.free_page_count(), before);

        // Reserving an already-allocated page fails.
        let addr = t.region.alloc(1).unwrap();
        assert!(!t.region.reserve(addr));
        t.region.free(addr, 1);
    }

    #[test]
    fn retarget_preserves_state() {
        // Build a region, move its metadata to a second
        // arena, and check the allocator still works.
        let arena = vec![0u64; TEST_LEN / 8];
        let aperture = arena.as_ptr() as usize;
        let mut region = unsafe { Region::new(PhysAddr::new(TEST_BASE), TEST_LEN, aperture) };

        let before = region.free_page_count();
        let held = region.alloc(8).unwrap();

        // Copy the metadata to its "permanent window" and
        // retarget the region, as the kernel does once its
        // address space is live.
        let (meta_base, meta_len) = region.metadata_range();
        let meta_off = (meta_base.as_u64() - TEST_BASE) as usize;
        let mut window = vec![0u64; meta_len / 8];
        unsafe {
            core::ptr::copy_nonoverlapping(
                (aperture + meta_off) as *const u8,
                window.as_mut_ptr() as *mut u8,
                meta_len,
            );
            region.vm_available(window.as_ptr() as usize);
        }

        assert_eq!(region.free_page_count(), before - 8);
        region.free(held, 8);
        assert_eq!(region.free_page_count(), before);

        drop(arena);
        let addr = region.alloc(1).unwrap();
        region.free(addr, 1);
    }
}
