// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The Kestrel kernel.
//!
//! This crate ties the subsystems together: it drives the boot-order
//! initialisation (physical memory, then virtual memory, then the
//! heap, then scheduling, then handles), owns the syscall dispatch
//! table, routes processor faults, and carries the panic handler.
//!
//! The platform layer, which covers boot protocol parsing, interrupt
//! controller programming and timers, lives outside this tree. It hands the
//! kernel its RAM regions and controller through [`PlatformInfo`]
//! and calls in through a handful of entry points:
//!
//! - [`init`] once on the boot core, with memory reachable through
//!   the boot aperture;
//! - [`timer_interrupt`] from the timer tick;
//! - [`irq_interrupt`] from device interrupt vectors;
//! - [`page_fault`] and the other fault entries from the exception
//!   handlers;
//! - [`syscall_entry`] from the syscall trap; and
//! - [`run`] last, handing the boot context to the scheduler.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod fault;
mod panic;
pub mod sys;

pub use crate::fault::{general_fault, invalid_instruction, page_fault, protection_violation};

use interrupts::IrqController;
use memlayout::{PAGE_SIZE, REGION_INFO, REGION_INFO_STRIDE};
use multitasking::scheduler;
use multitasking::task::{self, Task};
use multitasking::thread::Thread;
use pagetable::{AddressMapper, PageFlags, PteHandler};
use serial::println;
use syscalls::SyscallArgs;
use x86_64::PhysAddr;

/// The kernel heap, grown from the anonymous page pool.
///
#[cfg(not(test))]
#[global_allocator]
static HEAP: heap::KernelHeap = heap::KernelHeap::empty();

#[cfg(test)]
static HEAP: heap::KernelHeap = heap::KernelHeap::empty();

/// One usable RAM region, as enumerated by the platform.
///
#[derive(Clone, Copy, Debug)]
pub struct BootMemoryRegion {
    /// Physical address of the first byte.
    pub base: u64,
    /// Length in bytes.
    pub length: usize,
}

/// Everything the platform hands the kernel at boot.
///
pub struct PlatformInfo<'boot> {
    /// The machine's usable RAM regions.
    pub memory_regions: &'boot [BootMemoryRegion],
    /// The virtual offset at which the boot protocol mapped
    /// physical memory, valid until [`init`] returns.
    pub boot_aperture: usize,
    /// The interrupt controller for this core.
    pub controller: &'static dyn IrqController,
    /// This core's id.
    pub core_id: u32,
    /// The platform timer's tick period.
    pub tick_period: time::Duration,
}

/// Brings the kernel up on the boot core.
///
/// Boot order is part of the contract: physical memory first, then
/// the kernel address space, then the heap, then the pools and the
/// scheduler, and the handle tables implicitly last. The boot
/// aperture must stay mapped until `init` returns; afterwards the
/// kernel uses only its own mappings.
///
/// # Panics
///
/// `init` will panic if no RAM region qualifies for the allocator,
/// or if any bring-up allocation fails; there is no kernel to return
/// to.
///
/// # Safety
///
/// Must be called exactly once, before any other entry point, with
/// accurate platform info.
///
pub unsafe fn init(info: &PlatformInfo) {
    cpu::set_core_id(info.core_id);
    serial::init();
    println!("kestrel: starting on core {}", info.core_id);

    // Physical memory. Regions too small to matter are
    // skipped.
    let mut added = 0;
    for region in info.memory_regions.iter() {
        let aperture = info.boot_aperture + region.base as usize;
        if physmem::add_region(PhysAddr::new(region.base), region.length, aperture) {
            added += 1;
        }
    }
    assert!(added > 0, "no usable physical memory regions");

    // The kernel address space: adopt the boot tables, then
    // alias their kernel half everywhere.
    pagetable::set_kernel_tables(PteHandler::current());
    virtmem::init_kernel_map();

    // The heap, fed by the anonymous page pool.
    HEAP.init();

    // Move each region's allocator bookkeeping into its
    // permanent window, after which the boot aperture is no
    // longer needed.
    remap_region_metadata();

    // Pools and scheduling.
    stackpool::init();
    time::set_tick_period(info.tick_period);
    task::init_kernel_task();
    scheduler::init_core();
    interrupts::init_core(info.controller);
    random::init();

    println!(
        "kestrel: {} free pages across {} regions",
        physmem::free_page_count(),
        added
    );
}

/// Maps every physical region's metadata into its
/// `REGION_INFO` window and retargets the region at it.
///
fn remap_region_metadata() {
    let mut tables = pagetable::kernel_tables().lock();

    for index in 0..physmem::MAX_REGIONS {
        let (base, length) = match physmem::metadata_range(index) {
            Some(range) => range,
            None => continue,
        };
        assert!(length <= REGION_INFO_STRIDE, "region metadata too large");

        let window = REGION_INFO.start() + (index * REGION_INFO_STRIDE) as u64;
        let mut offset = 0;
        while offset < length {
            tables
                .map_page(
                    base + offset as u64,
                    window + offset as u64,
                    PageFlags::WRITE | PageFlags::GLOBAL,
                )
                .expect("failed to map region metadata");
            offset += PAGE_SIZE;
        }

        unsafe { physmem::region_vm_available(index, window.as_u64() as usize) };
    }
}

/// Creates the root task: a fresh address space and one
/// kernel-mode thread at `entry`, ready to run.
///
/// # Panics
///
/// `spawn_root_task` will panic if the address space or thread
/// cannot be built; a kernel without its root task is useless.
///
pub fn spawn_root_task(name: &str, entry: fn(usize) -> !, arg: usize) -> alloc::sync::Arc<Task> {
    let map = virtmem::Map::new_user().expect("failed to build root address space");
    let root = Task::create(map, true);
    root.set_name(name);
    handles::make_task_handle(&root);

    let thread =
        Thread::kernel_thread(&root, name, entry, arg).expect("failed to create root thread");
    handles::make_thread_handle(&thread);

    root.set_state(multitasking::task::TaskState::Runnable);
    scheduler::current().mark_runnable(&thread);

    root
}

/// Hands the boot context to the scheduler. Never returns.
///
pub fn run() -> ! {
    scheduler::current().start()
}

/// The timer tick entry, called from the platform's timer
/// interrupt at clock IRQL.
///
pub fn timer_interrupt() {
    time::tick();
    scheduler::current().timer_tick();
}

/// The device interrupt entry: routes a vector's logical IRQ
/// through the core's registry.
///
pub fn irq_interrupt(vector: usize) {
    if vector < interrupts::FIRST_VECTOR {
        return;
    }

    interrupts::current().dispatch(vector - interrupts::FIRST_VECTOR);
}

/// The syscall entry: dispatches marshalled arguments to the
/// handler table.
///
pub fn syscall_entry(args: &SyscallArgs, code: usize) -> isize {
    sys::dispatch(args, code)
}
