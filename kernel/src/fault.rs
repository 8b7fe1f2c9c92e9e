// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Processor fault routing.
//!
//! The platform's exception handlers land here. Page faults are
//! offered to the faulting task's address space first, since a
//! non-present fault inside an anonymous mapping is simply lazy
//! allocation doing its job. Everything unhandled becomes a thread fault: the thread
//! is terminated, or its whole task for a general fault.

use multitasking::task::Task;
use multitasking::thread::{FaultType, Thread};
use serial::println;
use x86_64::VirtAddr;

/// Handles a page fault at `addr`.
///
/// Returns normally only when the fault was resolved by the VM
/// layer; otherwise the faulting thread (or its task) is terminated
/// and the call never returns.
///
/// # Panics
///
/// `page_fault` will panic on a fault taken with no current task,
/// i.e. a fault in the kernel's own bring-up path.
///
pub fn page_fault(addr: VirtAddr, present: bool, write: bool, pc: usize) {
    let task = match Task::current() {
        Some(task) => task,
        None => panic!(
            "page fault at {:p} (pc {:#x}) with no current task",
            addr, pc
        ),
    };

    if task.map().handle_pagefault(addr, present, write, task.pages()) {
        return;
    }

    println!(
        "unhandled page fault: task {} addr {:p} present={} write={}",
        task.pid(),
        addr,
        present,
        write
    );
    Thread::current().handle_fault(FaultType::UnhandledPagefault, pc);
}

/// Handles a general protection fault; always terminates the
/// containing task.
///
pub fn general_fault(pc: usize) -> ! {
    Thread::current().handle_fault(FaultType::General, pc)
}

/// Handles an invalid opcode fault.
///
pub fn invalid_instruction(pc: usize) -> ! {
    Thread::current().handle_fault(FaultType::InvalidInstruction, pc)
}

/// Handles a protection violation.
///
pub fn protection_violation(pc: usize) -> ! {
    Thread::current().handle_fault(FaultType::ProtectionViolation, pc)
}
