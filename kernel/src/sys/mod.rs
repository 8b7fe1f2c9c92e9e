// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Syscall dispatch and argument handling.
//!
//! The architecture entry stub marshals up to four register
//! arguments into a [`SyscallArgs`] block and calls [`dispatch`]
//! with the raw code word. The low 16 bits of the code select the
//! handler; a few calls carry an extra immediate in the upper bits.
//!
//! Handlers return `Result<isize, Error>`; errors become the
//! negative values of [`syscalls::Error`] on the wire.
//!
//! User pointers are never trusted: every buffer is walked through
//! the calling task's address space and each page must be mapped
//! user-accessible before the kernel touches a byte of it.

mod irq;
mod misc;
mod notify;
mod port;
mod task;
mod thread;
mod vm;

use alloc::sync::Arc;
use alloc::vec::Vec;
use memlayout::PAGE_SIZE;
use multitasking::cpu_local;
use multitasking::task::Task;
use multitasking::thread::Thread;
use syscalls::{Error, Syscall, SyscallArgs};
use time::Instant;

/// Dispatches one syscall.
///
pub fn dispatch(args: &SyscallArgs, code: usize) -> isize {
    let call = match Syscall::from_usize(code & 0xffff) {
        Some(call) => call,
        None => return Error::InvalidSyscall.as_isize(),
    };

    let result = match call {
        Syscall::ThreadGetHandle => thread::get_handle(args),
        Syscall::ThreadYield => thread::yield_cpu(args),
        Syscall::ThreadUsleep => thread::usleep(args),
        Syscall::ThreadCreate => thread::create(args),
        Syscall::ThreadDestroy => thread::destroy(args),
        Syscall::ThreadSetPriority => thread::set_priority(args),
        Syscall::ThreadSetNoteMask => thread::set_note_mask(args),
        Syscall::ThreadSetName => thread::set_name(args),
        Syscall::ThreadResume => thread::resume(args),
        Syscall::ThreadJoin => thread::join(args),

        Syscall::TaskGetHandle => task::get_handle(args),
        Syscall::TaskCreate => task::create(args),
        Syscall::TaskTerminate => task::terminate(args),
        Syscall::TaskInitialize => task::initialize(args),
        Syscall::TaskSetName => task::set_name(args),
        Syscall::TaskDbgOut => task::dbg_out(args),

        Syscall::VmAllocPhys => vm::alloc_phys(args),
        Syscall::VmAllocAnon => vm::alloc_anon(args),
        Syscall::VmDealloc => vm::dealloc(args),
        Syscall::VmUpdatePermissions => vm::update_permissions(args),
        Syscall::VmResize => vm::resize(args),
        Syscall::VmMap => vm::map(args, code),
        Syscall::VmMapEx => vm::map_ex(args),
        Syscall::VmUnmap => vm::unmap(args),
        Syscall::VmRegionInfo => vm::region_info(args),
        Syscall::VmTaskInfo => vm::task_info(args),
        Syscall::VmAddrToRegion => vm::addr_to_region(args),
        Syscall::VmTranslate => vm::translate(args),
        Syscall::VmQuery => vm::query(args),

        Syscall::PortAlloc => port::alloc(args),
        Syscall::PortDealloc => port::dealloc(args),
        Syscall::PortSend => port::send(args),
        Syscall::PortReceive => port::receive(args),
        Syscall::PortSetParams => port::set_params(args),

        Syscall::NotifySend => notify::send(args),
        Syscall::NotifyReceive => notify::receive(args),

        Syscall::IrqInstall => irq::install(args),
        Syscall::IrqRemove => irq::remove(args),
        Syscall::IrqUpdate => irq::update(args),
        Syscall::IrqGetInfo => irq::get_info(args),
        Syscall::IrqInstallCoreLocal => irq::install_core_local(args),

        Syscall::GetEntropy => misc::get_entropy(args),
    };

    match result {
        Ok(value) => value,
        Err(error) => error.as_isize(),
    }
}

// Shared handler plumbing.

/// Returns the calling thread.
///
pub(crate) fn current_thread() -> Result<Arc<Thread>, Error> {
    cpu_local::try_current_thread().ok_or(Error::GeneralError)
}

/// Returns the calling task.
///
pub(crate) fn current_task() -> Result<Arc<Task>, Error> {
    Task::current().ok_or(Error::GeneralError)
}

/// How long a blocking call may wait.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    /// Fail immediately rather than block.
    Poll,
    /// Block until the given instant.
    Until(Instant),
    /// Block forever.
    Forever,
}

impl Wait {
    /// Decodes a microsecond timeout argument.
    ///
    pub(crate) fn from_usecs(timeout: usize) -> Wait {
        match timeout {
            syscalls::TIMEOUT_POLL => Wait::Poll,
            syscalls::TIMEOUT_FOREVER => Wait::Forever,
            micros => Wait::Until(time::now() + time::Duration::from_micros(micros as u64)),
        }
    }

    /// Returns the deadline to pass into a block, `None`
    /// meaning forever.
    ///
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Until(when) => Some(when),
            _ => None,
        }
    }
}

/// Parses an address argument. Anything non-canonical is
/// rejected rather than trusted anywhere near the page
/// tables.
///
pub(crate) fn user_addr(raw: usize) -> Result<x86_64::VirtAddr, Error> {
    x86_64::VirtAddr::try_new(raw as u64).map_err(|_| Error::InvalidAddress)
}

/// Checks that `[addr, addr+len)` lies in user space and
/// every page of it is mapped user-accessible in the calling
/// task.
///
/// Pages must be resident; an untouched lazy allocation fails the
/// check until its owner has faulted it in.
///
pub(crate) fn validate_user_ptr(addr: usize, len: usize) -> Result<(), Error> {
    if addr == 0 {
        return Err(Error::InvalidPointer);
    }

    let end = addr.checked_add(len).ok_or(Error::InvalidPointer)?;
    let task = current_task()?;
    let map = task.map();

    let mut page = addr & !(PAGE_SIZE - 1);
    while page < end {
        let virt = user_addr(page).map_err(|_| Error::InvalidPointer)?;
        match map.get(virt) {
            Some((_, flags)) if flags.contains(pagetable::PageFlags::USER) => {}
            _ => return Err(Error::InvalidPointer),
        }

        page += PAGE_SIZE;
    }

    Ok(())
}

/// Copies `len` bytes in from a validated user buffer.
///
pub(crate) fn copy_from_user(addr: usize, len: usize) -> Result<Vec<u8>, Error> {
    validate_user_ptr(addr, len)?;

    let mut bytes = Vec::with_capacity(len);
    unsafe {
        core::ptr::copy_nonoverlapping(addr as *const u8, bytes.as_mut_ptr(), len);
        bytes.set_len(len);
    }

    Ok(bytes)
}

/// Copies bytes out to a validated user buffer.
///
pub(crate) fn copy_to_user(addr: usize, bytes: &[u8]) -> Result<(), Error> {
    validate_user_ptr(addr, bytes.len())?;

    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
    Ok(())
}

/// Reads a plain record from a validated user buffer.
///
pub(crate) fn read_user_struct<T: Copy>(addr: usize) -> Result<T, Error> {
    if addr % core::mem::align_of::<T>() != 0 {
        return Err(Error::InvalidPointer);
    }

    validate_user_ptr(addr, core::mem::size_of::<T>())?;
    Ok(unsafe { core::ptr::read(addr as *const T) })
}

/// Writes a plain record to a validated user buffer.
///
pub(crate) fn write_user_struct<T: Copy>(addr: usize, value: &T) -> Result<(), Error> {
    if addr % core::mem::align_of::<T>() != 0 {
        return Err(Error::InvalidPointer);
    }

    validate_user_ptr(addr, core::mem::size_of::<T>())?;
    unsafe { core::ptr::write(addr as *mut T, *value) };
    Ok(())
}

/// The longest object name a syscall accepts.
///
const MAX_NAME_LEN: usize = 256;

/// Reads a name string from user space.
///
pub(crate) fn read_user_name(addr: usize, len: usize) -> Result<alloc::string::String, Error> {
    if len > MAX_NAME_LEN {
        return Err(Error::InvalidArgument);
    }

    let bytes = copy_from_user(addr, len)?;
    alloc::string::String::from_utf8(bytes).map_err(|_| Error::InvalidArgument)
}
