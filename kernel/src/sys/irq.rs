// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The interrupt syscalls.
//!
//! Installing a handler binds an IRQ to a thread's notification
//! word. The calling task must contain the target thread, both on
//! installation and for any later change or removal.

use super::{current_task, current_thread};
use alloc::sync::Arc;
use ipc::IrqHandler;
use multitasking::thread::Thread;
use syscalls::{Error, Handle, IrqInfoKey, SyscallArgs};

/// The core-local IRQ lines handed out by
/// `install_core_local`, above the shared device range.
///
const CORE_LOCAL_IRQ_BASE: usize = 48;

fn resolve(raw: usize) -> Result<Arc<IrqHandler>, Error> {
    handles::irq_handler(Handle::from_raw(raw as u64)).ok_or(Error::InvalidHandle)
}

fn resolve_thread(raw: usize) -> Result<Arc<Thread>, Error> {
    if raw == 0 {
        return current_thread();
    }

    handles::thread(Handle::from_raw(raw as u64)).ok_or(Error::InvalidHandle)
}

/// Requires that the handler's target thread belongs to the
/// calling task.
///
fn require_rights(handler: &Arc<IrqHandler>) -> Result<(), Error> {
    let ours = current_task()?;
    match handler.thread().task() {
        Some(task) if Arc::ptr_eq(&task, &ours) => Ok(()),
        _ => Err(Error::PermissionDenied),
    }
}

pub(super) fn install(args: &SyscallArgs) -> Result<isize, Error> {
    let [irq, raw_thread, bits, _] = args.args;
    if bits == 0 {
        return Err(Error::InvalidArgument);
    }

    let thread = resolve_thread(raw_thread)?;
    let handler =
        IrqHandler::install(interrupts::current(), irq, thread, bits).ok_or(Error::InvalidArgument)?;

    let handle = handles::make_irq_handle(&handler);
    Ok(handle.as_raw() as isize)
}

pub(super) fn remove(args: &SyscallArgs) -> Result<isize, Error> {
    let handler = resolve(args.args[0])?;
    require_rights(&handler)?;

    handles::release_irq_handle(handler.irq_handle());
    handler.remove();

    Ok(0)
}

pub(super) fn update(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw, raw_thread, bits, _] = args.args;
    if bits == 0 {
        return Err(Error::InvalidArgument);
    }

    let handler = resolve(raw)?;
    require_rights(&handler)?;

    let thread = resolve_thread(raw_thread)?;
    handler.set_target(thread, bits);

    Ok(0)
}

pub(super) fn get_info(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw, raw_key, _, _] = args.args;
    let handler = resolve(raw)?;
    let key = IrqInfoKey::from_usize(raw_key).ok_or(Error::InvalidArgument)?;

    match key {
        IrqInfoKey::InterruptNumber => Ok(handler.irq() as isize),
        IrqInfoKey::VectorNumber => Ok(handler.vector() as isize),
    }
}

pub(super) fn install_core_local(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw_thread, bits, _, _] = args.args;
    if bits == 0 {
        return Err(Error::InvalidArgument);
    }

    let thread = resolve_thread(raw_thread)?;
    let registry = interrupts::current();

    // Hand out the first free core-local line.
    for irq in CORE_LOCAL_IRQ_BASE..interrupts::NUM_IRQS {
        if registry.handler_count(irq) != 0 {
            continue;
        }

        let handler =
            IrqHandler::install(registry, irq, thread, bits).ok_or(Error::InvalidArgument)?;
        let handle = handles::make_irq_handle(&handler);
        return Ok(handle.as_raw() as isize);
    }

    Err(Error::TryAgain)
}
