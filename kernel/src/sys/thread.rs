// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The thread syscalls.

use super::{current_task, current_thread, read_user_name, user_addr, Wait};
use alloc::sync::Arc;
use multitasking::scheduler;
use multitasking::thread::{BlockResult, Thread, ThreadState};
use syscalls::{Error, Handle, SyscallArgs};

/// Creation flag: leave the new thread paused instead of
/// scheduling it immediately.
///
const CREATE_PAUSED: usize = 1 << 0;

/// Resolves a thread handle argument; zero names the calling
/// thread.
///
fn resolve(raw: usize) -> Result<Arc<Thread>, Error> {
    if raw == 0 {
        return current_thread();
    }

    handles::thread(Handle::from_raw(raw as u64)).ok_or(Error::InvalidHandle)
}

/// Requires that `thread` belongs to the calling task.
///
fn require_same_task(thread: &Arc<Thread>) -> Result<(), Error> {
    let ours = current_task()?;
    match thread.task() {
        Some(task) if Arc::ptr_eq(&task, &ours) => Ok(()),
        _ => Err(Error::PermissionDenied),
    }
}

pub(super) fn get_handle(_args: &SyscallArgs) -> Result<isize, Error> {
    let thread = current_thread()?;
    Ok(thread.handle().as_raw() as isize)
}

pub(super) fn yield_cpu(_args: &SyscallArgs) -> Result<isize, Error> {
    Thread::yield_now();
    Ok(0)
}

pub(super) fn usleep(args: &SyscallArgs) -> Result<isize, Error> {
    let micros = args.args[0];
    if micros == 0 {
        return Ok(0);
    }

    Thread::sleep(time::Duration::from_micros(micros as u64));
    Ok(0)
}

pub(super) fn create(args: &SyscallArgs) -> Result<isize, Error> {
    let [entry, param, stack, flags] = args.args;
    if entry == 0 || stack == 0 {
        return Err(Error::InvalidArgument);
    }

    let task = current_task()?;
    let thread = Thread::user_thread(
        &task,
        "",
        user_addr(entry)?,
        user_addr(stack)?,
        param,
    )
    .ok_or(Error::NoMemory)?;

    let handle = handles::make_thread_handle(&thread);
    if flags & CREATE_PAUSED == 0 {
        scheduler::current().mark_runnable(&thread);
    }

    Ok(handle.as_raw() as isize)
}

pub(super) fn destroy(args: &SyscallArgs) -> Result<isize, Error> {
    let thread = resolve(args.args[0])?;
    require_same_task(&thread)?;

    handles::release_thread_handle(thread.handle());
    thread.terminate();

    Ok(0)
}

pub(super) fn set_priority(args: &SyscallArgs) -> Result<isize, Error> {
    let thread = resolve(args.args[0])?;
    let priority = args.args[1] as isize;
    if !(-100..=100).contains(&priority) {
        return Err(Error::InvalidArgument);
    }

    thread.set_priority(priority as i16);
    Ok(0)
}

pub(super) fn set_note_mask(args: &SyscallArgs) -> Result<isize, Error> {
    let thread = resolve(args.args[0])?;
    thread.set_notification_mask(args.args[1]);
    Ok(0)
}

pub(super) fn set_name(args: &SyscallArgs) -> Result<isize, Error> {
    let thread = resolve(args.args[0])?;
    let name = read_user_name(args.args[1], args.args[2])?;
    thread.set_name(&name);
    Ok(0)
}

pub(super) fn resume(args: &SyscallArgs) -> Result<isize, Error> {
    let thread = resolve(args.args[0])?;

    match thread.state() {
        ThreadState::Paused | ThreadState::Sleeping => {
            scheduler::current().mark_runnable(&thread);
            Ok(0)
        }
        ThreadState::Runnable => Ok(0),
        _ => Err(Error::InvalidArgument),
    }
}

pub(super) fn join(args: &SyscallArgs) -> Result<isize, Error> {
    let thread = resolve(args.args[0])?;
    let wait = Wait::from_usecs(args.args[1]);

    if wait == Wait::Poll {
        return if thread.state() == ThreadState::Zombie {
            Ok(0)
        } else {
            Err(Error::Timeout)
        };
    }

    match thread.wait_on(wait.deadline()) {
        BlockResult::Unblocked | BlockResult::Aborted => Ok(0),
        BlockResult::Timeout => Err(Error::Timeout),
        BlockResult::Error => Err(Error::GeneralError),
    }
}
