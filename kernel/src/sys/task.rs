// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The task syscalls.

use super::{copy_from_user, current_task, current_thread, read_user_name, user_addr};
use alloc::string::String;
use alloc::sync::Arc;
use multitasking::scheduler;
use multitasking::task::{Task, TaskState};
use multitasking::thread::Thread;
use serial::println;
use syscalls::{Error, Handle, SyscallArgs};

/// The longest debug message `dbg_out` accepts.
///
const MAX_DBG_LEN: usize = 1024;

/// Resolves a task handle argument; zero names the calling
/// task.
///
fn resolve(raw: usize) -> Result<Arc<Task>, Error> {
    if raw == 0 {
        return current_task();
    }

    handles::task(Handle::from_raw(raw as u64)).ok_or(Error::InvalidHandle)
}

pub(super) fn get_handle(_args: &SyscallArgs) -> Result<isize, Error> {
    let task = current_task()?;
    Ok(task.handle().as_raw() as isize)
}

pub(super) fn create(args: &SyscallArgs) -> Result<isize, Error> {
    // The parent argument names the task the new one hangs
    // off; only the calling task is supported as a parent.
    let parent = args.args[0];
    if parent != 0 {
        let named = resolve(parent)?;
        let ours = current_task()?;
        if !Arc::ptr_eq(&named, &ours) {
            return Err(Error::PermissionDenied);
        }
    }

    let map = virtmem::Map::new_user().ok_or(Error::NoMemory)?;
    let task = Task::create(map, true);
    let handle = handles::make_task_handle(&task);

    Ok(handle.as_raw() as isize)
}

pub(super) fn terminate(args: &SyscallArgs) -> Result<isize, Error> {
    let task = resolve(args.args[0])?;
    let code = args.args[1] as isize;

    handles::release_task_handle(task.handle());
    task.terminate(code as i64);

    // Only reached when the caller was not part of the task.
    Ok(0)
}

pub(super) fn initialize(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw, pc, sp, _] = args.args;
    let task = resolve(raw)?;

    if task.state() != TaskState::Initializing {
        return Err(Error::InvalidArgument);
    }
    if pc == 0 || sp == 0 {
        return Err(Error::InvalidAddress);
    }

    // Aim the task's main thread at its entry point,
    // creating one if the task is still empty.
    let thread = match task.threads().first() {
        Some(thread) => {
            thread.set_user_entry(user_addr(pc)?, user_addr(sp)?, 0);
            thread.clone()
        }
        None => {
            let thread = Thread::user_thread(
                &task,
                "main",
                user_addr(pc)?,
                user_addr(sp)?,
                0,
            )
            .ok_or(Error::NoMemory)?;
            handles::make_thread_handle(&thread);
            thread
        }
    };

    task.set_state(TaskState::Runnable);
    scheduler::current().mark_runnable(&thread);

    Ok(0)
}

pub(super) fn set_name(args: &SyscallArgs) -> Result<isize, Error> {
    let task = resolve(args.args[0])?;
    let name = read_user_name(args.args[1], args.args[2])?;
    task.set_name(&name);
    Ok(0)
}

pub(super) fn dbg_out(args: &SyscallArgs) -> Result<isize, Error> {
    let [ptr, len, _, _] = args.args;
    if len > MAX_DBG_LEN {
        return Err(Error::InvalidArgument);
    }

    let bytes = copy_from_user(ptr, len)?;
    let text = String::from_utf8_lossy(&bytes);

    let thread = current_thread()?;
    println!("[{}:{}] {}", current_task()?.pid(), thread.tid(), text.trim_end());

    Ok(0)
}
