// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The virtual memory syscalls.
//!
//! Memory objects are created against the calling task, mapped into
//! any task the caller holds a handle to, and shared by mapping the
//! same object into several tasks. `map` carries its flag argument
//! in the upper bits of the syscall code word, since the register
//! ABI marshals four arguments.

use super::{current_task, read_user_struct, user_addr, write_user_struct};
use alloc::sync::Arc;
use memlayout::{PAGE_SIZE, USERSPACE};
use multitasking::task::Task;
use syscalls::{
    Error, Handle, MapRequest, RegionInfo, SyscallArgs, TaskVmInfo, VmFlags, VmQueryKey,
};
use virtmem::{MapEntry, MapFailure, Placement};
use x86_64::{PhysAddr, VirtAddr};

/// Resolves a task handle argument; zero names the calling
/// task.
///
fn resolve_task(raw: usize) -> Result<Arc<Task>, Error> {
    if raw == 0 {
        return current_task();
    }

    handles::task(Handle::from_raw(raw as u64)).ok_or(Error::InvalidHandle)
}

/// Resolves a memory object handle.
///
fn resolve_entry(raw: usize) -> Result<Arc<MapEntry>, Error> {
    handles::vm_object(Handle::from_raw(raw as u64)).ok_or(Error::InvalidHandle)
}

/// Converts a VM layer failure to a wire error.
///
fn map_failure(failure: MapFailure) -> Error {
    match failure {
        MapFailure::Overlap => Error::InvalidAddress,
        MapFailure::NoSpace => Error::InvalidAddress,
        MapFailure::NotFound => Error::Unmapped,
        MapFailure::BadSize => Error::InvalidArgument,
        MapFailure::NoMemory => Error::NoMemory,
    }
}

/// Decodes a raw flag word, rejecting unknown bits.
///
fn decode_flags(raw: usize) -> Result<VmFlags, Error> {
    VmFlags::from_bits(raw).ok_or(Error::InvalidArgument)
}

pub(super) fn alloc_phys(args: &SyscallArgs) -> Result<isize, Error> {
    let [phys, length, raw_flags, _] = args.args;
    if length == 0 || phys % PAGE_SIZE != 0 {
        return Err(Error::InvalidArgument);
    }

    let flags = decode_flags(raw_flags)?;
    let entry = MapEntry::make_phys(PhysAddr::new(phys as u64), length, flags, false);

    let task = current_task()?;
    let handle = handles::make_vm_object_handle(&entry);
    task.add_owned_region(&entry);

    Ok(handle.as_raw() as isize)
}

pub(super) fn alloc_anon(args: &SyscallArgs) -> Result<isize, Error> {
    let [length, raw_flags, _, _] = args.args;
    if length == 0 {
        return Err(Error::InvalidArgument);
    }

    let flags = decode_flags(raw_flags)?;
    let entry = MapEntry::make_anon(length, flags, false);

    let task = current_task()?;
    let handle = handles::make_vm_object_handle(&entry);
    task.add_owned_region(&entry);

    Ok(handle.as_raw() as isize)
}

pub(super) fn dealloc(args: &SyscallArgs) -> Result<isize, Error> {
    let entry = resolve_entry(args.args[0])?;
    let task = current_task()?;

    if !task.remove_owned_region(&entry) {
        return Err(Error::PermissionDenied);
    }

    handles::release_vm_object_handle(entry.handle());
    Ok(0)
}

pub(super) fn update_permissions(args: &SyscallArgs) -> Result<isize, Error> {
    let entry = resolve_entry(args.args[0])?;
    let flags = decode_flags(args.args[1])?;

    entry.update_flags(flags);
    Ok(0)
}

pub(super) fn resize(args: &SyscallArgs) -> Result<isize, Error> {
    let entry = resolve_entry(args.args[0])?;
    let new_length = args.args[1];

    entry.resize(new_length).map_err(map_failure)?;
    Ok(0)
}

/// Checks that a window lies within user space.
///
fn require_user_window(base: VirtAddr, length: usize) -> Result<(), Error> {
    if USERSPACE.contains_range(base, length) {
        Ok(())
    } else {
        Err(Error::InvalidAddress)
    }
}

pub(super) fn map(args: &SyscallArgs, code: usize) -> Result<isize, Error> {
    let [raw_entry, raw_task, base, length] = args.args;
    let entry = resolve_entry(raw_entry)?;
    let task = resolve_task(raw_task)?;

    // The mask rides in the upper bits of the code word.
    let mask = decode_flags(code >> 16)?;

    if length != 0 && length != entry.length() {
        return Err(Error::InvalidArgument);
    }

    let base = user_addr(base)?;
    require_user_window(base, entry.length())?;

    let installed = task
        .map()
        .add(&entry, task.pages(), Placement::Fixed(base), mask)
        .map_err(map_failure)?;

    Ok(installed.as_u64() as isize)
}

pub(super) fn map_ex(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw_entry, raw_task, req_ptr, req_len] = args.args;
    if req_len != core::mem::size_of::<MapRequest>() {
        return Err(Error::InvalidArgument);
    }

    let entry = resolve_entry(raw_entry)?;
    let task = resolve_task(raw_task)?;
    let request: MapRequest = read_user_struct(req_ptr)?;

    let mask = decode_flags(request.flags)?;

    let placement = if request.end == 0 {
        let base = user_addr(request.start)?;
        require_user_window(base, entry.length())?;
        Placement::Fixed(base)
    } else {
        if request.end <= request.start || request.length < entry.length() {
            return Err(Error::InvalidArgument);
        }

        require_user_window(user_addr(request.start)?, request.end - request.start)?;
        Placement::Search {
            start: user_addr(request.start)?,
            end: user_addr(request.end)?,
        }
    };

    let installed = task
        .map()
        .add(&entry, task.pages(), placement, mask)
        .map_err(map_failure)?;

    Ok(installed.as_u64() as isize)
}

pub(super) fn unmap(args: &SyscallArgs) -> Result<isize, Error> {
    let entry = resolve_entry(args.args[0])?;
    let task = resolve_task(args.args[1])?;

    task.map().remove_entry(&entry).map_err(map_failure)?;
    Ok(0)
}

pub(super) fn region_info(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw_entry, raw_task, info_ptr, info_len] = args.args;
    if info_len != core::mem::size_of::<RegionInfo>() {
        return Err(Error::InvalidArgument);
    }

    let entry = resolve_entry(raw_entry)?;
    let task = resolve_task(raw_task)?;

    let (base, length, flags) = task
        .map()
        .region_info(&entry)
        .ok_or(Error::Unmapped)?;

    let info = RegionInfo {
        base: base.as_u64() as usize,
        length,
        flags: flags.bits(),
    };
    write_user_struct(info_ptr, &info)?;

    Ok(0)
}

pub(super) fn task_info(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw_task, info_ptr, info_len, _] = args.args;
    if info_len != core::mem::size_of::<TaskVmInfo>() {
        return Err(Error::InvalidArgument);
    }

    let task = resolve_task(raw_task)?;
    let info = TaskVmInfo {
        pages_owned: task.pages().count(),
        regions_owned: task.owned_region_count(),
    };
    write_user_struct(info_ptr, &info)?;

    Ok(0)
}

pub(super) fn addr_to_region(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw_task, addr, _, _] = args.args;
    let task = resolve_task(raw_task)?;

    let (entry, _) = task
        .map()
        .find_region(user_addr(addr)?)
        .ok_or(Error::Unmapped)?;

    Ok(entry.handle().as_raw() as isize)
}

pub(super) fn translate(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw_task, addr, _, _] = args.args;
    let task = resolve_task(raw_task)?;

    let (phys, _) = task
        .map()
        .get(user_addr(addr)?)
        .ok_or(Error::Unmapped)?;

    Ok(phys.as_u64() as isize)
}

pub(super) fn query(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw_key, out_ptr, out_len, _] = args.args;
    let key = VmQueryKey::from_usize(raw_key).ok_or(Error::InvalidArgument)?;

    match key {
        VmQueryKey::PageSize => {
            if out_len != core::mem::size_of::<usize>() {
                return Err(Error::InvalidArgument);
            }

            write_user_struct(out_ptr, &PAGE_SIZE)?;
            Ok(0)
        }
    }
}
