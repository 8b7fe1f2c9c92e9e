// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The port syscalls.
//!
//! Receive buffers are a 16-byte-aligned [`RecvInfo`] header
//! followed by payload space in 16-byte units. A message longer than
//! the offered space is truncated; the header's length field records
//! what was copied.

use super::{copy_from_user, current_task, validate_user_ptr, Wait};
use alloc::sync::Arc;
use ipc::{Port, PortError};
use multitasking::task::OwnedPort;
use syscalls::{Error, Handle, RecvInfo, SyscallArgs};

fn resolve(raw: usize) -> Result<Arc<Port>, Error> {
    handles::port(Handle::from_raw(raw as u64)).ok_or(Error::InvalidHandle)
}

/// Requires that the calling task owns `port`.
///
fn require_owner(port: &Arc<Port>) -> Result<(), Error> {
    let task = current_task()?;
    let owned: Arc<dyn OwnedPort> = port.clone();
    if !task.owns_port(&owned) {
        return Err(Error::PermissionDenied);
    }

    Ok(())
}

fn port_failure(error: PortError) -> Error {
    match error {
        PortError::TooLarge => Error::InvalidArgument,
        PortError::QueueFull => Error::TryAgain,
        PortError::Timeout => Error::Timeout,
        PortError::AlreadyReceiving => Error::TryAgain,
        PortError::Error => Error::GeneralError,
    }
}

pub(super) fn alloc(_args: &SyscallArgs) -> Result<isize, Error> {
    let port = Port::alloc();
    let handle = handles::make_port_handle(&port);

    let task = current_task()?;
    task.add_port(port);

    Ok(handle.as_raw() as isize)
}

pub(super) fn dealloc(args: &SyscallArgs) -> Result<isize, Error> {
    let port = resolve(args.args[0])?;
    require_owner(&port)?;

    let task = current_task()?;
    let owned: Arc<dyn OwnedPort> = port.clone();
    task.remove_port(&owned);
    handles::release_port_handle(port.port_handle());

    Ok(0)
}

pub(super) fn send(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw, msg_ptr, msg_len, _] = args.args;
    let port = resolve(raw)?;

    let payload = copy_from_user(msg_ptr, msg_len)?;
    port.send(&payload).map_err(port_failure)?;

    Ok(0)
}

pub(super) fn receive(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw, recv_ptr, recv_len, timeout] = args.args;

    // The buffer must hold the header, in 16-byte units.
    let header_len = core::mem::size_of::<RecvInfo>();
    if recv_len < header_len || recv_len % 16 != 0 || recv_ptr % 16 != 0 {
        return Err(Error::InvalidArgument);
    }
    validate_user_ptr(recv_ptr, recv_len)?;

    let port = resolve(raw)?;
    require_owner(&port)?;

    let message = match Wait::from_usecs(timeout) {
        Wait::Poll => port.try_receive().ok_or(Error::Timeout)?,
        wait => port.receive(wait.deadline()).map_err(port_failure)?,
    };

    // Truncate to the payload space on offer.
    let space = recv_len - header_len;
    let copied = message.content.len().min(space);

    let mut header = RecvInfo::empty();
    header.thread = message.sender_thread;
    header.task = message.sender_task;
    header.message_length = copied as u16;
    super::write_user_struct(recv_ptr, &header)?;

    unsafe {
        core::ptr::copy_nonoverlapping(
            message.content.as_ptr(),
            (recv_ptr + header_len) as *mut u8,
            copied,
        );
    }

    Ok(copied as isize)
}

pub(super) fn set_params(args: &SyscallArgs) -> Result<isize, Error> {
    let port = resolve(args.args[0])?;
    require_owner(&port)?;

    port.set_queue_depth(args.args[1]);
    Ok(0)
}
