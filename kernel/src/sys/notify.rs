// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The notification syscalls.

use super::{current_thread, Wait};
use multitasking::thread::BlockResult;
use syscalls::{Error, Handle, SyscallArgs};

pub(super) fn send(args: &SyscallArgs) -> Result<isize, Error> {
    let [raw_thread, bits, _, _] = args.args;
    if bits == 0 {
        return Err(Error::InvalidArgument);
    }

    let thread = if raw_thread == 0 {
        current_thread()?
    } else {
        handles::thread(Handle::from_raw(raw_thread as u64)).ok_or(Error::InvalidHandle)?
    };

    thread.notify(bits);
    Ok(0)
}

pub(super) fn receive(args: &SyscallArgs) -> Result<isize, Error> {
    let [mask, timeout, _, _] = args.args;
    let thread = current_thread()?;

    match Wait::from_usecs(timeout) {
        Wait::Poll => {
            if mask != 0 {
                thread.set_notification_mask(mask);
            }

            let delivered = thread.take_notifications();
            if delivered == 0 {
                return Err(Error::Timeout);
            }

            Ok(delivered as isize)
        }
        wait => match thread.block_notify(mask, wait.deadline()) {
            Ok(delivered) => Ok(delivered as isize),
            Err(BlockResult::Timeout) => Err(Error::Timeout),
            Err(_) => Err(Error::GeneralError),
        },
    }
}
