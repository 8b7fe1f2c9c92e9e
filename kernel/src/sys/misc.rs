// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Miscellaneous syscalls.

use super::copy_to_user;
use alloc::vec;
use syscalls::{Error, SyscallArgs};

/// The most entropy one call hands out.
///
const MAX_ENTROPY: usize = 256;

pub(super) fn get_entropy(args: &SyscallArgs) -> Result<isize, Error> {
    let [out_ptr, len, _, _] = args.args;
    if len == 0 || len > MAX_ENTROPY {
        return Err(Error::InvalidArgument);
    }

    let mut bytes = vec![0u8; len];
    random::read(&mut bytes);
    copy_to_user(out_ptr, &bytes)?;

    Ok(len as isize)
}
