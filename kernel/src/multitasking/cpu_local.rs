// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tracks the thread running on each core.

use crate::thread::Thread;
use alloc::sync::Arc;
use cpu::MAX_CPUS;
use spin::Mutex;

static CURRENT: [Mutex<Option<Arc<Thread>>>; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NONE: Mutex<Option<Arc<Thread>>> = Mutex::new(None);
    [NONE; MAX_CPUS]
};

/// Returns the thread running on the calling core.
///
/// # Panics
///
/// `current_thread` will panic before the scheduler owns the core.
///
pub fn current_thread() -> Arc<Thread> {
    try_current_thread().expect("no current thread on this core")
}

/// Returns the thread running on the calling core, or
/// `None` before the scheduler owns it.
///
pub fn try_current_thread() -> Option<Arc<Thread>> {
    CURRENT[cpu::core_id() as usize].lock().clone()
}

/// Records the thread now running on the calling core.
///
pub fn set_current_thread(thread: Arc<Thread>) {
    *CURRENT[cpu::core_id() as usize].lock() = Some(thread);
}
