// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The global task directory, shared between all cores.

use crate::task::Task;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

static TASKS: RwLock<Vec<Arc<Task>>> = RwLock::new(Vec::new());

/// Adds a task to the directory.
///
pub fn register(task: &Arc<Task>) {
    TASKS.write().push(task.clone());
}

/// Removes a task from the directory.
///
pub fn unregister(task: &Arc<Task>) {
    TASKS.write().retain(|known| !Arc::ptr_eq(known, task));
}

/// Returns the task with the given pid, if it is alive.
///
pub fn find_by_pid(pid: u32) -> Option<Arc<Task>> {
    TASKS
        .read()
        .iter()
        .find(|task| task.pid() == pid)
        .cloned()
}

/// Calls `visit` with every registered task.
///
pub fn for_each(mut visit: impl FnMut(&Arc<Task>)) {
    for task in TASKS.read().iter() {
        visit(task);
    }
}

/// Returns the number of registered tasks.
///
pub fn count() -> usize {
    TASKS.read().len()
}
