// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The idle worker.
//!
//! Each core's scheduler owns an idle worker: a kernel thread at the
//! lowest priority, kept off the run queues and dispatched only when
//! nothing else is runnable. Its day job is deferred destruction:
//! dead threads and tasks are pushed onto a lock-free queue and the
//! idle worker drops the last references from its own context, where
//! nothing is suspended on the dead object's stack.

use crate::peers;
use crate::scheduler::{self, Scheduler};
use crate::task::Task;
use crate::thread::{Thread, ThreadState};
use alloc::sync::Arc;
use crossbeam::queue::SegQueue;
use spin::Once;

/// The idle worker's priority: the bottom of the range.
///
pub const IDLE_PRIORITY: i16 = -100;

/// A unit of deferred destruction.
///
pub enum WorkItem {
    /// Drop the last reference to a dead thread.
    DestroyThread(Arc<Thread>),
    /// Drop the last reference to a dead task.
    DestroyTask(Arc<Task>),
}

/// One core's idle worker.
///
pub struct IdleWorker {
    work: SegQueue<WorkItem>,
    thread: Once<Arc<Thread>>,
}

impl IdleWorker {
    /// Returns a worker with no thread yet; the thread
    /// arrives with [`IdleWorker::start`].
    ///
    pub fn new() -> IdleWorker {
        IdleWorker {
            work: SegQueue::new(),
            thread: Once::new(),
        }
    }

    /// Creates the idle thread. It is deliberately not
    /// enqueued; the dispatcher falls back to it when the
    /// run queues are empty.
    ///
    /// # Panics
    ///
    /// `start` will panic without a kernel task to hang the thread
    /// off, or if no kernel stack is available.
    ///
    pub fn start(&self, sched: &'static Scheduler) {
        self.thread.call_once(|| {
            let task = crate::task::kernel_task();
            let thread = Thread::kernel_thread(task, "idle", idle_main, sched.core() as usize)
                .expect("failed to create idle thread");
            thread.set_priority(IDLE_PRIORITY);
            thread.set_state(ThreadState::Runnable);

            thread
        });
    }

    /// Returns the idle thread, once started.
    ///
    pub fn thread(&self) -> Option<Arc<Thread>> {
        self.thread.get().cloned()
    }

    /// Returns whether `thread` is this core's idle thread.
    ///
    pub fn is_idle_thread(&self, thread: &Arc<Thread>) -> bool {
        match self.thread.get() {
            Some(idle) => Arc::ptr_eq(idle, thread),
            None => false,
        }
    }

    /// Queues a dead thread for destruction.
    ///
    pub fn queue_destroy_thread(&self, thread: Arc<Thread>) {
        self.work.push(WorkItem::DestroyThread(thread));
    }

    /// Queues a dead task for destruction.
    ///
    pub fn queue_destroy_task(&self, task: Arc<Task>) {
        self.work.push(WorkItem::DestroyTask(task));
    }

    /// Drains the work queue, destroying everything queued.
    ///
    pub fn process_work(&self) {
        while let Some(item) = self.work.pop() {
            match item {
                WorkItem::DestroyThread(thread) => {
                    // Detach from the owning task first, so
                    // the task's thread list never holds a
                    // destroyed thread.
                    thread.detach();
                    drop(thread);
                }
                WorkItem::DestroyTask(task) => {
                    crate::registry::unregister(&task);
                    drop(task);
                }
            }
        }
    }
}

impl Default for IdleWorker {
    fn default() -> IdleWorker {
        IdleWorker::new()
    }
}

/// The idle thread's body: destroy the dead, tidy the peer
/// list, halt until the next interrupt.
///
fn idle_main(core: usize) -> ! {
    let sched = scheduler::for_core(core as u32).expect("idle thread on core without scheduler");

    loop {
        sched.idle_worker().process_work();
        peers::rebuild_if_stale(core as u32);

        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::IdleWorker;
    use crate::thread::{Thread, ThreadState};
    use alloc::sync::Arc;

    #[test]
    fn destroys_queued_threads() {
        let worker = IdleWorker::new();

        let doomed = Thread::adopt("doomed");
        doomed.set_state_unchecked(ThreadState::Zombie);
        let weak = Arc::downgrade(&doomed);

        worker.queue_destroy_thread(doomed);
        assert!(weak.upgrade().is_some());

        // Draining the queue drops the last reference.
        worker.process_work();
        assert!(weak.upgrade().is_none());
    }
}
