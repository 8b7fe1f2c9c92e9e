// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Blockables: the objects threads suspend themselves on.
//!
//! Every blockable offers the same small contract: whether it is
//! signalled, arming it with a waiting thread, and resetting it after
//! a wake-up. The wake path is internal to each implementation and
//! always lands in [`Thread::unblock`], where a compare-and-swap
//! settles the race against a competing timeout.
//!
//! Two standard blockables live here. [`SignalFlag`] is a one-shot
//! binary semaphore, used for termination waits and notify-waits.
//! [`TimerBlocker`] suspends a thread until an interval has passed,
//! by arming a deadline with the scheduler when the thread commits to
//! blocking. The port receive blocker lives with the ports.

use crate::scheduler;
use crate::thread::Thread;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use time::{Deadline, Duration, Instant};

/// The uniform contract of an object a thread can block on.
///
pub trait Blockable: Send + Sync {
    /// Returns whether the blockable has been signalled and
    /// a waiter should wake.
    fn is_signalled(&self) -> bool;

    /// Clears the signalled state, immediately before the
    /// woken thread resumes. One-shot blockables do nothing.
    fn reset(&self);

    /// Commits `thread` to blocking on this object. An `Err`
    /// refuses the block (the object is already signalled or
    /// cannot accept a waiter) and the thread falls straight
    /// back to runnable.
    fn will_block_on(&self, thread: &Arc<Thread>) -> Result<(), ()>;

    /// Releases the waiter after it has woken, whatever woke
    /// it.
    fn did_unblock(&self);

    /// Returns whether a thread is currently blocked on this
    /// object.
    fn has_blocker(&self) -> bool;
}

/// The waiter slot shared by blockable implementations.
///
pub struct Waiter(Mutex<Weak<Thread>>);

impl Waiter {
    /// Returns an empty waiter slot.
    ///
    pub const fn new() -> Waiter {
        Waiter(Mutex::new(Weak::new()))
    }

    /// Stores the blocking thread.
    ///
    pub fn arm(&self, thread: &Arc<Thread>) {
        *self.0.lock() = Arc::downgrade(thread);
    }

    /// Clears the waiter.
    ///
    pub fn disarm(&self) {
        *self.0.lock() = Weak::new();
    }

    /// Returns whether a thread is waiting.
    ///
    pub fn is_armed(&self) -> bool {
        self.0.lock().upgrade().is_some()
    }

    /// Wakes the waiting thread, if any.
    ///
    pub fn wake(&self) {
        let thread = self.0.lock().upgrade();
        if let Some(thread) = thread {
            thread.unblock();
        }
    }
}

impl Default for Waiter {
    fn default() -> Waiter {
        Waiter::new()
    }
}

/// A one-shot binary semaphore.
///
/// Once signalled it stays signalled; it cannot be reset. Used for
/// waiting on task and thread termination, and as the flag behind
/// notify-waits.
///
pub struct SignalFlag {
    waiter: Waiter,
    signalled: AtomicBool,
}

impl SignalFlag {
    /// Returns a fresh, unsignalled flag.
    ///
    pub fn new() -> Arc<SignalFlag> {
        Arc::new(SignalFlag {
            waiter: Waiter::new(),
            signalled: AtomicBool::new(false),
        })
    }

    /// Signals the flag, waking a waiting thread. Only the
    /// first signal does anything.
    ///
    pub fn signal(&self) {
        if self
            .signalled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.waiter.wake();
        }
    }
}

impl Blockable for SignalFlag {
    fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    fn reset(&self) {
        // One-shot; stays signalled.
    }

    fn will_block_on(&self, thread: &Arc<Thread>) -> Result<(), ()> {
        // Arm before the signalled check, so a signal racing
        // in between cannot be lost.
        self.waiter.arm(thread);
        if self.is_signalled() {
            self.waiter.disarm();
            return Err(());
        }

        Ok(())
    }

    fn did_unblock(&self) {
        self.waiter.disarm();
    }

    fn has_blocker(&self) -> bool {
        self.waiter.is_armed()
    }
}

/// Blocks a thread for an interval of time.
///
/// The deadline is armed when the thread commits to blocking, not
/// when the blocker is created, and includes a small fudge so the
/// wake never lands before the interval has fully passed.
///
pub struct TimerBlocker {
    us: Weak<TimerBlocker>,
    waiter: Waiter,
    interval: Duration,
    fired: AtomicBool,
    deadline: Mutex<Option<Arc<TimerDeadline>>>,
}

/// The slack added to every timer so coarse tick sources
/// never wake early.
///
const TIMER_FUDGE: Duration = Duration::from_micros(10);

impl TimerBlocker {
    /// Returns a blocker that signals `interval` after the
    /// block begins.
    ///
    pub fn new(interval: Duration) -> Arc<TimerBlocker> {
        Arc::new_cyclic(|us| TimerBlocker {
            us: us.clone(),
            waiter: Waiter::new(),
            interval,
            fired: AtomicBool::new(false),
            deadline: Mutex::new(None),
        })
    }

    /// Called by the deadline when the interval has passed.
    ///
    fn timer_fired(&self) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.waiter.wake();
        }
    }
}

impl Blockable for TimerBlocker {
    fn is_signalled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn reset(&self) {
        // Withdraw the deadline if it has not fired.
        let deadline = self.deadline.lock().take();
        if let Some(deadline) = deadline {
            let deadline: Arc<dyn Deadline> = deadline;
            scheduler::current().remove_deadline(&deadline);
        }
    }

    fn will_block_on(&self, thread: &Arc<Thread>) -> Result<(), ()> {
        if self.is_signalled() {
            return Err(());
        }

        self.waiter.arm(thread);

        let deadline = Arc::new(TimerDeadline {
            when: time::now() + self.interval + TIMER_FUDGE,
            blocker: self.us.clone(),
        });
        *self.deadline.lock() = Some(deadline.clone());
        scheduler::current().add_deadline(deadline);

        Ok(())
    }

    fn did_unblock(&self) {
        self.waiter.disarm();
    }

    fn has_blocker(&self) -> bool {
        self.waiter.is_armed()
    }
}

impl Drop for TimerBlocker {
    fn drop(&mut self) {
        // An unfired deadline must not outlive its blocker.
        let deadline = self.deadline.get_mut().take();
        if let Some(deadline) = deadline {
            if !self.is_signalled() {
                let deadline: Arc<dyn Deadline> = deadline;
                if let Some(sched) = scheduler::for_core(cpu::core_id()) {
                    sched.remove_deadline(&deadline);
                }
            }
        }
    }
}

/// The scheduler deadline behind a [`TimerBlocker`].
///
struct TimerDeadline {
    when: Instant,
    blocker: Weak<TimerBlocker>,
}

impl Deadline for TimerDeadline {
    fn when(&self) -> Instant {
        self.when
    }

    fn expired(&self) {
        if let Some(blocker) = self.blocker.upgrade() {
            blocker.timer_fired();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Blockable, SignalFlag};

    #[test]
    fn signal_flag_is_one_shot() {
        let flag = SignalFlag::new();
        assert!(!flag.is_signalled());
        assert!(!flag.has_blocker());

        flag.signal();
        assert!(flag.is_signalled());

        // Further signals and resets change nothing.
        flag.signal();
        flag.reset();
        assert!(flag.is_signalled());
    }

    #[test]
    fn signalled_flag_refuses_blockers() {
        let flag = SignalFlag::new();
        flag.signal();

        let thread = crate::thread::Thread::adopt("flag-test");
        assert!(flag.will_block_on(&thread).is_err());
        assert!(!flag.has_blocker());
    }

    #[test]
    fn flag_arms_and_disarms() {
        let flag = SignalFlag::new();
        let thread = crate::thread::Thread::adopt("arm-test");

        assert!(flag.will_block_on(&thread).is_ok());
        assert!(flag.has_blocker());

        flag.did_unblock();
        assert!(!flag.has_blocker());
    }
}
