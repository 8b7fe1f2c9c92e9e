// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The per-core scheduler.
//!
//! Each core owns a [`Scheduler`] with one FIFO run queue per
//! priority band. Dispatch walks the bands from highest to lowest and
//! takes the head of the first non-empty queue; threads within a band
//! therefore run round-robin, and a runnable thread in a higher band
//! always pre-empts lower bands.
//!
//! The scheduler also owns the core's deadline queue, popped on every
//! timer tick, and the idle worker that destroys dead threads and
//! tasks when nothing else wants the CPU.
//!
//! The scheduler may only be entered from a syscall trap, the timer
//! interrupt, or an IPI; the context switch itself runs at dispatch
//! IRQL with interrupts masked.

use crate::cpu_local;
use crate::idle::IdleWorker;
use crate::peers;
use crate::switch::{switch_context, RegisterState};
use crate::thread::{Thread, ThreadState};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use cpu::{Irql, MAX_CPUS};
use spin::{Mutex, Once};
use time::{Deadline, DeadlineQueue};

/// The number of priority bands.
///
pub const NUM_BANDS: usize = 5;

/// The priority bands, ordered lowest first.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityBand {
    Idle = 0,
    BelowNormal = 1,
    Normal = 2,
    AboveNormal = 3,
    Highest = 4,
}

impl PriorityBand {
    /// Maps a priority in `[-100, 100]` to its band.
    ///
    /// # Panics
    ///
    /// `for_priority` will panic on a priority outside the legal
    /// range.
    ///
    pub fn for_priority(priority: i16) -> PriorityBand {
        match priority {
            -100..=-61 => PriorityBand::Idle,
            -60..=-21 => PriorityBand::BelowNormal,
            -20..=19 => PriorityBand::Normal,
            20..=59 => PriorityBand::AboveNormal,
            60..=100 => PriorityBand::Highest,
            _ => panic!("invalid thread priority {}", priority),
        }
    }
}

/// One core's scheduler.
///
pub struct Scheduler {
    core: u32,
    /// The run queues, indexed by band.
    runnable: Mutex<[VecDeque<Arc<Thread>>; NUM_BANDS]>,
    /// The thread currently on the CPU.
    running: Mutex<Option<Arc<Thread>>>,
    /// Deadlines pending on this core.
    deadlines: Mutex<DeadlineQueue>,
    /// The idle worker; also the dispatch fallback.
    idle: IdleWorker,
}

/// The per-core scheduler instances.
///
static SCHEDULERS: [Once<Scheduler>; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NONE: Once<Scheduler> = Once::new();
    [NONE; MAX_CPUS]
};

/// Builds the calling core's scheduler and registers it with
/// the peer directory.
///
/// # Panics
///
/// `init_core` will panic if the core already has a scheduler.
///
pub fn init_core() -> &'static Scheduler {
    let core = cpu::core_id();
    let mut fresh = false;
    let sched = SCHEDULERS[core as usize].call_once(|| {
        fresh = true;
        Scheduler::new(core)
    });
    if !fresh {
        panic!("core {} already has a scheduler", core);
    }

    peers::register(core);
    sched
}

/// Returns the calling core's scheduler.
///
/// # Panics
///
/// `current` will panic before [`init_core`].
///
pub fn current() -> &'static Scheduler {
    SCHEDULERS[cpu::core_id() as usize]
        .get()
        .expect("scheduler used before init_core")
}

/// Returns the scheduler of the given core, if it has one.
///
pub fn for_core(core: u32) -> Option<&'static Scheduler> {
    SCHEDULERS.get(core as usize)?.get()
}

impl Scheduler {
    /// Builds a scheduler for one core. [`init_core`] is the
    /// normal way in; building directly leaves the scheduler
    /// out of the peer directory.
    ///
    pub fn new(core: u32) -> Scheduler {
        Scheduler {
            core,
            runnable: Mutex::new([(); NUM_BANDS].map(|_| VecDeque::new())),
            running: Mutex::new(None),
            deadlines: Mutex::new(DeadlineQueue::new()),
            idle: IdleWorker::new(),
        }
    }

    /// Returns the core this scheduler runs.
    ///
    pub fn core(&self) -> u32 {
        self.core
    }

    /// Returns the core's idle worker.
    ///
    pub fn idle_worker(&self) -> &IdleWorker {
        &self.idle
    }

    /// Marks a thread runnable and queues it at the tail of
    /// its band.
    ///
    pub fn mark_runnable(&self, thread: &Arc<Thread>) {
        let band = PriorityBand::for_priority(thread.priority());

        thread.set_state_unchecked(ThreadState::Runnable);
        self.runnable.lock()[band as usize].push_back(thread.clone());
    }

    /// Removes a thread from the run queues, wherever it is.
    ///
    pub fn remove(&self, thread: &Arc<Thread>) {
        let mut queues = self.runnable.lock();
        for queue in queues.iter_mut() {
            queue.retain(|queued| !Arc::ptr_eq(queued, thread));
        }
    }

    /// Returns the number of queued runnable threads.
    ///
    pub fn runnable_count(&self) -> usize {
        self.runnable.lock().iter().map(|queue| queue.len()).sum()
    }

    /// Takes the next thread to dispatch: the head of the
    /// highest non-empty band.
    ///
    /// A thread equal to `ignore` is pushed to the back of its queue
    /// and the scan moves on, so a yielding thread gives everything
    /// else a chance first.
    ///
    pub fn take_next(&self, ignore: Option<&Arc<Thread>>) -> Option<Arc<Thread>> {
        let mut queues = self.runnable.lock();

        for band in (0..NUM_BANDS).rev() {
            let queue = &mut queues[band];
            while let Some(thread) = queue.pop_front() {
                // Zombies linger in the queues when a thread
                // is killed from outside; drop them here and
                // never dispatch them.
                if thread.state() == ThreadState::Zombie {
                    continue;
                }

                if let Some(ignore) = ignore {
                    if Arc::ptr_eq(&thread, ignore) {
                        // The yielding thread goes to the
                        // back and the scan moves down a
                        // band.
                        queue.push_back(thread);
                        break;
                    }
                }

                return Some(thread);
            }
        }

        None
    }

    /// Dispatches `next`: refills its quantum and switches
    /// the CPU to it.
    ///
    fn dispatch(&self, next: Arc<Thread>) {
        let previous = {
            let mut running = self.running.lock();
            let previous = running.take();
            *running = Some(next.clone());
            previous
        };

        if let Some(previous) = previous.as_ref() {
            if Arc::ptr_eq(previous, &next) {
                return;
            }
        }

        {
            let mut sched = next.sched.lock();
            sched.quantum = sched.quantum_total;
        }
        next.mark_switched_to(time::now());

        // Drain the incoming thread's DPC queue before it
        // runs user code again.
        if next.dpcs_pending() {
            next.run_dpcs();
        }

        cpu_local::set_current_thread(next.clone());

        // The switch is atomic against same-core interrupts.
        let _irql = cpu::raise(Irql::Dispatch);
        let to = next.regs.as_ptr();
        drop(next);

        match previous {
            Some(previous) => {
                let from = previous.regs.as_ptr();
                drop(previous);
                unsafe { switch_context(from, to) };
            }
            None => {
                // First dispatch on this core; the old
                // context is never resumed.
                let mut discard = RegisterState::zeroed();
                unsafe { switch_context(&mut discard, to) };
            }
        }
    }

    /// Picks and dispatches the next runnable thread,
    /// falling back to the idle thread when every queue is
    /// empty.
    ///
    /// # Panics
    ///
    /// `switch_to_runnable` will panic if there is nothing to run and
    /// the idle worker has not been started.
    ///
    pub fn switch_to_runnable(&'static self, ignore: Option<&Arc<Thread>>) {
        let next = match self.take_next(ignore) {
            Some(next) => next,
            None => self
                .idle
                .thread()
                .expect("nothing runnable and no idle worker"),
        };

        self.dispatch(next);
    }

    /// Switches away from the calling thread without
    /// requeueing it; the thread must have arranged its own
    /// wake-up.
    ///
    pub fn switch_away(&'static self) {
        self.switch_to_runnable(None);
    }

    /// Yields the calling thread: requeues it at the tail of
    /// its band and dispatches someone else.
    ///
    pub fn yield_current(&'static self) {
        let current = self.running.lock().clone();
        let current = match current {
            Some(current) => current,
            None => return,
        };

        {
            let band = PriorityBand::for_priority(current.priority());
            self.runnable.lock()[band as usize].push_back(current.clone());
        }

        self.switch_to_runnable(Some(&current));
    }

    /// Adds a deadline to this core's queue.
    ///
    pub fn add_deadline(&self, deadline: Arc<dyn Deadline>) {
        self.deadlines.lock().insert(deadline);
    }

    /// Withdraws a deadline from this core's queue.
    ///
    pub fn remove_deadline(&self, deadline: &Arc<dyn Deadline>) {
        self.deadlines.lock().remove(deadline);
    }

    /// Pops and invokes every deadline due at `now`, in time
    /// order.
    ///
    pub fn process_deadlines(&self, now: time::Instant) {
        loop {
            let due = self.deadlines.lock().pop_due(now);
            match due {
                // Invoke outside the queue lock; expiry
                // handlers take scheduler locks of their
                // own.
                Some(deadline) => deadline.expired(),
                None => break,
            }
        }
    }

    /// The timer tick: expires deadlines, charges the
    /// running thread's quantum and pre-empts it when the
    /// quantum is gone.
    ///
    pub fn timer_tick(&'static self) {
        let now = time::now();
        self.process_deadlines(now);

        let running = self.running.lock().clone();
        let running = match running {
            Some(running) => running,
            None => return,
        };

        // The idle thread has no quantum to charge, and it
        // never joins the run queues; switch straight to any
        // real work that has appeared.
        if self.idle.is_idle_thread(&running) {
            if self.runnable_count() != 0 {
                self.switch_to_runnable(None);
            }
            return;
        }

        let exhausted = running.sched.lock().quantum.tick();
        if exhausted {
            self.yield_current();
        }
    }

    /// Hands the boot context over to the scheduler. The
    /// calling context is wrapped in a throwaway thread and
    /// exits; whatever is runnable takes over.
    ///
    /// # Panics
    ///
    /// `start` will panic if the idle worker fails to start or the
    /// boot thread is ever rescheduled.
    ///
    pub fn start(&'static self) -> ! {
        self.idle.start(self);

        let boot = Thread::adopt("boot");
        *self.running.lock() = Some(boot.clone());
        cpu_local::set_current_thread(boot);

        Thread::exit();
    }
}

#[cfg(test)]
mod tests {
    use super::{PriorityBand, Scheduler};
    use crate::thread::Thread;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    #[test]
    fn band_mapping() {
        // Half-open bands of width 40, with the extremes
        // closed.
        assert_eq!(PriorityBand::for_priority(-100), PriorityBand::Idle);
        assert_eq!(PriorityBand::for_priority(-61), PriorityBand::Idle);
        assert_eq!(PriorityBand::for_priority(-60), PriorityBand::BelowNormal);
        assert_eq!(PriorityBand::for_priority(-21), PriorityBand::BelowNormal);
        assert_eq!(PriorityBand::for_priority(-20), PriorityBand::Normal);
        assert_eq!(PriorityBand::for_priority(0), PriorityBand::Normal);
        assert_eq!(PriorityBand::for_priority(19), PriorityBand::Normal);
        assert_eq!(PriorityBand::for_priority(20), PriorityBand::AboveNormal);
        assert_eq!(PriorityBand::for_priority(59), PriorityBand::AboveNormal);
        assert_eq!(PriorityBand::for_priority(60), PriorityBand::Highest);
        assert_eq!(PriorityBand::for_priority(100), PriorityBand::Highest);
    }

    #[test]
    #[should_panic(expected = "invalid thread priority")]
    fn band_mapping_rejects_out_of_range() {
        PriorityBand::for_priority(101);
    }

    fn thread_at(priority: i16, name: &str) -> Arc<Thread> {
        let thread = Thread::adopt(name);
        thread.set_priority(priority);
        thread
    }

    #[test]
    fn fifo_within_band() {
        let sched = Scheduler::new(0);

        let threads: Vec<Arc<Thread>> = (0..4)
            .map(|i| thread_at(0, if i % 2 == 0 { "even" } else { "odd" }))
            .collect();
        for thread in threads.iter() {
            sched.mark_runnable(thread);
        }

        // Every other thread in the band is dispatched
        // before any repeats: straight FIFO order.
        for expected in threads.iter() {
            let next = sched.take_next(None).unwrap();
            assert!(Arc::ptr_eq(&next, expected));
        }
        assert!(sched.take_next(None).is_none());
    }

    #[test]
    fn higher_bands_pre_empt() {
        let sched = Scheduler::new(0);

        let low = thread_at(-80, "low");
        let normal = thread_at(0, "normal");
        let high = thread_at(90, "high");

        sched.mark_runnable(&low);
        sched.mark_runnable(&normal);
        sched.mark_runnable(&high);

        // Strictly highest band first, regardless of queue
        // order.
        let next = sched.take_next(None).unwrap();
        assert!(Arc::ptr_eq(&next, &high));
        let next = sched.take_next(None).unwrap();
        assert!(Arc::ptr_eq(&next, &normal));
        let next = sched.take_next(None).unwrap();
        assert!(Arc::ptr_eq(&next, &low));
    }

    #[test]
    fn yield_skips_the_yielder() {
        let sched = Scheduler::new(0);

        let yielder = thread_at(0, "yielder");
        let other = thread_at(-80, "other");

        sched.mark_runnable(&yielder);
        sched.mark_runnable(&other);

        // With the yielder excluded, the lower-band thread
        // runs; the yielder went to the back of its queue.
        let next = sched.take_next(Some(&yielder)).unwrap();
        assert!(Arc::ptr_eq(&next, &other));

        let next = sched.take_next(None).unwrap();
        assert!(Arc::ptr_eq(&next, &yielder));
    }

    #[test]
    fn removed_threads_are_not_dispatched(){
        let sched = Scheduler::new(0);

        let doomed = thread_at(0, "doomed");
        let survivor = thread_at(0, "survivor");
        sched.mark_runnable(&doomed);
        sched.mark_runnable(&survivor);
        assert_eq!(sched.runnable_count(), 2);

        sched.remove(&doomed);
        assert_eq!(sched.runnable_count(), 1);

        let next = sched.take_next(None).unwrap();
        assert!(Arc::ptr_eq(&next, &survivor));
        assert!(sched.take_next(None).is_none());
    }

    #[test]
    fn deadlines_resume_sleepers() {
        use crate::thread::ThreadState;
        use alloc::sync::Weak;
        use time::{Deadline, Instant};

        // A sleep deadline aimed at a scheduler instance,
        // standing in for the timer path.
        struct Wake {
            when: Instant,
            thread: Weak<Thread>,
            sched: &'static Scheduler,
        }

        impl Deadline for Wake {
            fn when(&self) -> Instant {
                self.when
            }

            fn expired(&self) {
                if let Some(thread) = self.thread.upgrade() {
                    self.sched.mark_runnable(&thread);
                }
            }
        }

        let sched: &'static Scheduler = alloc::boxed::Box::leak(alloc::boxed::Box::new(Scheduler::new(0)));

        let sleeper = thread_at(0, "sleeper");
        sleeper.set_state_unchecked(ThreadState::Sleeping);

        sched.add_deadline(Arc::new(Wake {
            when: Instant::from_nanos(500),
            thread: Arc::downgrade(&sleeper),
            sched,
        }));

        // Before the deadline nothing happens.
        sched.process_deadlines(Instant::from_nanos(499));
        assert_eq!(sched.runnable_count(), 0);
        assert_eq!(sleeper.state(), ThreadState::Sleeping);

        // At the deadline, exactly one dispatch places the
        // sleeper back on its run queue.
        sched.process_deadlines(Instant::from_nanos(500));
        assert_eq!(sched.runnable_count(), 1);
        assert_eq!(sleeper.state(), ThreadState::Runnable);

        // Processing again re-delivers nothing.
        sched.process_deadlines(Instant::from_nanos(1_000));
        assert_eq!(sched.runnable_count(), 1);
    }
}
