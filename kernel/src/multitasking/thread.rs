// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Threads: the units of scheduling.
//!
//! A thread carries its saved register state, a kernel stack drawn
//! from the stack pool, a priority in `[-100, 100]`, and the state
//! machinery for blocking and waking: the set of blockables it is
//! suspended on, its notification word and mask, a queue of deferred
//! procedure calls, and the signals fired when it terminates.
//!
//! Threads block by calling [`Thread::block_on`] with any
//! [`Blockable`]; the blockable wakes the thread through
//! [`Thread::unblock`] and a timed block is expired by a scheduler
//! deadline through [`Thread::block_expired`]. The race between a
//! signal and a timeout is settled by a compare-and-swap on the
//! thread's block state, so a thread is re-armed on its run queue
//! exactly once.
//!
//! Zombie threads are never dispatched; the idle worker destroys them
//! once the scheduler has let go of them.

use crate::blockable::{Blockable, SignalFlag};
use crate::cpu_local;
use crate::scheduler;
use crate::switch::{RegisterState, SavedState};
use crate::task::Task;
use crate::Name;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use crossbeam::atomic::AtomicCell;
use serial::println;
use spin::Mutex;
use stackpool::StackBounds;
use syscalls::Handle;
use time::{Duration, Instant, TimeSlice};
use x86_64::VirtAddr;

/// The quantum granted to a thread each time it is
/// dispatched.
///
pub const DEFAULT_QUANTUM: TimeSlice = TimeSlice::from_ticks(10);

/// The scheduling states of a thread.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Not runnable until explicitly resumed.
    Paused,
    /// Ready to run.
    Runnable,
    /// Suspended on one or more blockables.
    Blocked,
    /// Suspended on a timer.
    Sleeping,
    /// Suspended waiting for notifications.
    NotifyWait,
    /// Dead; never dispatched again, destroyed by the idle
    /// worker.
    Zombie,
}

/// Why a block ended.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockResult {
    /// A blockable signalled.
    Unblocked,
    /// The deadline passed first.
    Timeout,
    /// The block never started; the condition was already
    /// satisfied or the blockable refused.
    Aborted,
    /// Internal inconsistency.
    Error,
}

/// The internal block state, raced over by signal delivery
/// and timeout expiry.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    Inactive,
    Blocking,
    Unblocked,
    TimedOut,
}

/// The faults a thread can take.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultType {
    /// Unrecoverable; always terminates the containing
    /// task.
    General,
    /// The executed instruction is invalid.
    InvalidInstruction,
    /// A page fault no memory object claimed.
    UnhandledPagefault,
    /// A protection check failed.
    ProtectionViolation,
}

/// A deferred procedure call: run in the thread's kernel
/// context at the next safe point.
///
struct Dpc {
    handler: fn(&Arc<Thread>, usize),
    context: usize,
}

/// An object a thread owns that is tied to an interrupt
/// registration; detached when the thread dies.
///
pub trait IrqBinding: Send + Sync {
    /// Tears the platform registration down.
    fn detach(&self);
}

/// Per-thread scheduler bookkeeping.
///
#[derive(Debug)]
pub struct SchedData {
    /// Current run queue level.
    pub level: usize,
    /// Highest level the thread may occupy.
    pub max_level: usize,
    /// Level at which the thread last ran.
    pub last_level: usize,
    /// Quantum remaining at this level.
    pub quantum: TimeSlice,
    /// Quantum granted on each dispatch.
    pub quantum_total: TimeSlice,
}

/// A thread of execution.
///
pub struct Thread {
    us: Weak<Thread>,
    tid: u64,
    name: Mutex<Name>,
    handle: AtomicU64,

    /// The owning task, if any.
    task: Mutex<Weak<Task>>,
    attached: AtomicBool,

    state: AtomicCell<ThreadState>,
    kernel_mode: bool,
    /// The core this thread is affine to.
    core: AtomicU32,
    priority: AtomicCell<i16>,
    needs_to_die: AtomicBool,
    last_switched_to: AtomicU64,

    // Notifications: a word of pending bits, the mask of
    // interesting bits, and the one-shot flag armed while a
    // thread is in notify-wait.
    notifications: AtomicUsize,
    notification_mask: AtomicUsize,
    notify_flag: Mutex<Option<Arc<SignalFlag>>>,

    blocking_on: Mutex<Vec<Arc<dyn Blockable>>>,
    block_state: AtomicCell<BlockState>,

    irq_bindings: Mutex<Vec<Arc<dyn IrqBinding>>>,
    terminate_signals: Mutex<Vec<Arc<SignalFlag>>>,

    dpcs: Mutex<VecDeque<Dpc>>,
    dpcs_pending: AtomicBool,

    /// Pending ring-3 entry state for user threads.
    user_entry: Mutex<Option<(VirtAddr, VirtAddr, usize)>>,

    stack: Option<StackBounds>,
    pub(crate) regs: SavedState,

    pub(crate) sched: Mutex<SchedData>,
}

/// Thread ids are monotonic and never reused.
///
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

impl Thread {
    fn build(
        task: Weak<Task>,
        name: &str,
        kernel_mode: bool,
        stack: Option<StackBounds>,
        regs: RegisterState,
        state: ThreadState,
    ) -> Arc<Thread> {
        Arc::new_cyclic(|us| Thread {
            us: us.clone(),
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: Mutex::new(Name::new(name)),
            handle: AtomicU64::new(Handle::INVALID.as_raw()),
            task: Mutex::new(task),
            attached: AtomicBool::new(false),
            state: AtomicCell::new(state),
            kernel_mode,
            core: AtomicU32::new(cpu::core_id()),
            priority: AtomicCell::new(0),
            needs_to_die: AtomicBool::new(false),
            last_switched_to: AtomicU64::new(0),
            notifications: AtomicUsize::new(0),
            notification_mask: AtomicUsize::new(0),
            notify_flag: Mutex::new(None),
            blocking_on: Mutex::new(Vec::new()),
            block_state: AtomicCell::new(BlockState::Inactive),
            irq_bindings: Mutex::new(Vec::new()),
            terminate_signals: Mutex::new(Vec::new()),
            dpcs: Mutex::new(VecDeque::new()),
            dpcs_pending: AtomicBool::new(false),
            user_entry: Mutex::new(None),
            stack,
            regs: SavedState::new(regs),
            sched: Mutex::new(SchedData {
                level: 0,
                max_level: 0,
                last_level: usize::MAX,
                quantum: TimeSlice::ZERO,
                quantum_total: DEFAULT_QUANTUM,
            }),
        })
    }

    /// Creates a kernel-mode thread in `task`, paused.
    ///
    /// The thread gets a kernel stack from the stack pool and will
    /// begin at `entry` with `arg` once resumed. Returns `None` if no
    /// stack is available.
    ///
    pub fn kernel_thread(
        task: &Arc<Task>,
        name: &str,
        entry: fn(usize) -> !,
        arg: usize,
    ) -> Option<Arc<Thread>> {
        let stack = stackpool::get()?;
        let regs = RegisterState::kernel(entry, arg, stack.end());
        let thread = Thread::build(
            Arc::downgrade(task),
            name,
            true,
            Some(stack),
            regs,
            ThreadState::Paused,
        );

        task.add_thread(&thread);
        Some(thread)
    }

    /// Creates a user-mode thread in `task`, paused.
    ///
    /// The thread starts on its own kernel stack and drops to ring 3
    /// at `pc` with the given user stack and argument. Returns `None`
    /// if no kernel stack is available.
    ///
    pub fn user_thread(
        task: &Arc<Task>,
        name: &str,
        pc: VirtAddr,
        user_stack: VirtAddr,
        arg: usize,
    ) -> Option<Arc<Thread>> {
        let stack = stackpool::get()?;
        let regs = RegisterState::user(stack.end());
        let thread = Thread::build(
            Arc::downgrade(task),
            name,
            false,
            Some(stack),
            regs,
            ThreadState::Paused,
        );

        *thread.user_entry.lock() = Some((pc, user_stack, arg));
        task.add_thread(&thread);
        Some(thread)
    }

    /// Wraps the calling context in a thread record, without
    /// allocating a stack. Used for the boot context on each core.
    ///
    pub fn adopt(name: &str) -> Arc<Thread> {
        Thread::build(
            Weak::new(),
            name,
            true,
            None,
            RegisterState::zeroed(),
            ThreadState::Runnable,
        )
    }

    /// Returns the calling thread.
    ///
    /// # Panics
    ///
    /// `current` will panic before the scheduler owns the core.
    ///
    pub fn current() -> Arc<Thread> {
        cpu_local::current_thread()
    }

    /// Returns the thread's id.
    ///
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Returns the thread's name.
    ///
    pub fn name(&self) -> Name {
        *self.name.lock()
    }

    /// Sets the thread's name.
    ///
    pub fn set_name(&self, name: &str) {
        self.name.lock().set(name);
    }

    /// Returns the thread's handle.
    ///
    pub fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Acquire))
    }

    /// Records the thread's handle.
    ///
    pub fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.as_raw(), Ordering::Release);
    }

    /// Returns the owning task, if the thread is attached.
    ///
    pub fn task(&self) -> Option<Arc<Task>> {
        self.task.lock().upgrade()
    }

    /// Returns whether the thread runs in kernel mode.
    ///
    pub fn is_kernel_mode(&self) -> bool {
        self.kernel_mode
    }

    /// Returns the core the thread is affine to.
    ///
    pub fn core(&self) -> u32 {
        self.core.load(Ordering::Acquire)
    }

    /// Returns the thread's state.
    ///
    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    /// Updates the thread's state.
    ///
    /// # Panics
    ///
    /// `set_state` will panic on a `Blocked` to `Runnable` change
    /// while the thread still sits on a blockable; the waker must use
    /// the unblock path.
    ///
    pub fn set_state(&self, new: ThreadState) {
        if self.state.load() == ThreadState::Blocked && new == ThreadState::Runnable {
            assert!(
                self.blocking_on.lock().is_empty(),
                "thread {} cannot be runnable while blocking",
                self.tid
            );
        }

        self.state.store(new);
    }

    /// Updates the thread's state without validation; the
    /// wake paths flip Blocked to Runnable before the thread
    /// has disentangled itself.
    ///
    pub(crate) fn set_state_unchecked(&self, new: ThreadState) {
        self.state.store(new);
    }

    /// Returns the thread's priority.
    ///
    pub fn priority(&self) -> i16 {
        self.priority.load()
    }

    /// Sets the thread's priority, clamped to `[-100, 100]`.
    ///
    pub fn set_priority(&self, priority: i16) {
        self.priority.store(priority.max(-100).min(100));
    }

    /// Marks when the thread was last dispatched.
    ///
    pub(crate) fn mark_switched_to(&self, now: Instant) {
        self.last_switched_to.store(now.as_nanos(), Ordering::Release);
    }

    /// Returns when the thread was last dispatched.
    ///
    pub fn last_dispatched(&self) -> Instant {
        Instant::from_nanos(self.last_switched_to.load(Ordering::Acquire))
    }

    /// Returns whether a termination request is pending.
    ///
    pub fn needs_to_die(&self) -> bool {
        self.needs_to_die.load(Ordering::Acquire)
    }

    // Task attachment.

    pub(crate) fn mark_attached(&self, task: &Arc<Task>) {
        *self.task.lock() = Arc::downgrade(task);
        self.attached.store(true, Ordering::Release);
    }

    /// Detaches the thread from its task, if attached.
    ///
    pub fn detach(self: &Arc<Thread>) {
        if self.attached.swap(false, Ordering::AcqRel) {
            if let Some(task) = self.task.lock().upgrade() {
                task.remove_thread(self);
            }
        }
    }

    /// Returns whether the thread is attached to a task.
    ///
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    // Notifications.

    /// Delivers notification bits to the thread, waking it
    /// from a notify-wait if any bit is unmasked.
    ///
    /// Delivering bits that are already pending changes nothing;
    /// notifications coalesce.
    ///
    pub fn notify(&self, bits: usize) {
        self.notifications.fetch_or(bits, Ordering::AcqRel);

        let mask = self.notification_mask.load(Ordering::Acquire);
        if bits & mask != 0 {
            let flag = self.notify_flag.lock().clone();
            if let Some(flag) = flag {
                flag.signal();
            }
        }
    }

    /// Returns the pending notification bits.
    ///
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::Acquire)
    }

    /// Sets the thread's notification mask.
    ///
    pub fn set_notification_mask(&self, mask: usize) {
        self.notification_mask.store(mask, Ordering::Release);
    }

    /// Takes the pending notification bits covered by the
    /// current mask, clearing them. Returns zero when none
    /// are pending.
    ///
    pub fn take_notifications(&self) -> usize {
        let mask = self.notification_mask.load(Ordering::Acquire);
        let delivered = self.notifications.load(Ordering::Acquire) & mask;
        if delivered != 0 {
            self.notifications.fetch_and(!delivered, Ordering::AcqRel);
        }

        delivered
    }

    /// Blocks the calling thread until a notification
    /// covered by `mask` arrives, or the deadline passes.
    ///
    /// A zero `mask` keeps the current mask. If matching bits are
    /// already pending they are delivered without blocking.
    ///
    pub fn block_notify(self: &Arc<Thread>, mask: usize, until: Option<Instant>) -> Result<usize, BlockResult> {
        if mask != 0 {
            self.set_notification_mask(mask);
        }

        // The fast path: something already arrived.
        let pending = self.take_notifications();
        if pending != 0 {
            return Ok(pending);
        }

        // Arm a fresh one-shot flag, then look again: a
        // notification from another core may have slipped in
        // before the flag was in place.
        let flag = SignalFlag::new();
        *self.notify_flag.lock() = Some(flag.clone());

        let pending = self.take_notifications();
        if pending != 0 {
            *self.notify_flag.lock() = None;
            return Ok(pending);
        }

        let result = self.block_with(flag, until, ThreadState::NotifyWait);
        *self.notify_flag.lock() = None;

        match result {
            BlockResult::Unblocked | BlockResult::Aborted => {
                let delivered = self.take_notifications();
                if delivered != 0 {
                    Ok(delivered)
                } else {
                    Err(BlockResult::Error)
                }
            }
            other => Err(other),
        }
    }

    // Blocking.

    /// Suspends the calling thread on `blockable`, with an
    /// optional absolute deadline.
    ///
    pub fn block_on(
        self: &Arc<Thread>,
        blockable: Arc<dyn Blockable>,
        until: Option<Instant>,
    ) -> BlockResult {
        self.block_with(blockable, until, ThreadState::Blocked)
    }

    fn block_with(
        self: &Arc<Thread>,
        blockable: Arc<dyn Blockable>,
        until: Option<Instant>,
        state: ThreadState,
    ) -> BlockResult {
        self.block_state.store(BlockState::Blocking);

        if blockable.will_block_on(self).is_err() {
            // The blockable refused; if it is already
            // signalled the condition is simply satisfied.
            self.block_state.store(BlockState::Inactive);
            self.set_state_unchecked(ThreadState::Runnable);

            return if blockable.is_signalled() {
                blockable.reset();
                BlockResult::Unblocked
            } else {
                BlockResult::Aborted
            };
        }

        self.blocking_on.lock().push(blockable);

        // Arm the timeout.
        let timeout: Option<Arc<dyn time::Deadline>> = until.map(|when| {
            Arc::new(BlockTimeout {
                when,
                thread: self.us.clone(),
            }) as Arc<dyn time::Deadline>
        });
        if let Some(timeout) = timeout.as_ref() {
            scheduler::current().add_deadline(timeout.clone());
        }

        self.set_state_unchecked(state);
        scheduler::current().switch_away();

        // We're back: something woke us. Disentangle from
        // everything we were blocking on and settle the
        // reason.
        if let Some(timeout) = timeout {
            scheduler::current().remove_deadline(&timeout);
        }

        let blockables = {
            let mut blocking_on = self.blocking_on.lock();
            let taken: Vec<Arc<dyn Blockable>> = blocking_on.drain(..).collect();
            taken
        };
        for blockable in blockables.iter() {
            blockable.did_unblock();
            if blockable.is_signalled() {
                blockable.reset();
            }
        }

        match self.block_state.swap(BlockState::Inactive) {
            BlockState::Unblocked => BlockResult::Unblocked,
            BlockState::TimedOut => BlockResult::Timeout,
            _ => BlockResult::Error,
        }
    }

    /// Wakes the thread because a blockable signalled. The
    /// first waker wins; a concurrent timeout loses the race
    /// and changes nothing.
    ///
    pub fn unblock(&self) {
        if self
            .block_state
            .compare_exchange(BlockState::Blocking, BlockState::Unblocked)
            .is_ok()
        {
            self.make_runnable();
        }
    }

    /// Expires the thread's timed block. The first waker
    /// wins.
    ///
    pub(crate) fn block_expired(&self) {
        if self
            .block_state
            .compare_exchange(BlockState::Blocking, BlockState::TimedOut)
            .is_ok()
        {
            self.make_runnable();
        }
    }

    fn make_runnable(&self) {
        let thread = match self.us.upgrade() {
            Some(thread) => thread,
            None => return,
        };

        match scheduler::for_core(self.core()) {
            Some(sched) => sched.mark_runnable(&thread),
            None => self.set_state_unchecked(ThreadState::Runnable),
        }
    }

    // Deferred procedure calls.

    /// Queues a DPC to run in this thread's kernel context
    /// at the next safe point.
    ///
    pub fn add_dpc(&self, handler: fn(&Arc<Thread>, usize), context: usize) {
        self.dpcs.lock().push_back(Dpc { handler, context });
        self.dpcs_pending.store(true, Ordering::Release);
    }

    /// Returns whether DPCs are queued.
    ///
    pub fn dpcs_pending(&self) -> bool {
        self.dpcs_pending.load(Ordering::Acquire)
    }

    /// Drains the DPC queue in order.
    ///
    pub fn run_dpcs(self: &Arc<Thread>) {
        loop {
            let next = self.dpcs.lock().pop_front();
            match next {
                Some(dpc) => (dpc.handler)(self, dpc.context),
                None => break,
            }
        }

        self.dpcs_pending.store(false, Ordering::Release);
    }

    // IRQ handler ownership.

    /// Records an interrupt registration owned by this
    /// thread.
    ///
    pub fn add_irq_binding(&self, binding: Arc<dyn IrqBinding>) {
        self.irq_bindings.lock().push(binding);
    }

    /// Drops an interrupt registration.
    ///
    pub fn remove_irq_binding(&self, binding: &Arc<dyn IrqBinding>) {
        self.irq_bindings
            .lock()
            .retain(|owned| !Arc::ptr_eq(owned, binding));
    }

    // Termination.

    /// Waits for the thread to terminate.
    ///
    pub fn wait_on(self: &Arc<Thread>, until: Option<Instant>) -> BlockResult {
        if self.state() == ThreadState::Zombie {
            return BlockResult::Unblocked;
        }

        let flag = SignalFlag::new();
        self.terminate_signals.lock().push(flag.clone());

        Thread::current().block_on(flag, until)
    }

    /// Fires every termination signal registered on the
    /// thread.
    ///
    pub(crate) fn call_terminators(&self) {
        let signals: Vec<Arc<SignalFlag>> = self.terminate_signals.lock().drain(..).collect();
        for signal in signals {
            signal.signal();
        }
    }

    /// Detaches the thread's interrupt registrations.
    ///
    pub(crate) fn detach_irq_bindings(&self) {
        let bindings: Vec<Arc<dyn IrqBinding>> = self.irq_bindings.lock().drain(..).collect();
        for binding in bindings {
            binding.detach();
        }
    }

    /// Terminates a thread that is not the calling thread:
    /// removes it from scheduling, fires its terminators and
    /// hands it to the idle worker for destruction.
    ///
    /// Requests against the calling thread take the exit path
    /// instead.
    ///
    pub fn terminate(self: &Arc<Thread>) {
        if let Some(current) = cpu_local::try_current_thread() {
            if Arc::ptr_eq(&current, self) {
                Thread::exit();
            }
        }

        self.needs_to_die.store(true, Ordering::Release);

        if let Some(sched) = scheduler::for_core(self.core()) {
            sched.remove(self);
        }
        self.set_state_unchecked(ThreadState::Zombie);

        self.call_terminators();
        self.detach_irq_bindings();

        if let Some(sched) = scheduler::for_core(self.core()) {
            sched.idle_worker().queue_destroy_thread(self.clone());
        }
    }

    /// Terminates the calling thread and switches away for
    /// the last time.
    ///
    /// # Panics
    ///
    /// `exit` will panic if the dead thread is ever dispatched again.
    ///
    pub fn exit() -> ! {
        let current = Thread::current();

        current.set_state_unchecked(ThreadState::Zombie);
        current.call_terminators();
        current.detach_irq_bindings();

        let sched = scheduler::current();
        sched.idle_worker().queue_destroy_thread(current.clone());
        drop(current);

        sched.switch_away();
        unreachable!("a zombie thread was dispatched");
    }

    /// Suspends the calling thread for at least `duration`.
    ///
    pub fn sleep(duration: Duration) {
        let timer = crate::blockable::TimerBlocker::new(duration);
        let current = Thread::current();
        let _ = current.block_with(timer, None, ThreadState::Sleeping);
    }

    /// Yields the rest of the calling thread's quantum.
    ///
    pub fn yield_now() {
        scheduler::current().yield_current();
    }

    /// Handles a processor fault taken by this thread.
    ///
    /// A general fault terminates the containing task; everything
    /// else terminates just the thread.
    ///
    pub fn handle_fault(self: &Arc<Thread>, fault: FaultType, pc: usize) -> ! {
        println!(
            "thread {} ({}) fault {:?} at {:#x}",
            self.tid,
            self.name().as_str(),
            fault,
            pc
        );

        if fault == FaultType::General {
            if let Some(task) = self.task() {
                task.terminate(-1);
                unreachable!("terminated task kept running");
            }
        }

        self.terminate();
        unreachable!("terminated thread kept running");
    }

    /// Returns the pending ring-3 entry state. Consumed by
    /// the user thread start trampoline.
    ///
    /// # Panics
    ///
    /// `user_entry` will panic on a thread that was never given one.
    ///
    pub fn user_entry(&self) -> (VirtAddr, VirtAddr, usize) {
        self.user_entry
            .lock()
            .expect("thread has no user entry state")
    }

    /// Replaces the pending ring-3 entry state. Used by task
    /// initialisation to aim the main thread at its final
    /// entry point.
    ///
    pub fn set_user_entry(&self, pc: VirtAddr, sp: VirtAddr, arg: usize) {
        *self.user_entry.lock() = Some((pc, sp, arg));
    }

}

impl Drop for Thread {
    fn drop(&mut self) {
        // Return the kernel stack. Adopted boot contexts
        // have none.
        if let Some(stack) = self.stack.take() {
            stackpool::release(stack);
        }
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}

/// The deadline armed for a timed block.
///
struct BlockTimeout {
    when: Instant,
    thread: Weak<Thread>,
}

impl time::Deadline for BlockTimeout {
    fn when(&self) -> Instant {
        self.when
    }

    fn expired(&self) {
        if let Some(thread) = self.thread.upgrade() {
            thread.block_expired();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Thread, ThreadState};

    #[test]
    fn notify_coalesces() {
        let thread = Thread::adopt("notify-test");
        thread.set_notification_mask(0xff);

        // Delivering the same bits twice equals delivering
        // them once.
        thread.notify(0x4);
        thread.notify(0x4);
        assert_eq!(thread.notifications(), 0x4);

        thread.notify(0x3);
        assert_eq!(thread.notifications(), 0x7);

        // Taking delivers only the masked bits, and clears
        // them.
        thread.set_notification_mask(0x5);
        assert_eq!(thread.take_notifications(), 0x5);
        assert_eq!(thread.notifications(), 0x2);
        assert_eq!(thread.take_notifications(), 0);
    }

    #[test]
    fn notify_bits_outside_mask_stay_pending() {
        let thread = Thread::adopt("mask-test");
        thread.set_notification_mask(0x1);

        thread.notify(0x8);
        assert_eq!(thread.take_notifications(), 0);
        assert_eq!(thread.notifications(), 0x8);

        // Widening the mask releases them.
        thread.set_notification_mask(0x8);
        assert_eq!(thread.take_notifications(), 0x8);
    }

    #[test]
    fn dpcs_run_in_order() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static ORDER: AtomicUsize = AtomicUsize::new(0);

        fn first(_thread: &alloc::sync::Arc<Thread>, context: usize) {
            let seen = ORDER.fetch_add(1, Ordering::SeqCst);
            assert_eq!(seen, 0);
            assert_eq!(context, 10);
        }

        fn second(_thread: &alloc::sync::Arc<Thread>, context: usize) {
            let seen = ORDER.fetch_add(1, Ordering::SeqCst);
            assert_eq!(seen, 1);
            assert_eq!(context, 20);
        }

        let thread = Thread::adopt("dpc-test");
        assert!(!thread.dpcs_pending());

        thread.add_dpc(first, 10);
        thread.add_dpc(second, 20);
        assert!(thread.dpcs_pending());

        thread.run_dpcs();
        assert!(!thread.dpcs_pending());
        assert_eq!(ORDER.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn priority_clamps() {
        let thread = Thread::adopt("priority-test");
        assert_eq!(thread.priority(), 0);

        thread.set_priority(250);
        assert_eq!(thread.priority(), 100);
        thread.set_priority(-250);
        assert_eq!(thread.priority(), -100);
        thread.set_priority(42);
        assert_eq!(thread.priority(), 42);
    }

    #[test]
    fn tids_are_unique() {
        let first = Thread::adopt("a");
        let second = Thread::adopt("b");
        assert_ne!(first.tid(), second.tid());
        assert_eq!(first.state(), ThreadState::Runnable);
    }
}
