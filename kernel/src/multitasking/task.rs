// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tasks: the units of resource ownership.
//!
//! A task owns an address space, the memory objects it has allocated,
//! its message ports, and one or more threads. Ownership flows
//! downwards only; threads refer back to their task weakly, so a dead
//! task cannot be kept alive by its own threads.
//!
//! Task teardown is ordered: waiters on the termination signal are
//! woken first, then every thread is terminated, then the task is
//! unregistered; the address space goes last, when the final
//! reference drops. A task that terminates itself detaches its
//! calling thread and lets that thread exit last.

use crate::blockable::SignalFlag;
use crate::cpu_local;
use crate::registry;
use crate::scheduler;
use crate::thread::Thread;
use crate::Name;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use crossbeam::atomic::AtomicCell;
use spin::{Mutex, Once, RwLock};
use syscalls::Handle;
use virtmem::{Map, MapEntry, PageCounter};

/// The lifecycle states of a task.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Being set up; not schedulable yet.
    Initializing,
    /// Holds at least one thread and may be scheduled.
    Runnable,
    /// Dead; will be destroyed by the idle worker.
    Zombie,
}

/// A port owned by a task. The concrete port type lives
/// above this crate; the task tracks ownership by identity.
///
pub trait OwnedPort: Send + Sync {
    /// The port's handle, for bookkeeping and debugging.
    fn handle(&self) -> Handle;
}

/// A task.
///
pub struct Task {
    us: Weak<Task>,
    pid: u32,
    name: Mutex<Name>,
    state: AtomicCell<TaskState>,
    handle: AtomicU64,
    exit_code: AtomicI64,

    /// The task's address space.
    map: Arc<Map>,
    /// Whether this task is the map's principal owner, or
    /// merely shares another task's.
    owns_vm: bool,
    /// Physical page accounting.
    pages: Arc<PageCounter>,

    threads: RwLock<Vec<Arc<Thread>>>,
    owned_regions: RwLock<Vec<Arc<MapEntry>>>,
    ports: RwLock<Vec<Arc<dyn OwnedPort>>>,

    terminate_signals: Mutex<Vec<Arc<SignalFlag>>>,
}

/// Process ids are monotonic and never reused.
///
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// The kernel's own task.
///
static KERNEL_TASK: Once<Arc<Task>> = Once::new();

/// Builds the kernel task over the kernel address space.
/// Called once during bring-up, after the kernel map exists.
///
pub fn init_kernel_task() {
    KERNEL_TASK.call_once(|| {
        let task = Task::create(virtmem::kern().clone(), false);
        task.set_name("kernel_task");
        task.set_state(TaskState::Runnable);
        task
    });
}

/// Returns the kernel task.
///
/// # Panics
///
/// `kernel_task` will panic before [`init_kernel_task`].
///
pub fn kernel_task() -> &'static Arc<Task> {
    KERNEL_TASK
        .get()
        .expect("kernel task used before initialisation")
}

impl Task {
    /// Creates a task over the given address space and
    /// registers it globally.
    ///
    /// `owns_vm` records whether the task is responsible for the map
    /// or aliases one owned elsewhere.
    ///
    pub fn create(map: Arc<Map>, owns_vm: bool) -> Arc<Task> {
        let task = Arc::new_cyclic(|us| Task {
            us: us.clone(),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            name: Mutex::new(Name::empty()),
            state: AtomicCell::new(TaskState::Initializing),
            handle: AtomicU64::new(Handle::INVALID.as_raw()),
            exit_code: AtomicI64::new(0),
            map,
            owns_vm,
            pages: PageCounter::new(),
            threads: RwLock::new(Vec::new()),
            owned_regions: RwLock::new(Vec::new()),
            ports: RwLock::new(Vec::new()),
            terminate_signals: Mutex::new(Vec::new()),
        });

        registry::register(&task);
        task
    }

    /// Returns the calling thread's task.
    ///
    pub fn current() -> Option<Arc<Task>> {
        cpu_local::try_current_thread()?.task()
    }

    /// Returns the task's process id.
    ///
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the task's name.
    ///
    pub fn name(&self) -> Name {
        *self.name.lock()
    }

    /// Sets the task's name.
    ///
    pub fn set_name(&self, name: &str) {
        self.name.lock().set(name);
    }

    /// Returns the task's handle.
    ///
    pub fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Acquire))
    }

    /// Records the task's handle.
    ///
    pub fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.as_raw(), Ordering::Release);
    }

    /// Returns the task's state.
    ///
    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// Updates the task's state.
    ///
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state);
    }

    /// Returns the task's exit code, meaningful once the
    /// task is a zombie.
    ///
    pub fn exit_code(&self) -> i64 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Returns the task's address space.
    ///
    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    /// Returns whether the task is the principal owner of
    /// its address space.
    ///
    pub fn owns_vm(&self) -> bool {
        self.owns_vm
    }

    /// Returns the task's page accounting counter.
    ///
    pub fn pages(&self) -> &Arc<PageCounter> {
        &self.pages
    }

    // Threads.

    /// Attaches a thread to the task.
    ///
    pub fn add_thread(&self, thread: &Arc<Thread>) {
        if let Some(task) = self.us.upgrade() {
            thread.mark_attached(&task);
        }

        self.threads.write().push(thread.clone());
    }

    /// Detaches a thread from the task.
    ///
    pub fn remove_thread(&self, thread: &Arc<Thread>) {
        self.threads
            .write()
            .retain(|attached| !Arc::ptr_eq(attached, thread));
    }

    /// Returns a snapshot of the task's threads.
    ///
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.read().clone()
    }

    // Owned memory objects.

    /// Records a memory object the task owns.
    ///
    pub fn add_owned_region(&self, entry: &Arc<MapEntry>) {
        self.owned_regions.write().push(entry.clone());
    }

    /// Drops a memory object from the owned list, returning
    /// whether it was there.
    ///
    pub fn remove_owned_region(&self, entry: &Arc<MapEntry>) -> bool {
        let mut regions = self.owned_regions.write();
        let before = regions.len();
        regions.retain(|owned| !Arc::ptr_eq(owned, entry));

        regions.len() != before
    }

    /// Returns whether the task owns the given memory
    /// object.
    ///
    pub fn owns_region(&self, entry: &Arc<MapEntry>) -> bool {
        self.owned_regions
            .read()
            .iter()
            .any(|owned| Arc::ptr_eq(owned, entry))
    }

    /// Returns the number of memory objects the task owns.
    ///
    pub fn owned_region_count(&self) -> usize {
        self.owned_regions.read().len()
    }

    // Ports.

    /// Records a port the task owns.
    ///
    pub fn add_port(&self, port: Arc<dyn OwnedPort>) {
        self.ports.write().push(port);
    }

    /// Drops a port from the owned list, returning whether
    /// it was there.
    ///
    pub fn remove_port(&self, port: &Arc<dyn OwnedPort>) -> bool {
        let mut ports = self.ports.write();
        let before = ports.len();
        ports.retain(|owned| !Arc::ptr_eq(owned, port));

        ports.len() != before
    }

    /// Returns whether the task owns the given port.
    ///
    pub fn owns_port(&self, port: &Arc<dyn OwnedPort>) -> bool {
        self.ports.read().iter().any(|owned| Arc::ptr_eq(owned, port))
    }

    // Termination.

    /// Registers a signal to fire when the task terminates.
    ///
    pub fn add_terminate_signal(&self, signal: Arc<SignalFlag>) {
        self.terminate_signals.lock().push(signal);
    }

    /// Terminates the task.
    ///
    /// Waiters on the termination signal are woken, every thread is
    /// terminated, and the task is handed to the idle worker for
    /// destruction. If the calling thread belongs to this task it
    /// detaches and exits last, and `terminate` does not return.
    ///
    pub fn terminate(self: &Arc<Task>, code: i64) {
        if self.state.swap(TaskState::Zombie) == TaskState::Zombie {
            return;
        }

        self.exit_code.store(code, Ordering::Release);

        // Wake anyone waiting for us to die.
        let signals: Vec<Arc<SignalFlag>> = self.terminate_signals.lock().drain(..).collect();
        for signal in signals {
            signal.signal();
        }

        // Terminate the threads, leaving the calling thread
        // for last if it is one of ours.
        let current = cpu_local::try_current_thread();
        let mut exiting_self = false;

        for thread in self.threads() {
            if let Some(current) = current.as_ref() {
                if Arc::ptr_eq(current, &thread) {
                    exiting_self = true;
                    continue;
                }
            }

            thread.terminate();
        }

        registry::unregister(self);

        if let Some(sched) = scheduler::for_core(cpu::core_id()) {
            sched.idle_worker().queue_destroy_task(self.clone());
        }

        if exiting_self {
            if let Some(current) = current {
                current.detach();
            }

            Thread::exit();
        }
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Task, TaskState};
    use crate::registry;
    use crate::thread::{Thread, ThreadState};
    use alloc::sync::Arc;
    use pagetable::{AddressMapper, MapError, PageFlags, UnmapError};
    use virtmem::Map;
    use x86_64::{PhysAddr, VirtAddr};

    /// A do-nothing address space for task tests.
    struct NullMapper;

    impl AddressMapper for NullMapper {
        fn map_page(
            &mut self,
            _phys: PhysAddr,
            _virt: VirtAddr,
            _flags: PageFlags,
        ) -> Result<(), MapError> {
            Ok(())
        }

        fn unmap_page(&mut self, _virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
            Err(UnmapError::NotMapped)
        }

        fn translate(&self, _virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
            None
        }

        fn zero_frame(&mut self, _phys: PhysAddr) {}

        fn activate(&self) {}

        fn is_active(&self) -> bool {
            false
        }
    }

    fn test_task() -> Arc<Task> {
        let map = Map::with_table(alloc::boxed::Box::new(NullMapper), false);
        Task::create(map, true)
    }

    #[test]
    fn pids_are_monotonic() {
        let first = test_task();
        let second = test_task();
        assert!(second.pid() > first.pid());
        assert_eq!(first.state(), TaskState::Initializing);

        first.terminate(0);
        second.terminate(0);
    }

    #[test]
    fn threads_attach_and_detach() {
        let task = test_task();

        let thread = Thread::adopt("worker");
        task.add_thread(&thread);
        assert!(thread.is_attached());
        assert_eq!(task.threads().len(), 1);
        assert!(Arc::ptr_eq(&thread.task().unwrap(), &task));

        thread.detach();
        assert!(!thread.is_attached());
        assert!(task.threads().is_empty());

        task.terminate(0);
    }

    #[test]
    fn terminate_kills_threads_and_unregisters() {
        let task = test_task();
        let pid = task.pid();

        let thread = Thread::adopt("doomed");
        task.add_thread(&thread);

        assert!(registry::find_by_pid(pid).is_some());

        task.terminate(-1);
        assert_eq!(task.state(), TaskState::Zombie);
        assert_eq!(task.exit_code(), -1);
        assert_eq!(thread.state(), ThreadState::Zombie);
        assert!(registry::find_by_pid(pid).is_none());

        // A second terminate is a no-op.
        task.terminate(7);
        assert_eq!(task.exit_code(), -1);
    }

    #[test]
    fn termination_signals_fire() {
        use crate::blockable::{Blockable, SignalFlag};

        let task = test_task();
        let signal = SignalFlag::new();
        task.add_terminate_signal(signal.clone());

        assert!(!signal.is_signalled());
        task.terminate(0);
        assert!(signal.is_signalled());
    }
}
