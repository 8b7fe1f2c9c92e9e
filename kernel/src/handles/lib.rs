// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The handle manager.
//!
//! Kernel objects cross the syscall boundary as opaque handles. Each
//! object type has a table of slots; a handle packs the type, the
//! slot and the slot's generation at creation time. Releasing a slot
//! leaves its generation behind, and generations only move forward,
//! so a stale handle fails the generation compare instead of
//! resolving to the slot's next occupant. With 24 bits of generation
//! per table, a handle cannot come back to life within any realistic
//! horizon.
//!
//! The tables hold strong references: an object stays alive at least
//! as long as a handle to it is registered. Creation paths register
//! objects here; destruction paths release them first.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use ipc::{IrqHandler, Port};
use multitasking::task::Task;
use multitasking::thread::Thread;
use slab::Slab;
use spin::RwLock;
use syscalls::{Handle, HandleType};
use virtmem::MapEntry;

/// A table of handles for one object type.
///
pub struct HandleTable<T> {
    kind: HandleType,
    slots: RwLock<Slab<(u32, T)>>,
    next_generation: AtomicU32,
}

impl<T: Clone> HandleTable<T> {
    /// Returns an empty table issuing handles of the given
    /// type.
    ///
    pub const fn new(kind: HandleType) -> HandleTable<T> {
        HandleTable {
            kind,
            slots: RwLock::new(Slab::new()),
            next_generation: AtomicU32::new(1),
        }
    }

    /// Stores `value` and returns a fresh handle to it.
    ///
    pub fn make(&self, value: T) -> Handle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) & 0xff_ffff;
        let slot = self.slots.write().insert((generation, value));

        Handle::new(self.kind, generation, slot as u32)
    }

    /// Resolves a handle, returning a strong reference to
    /// the object it names.
    ///
    /// Fails on the wrong type, an unknown slot, or a generation
    /// mismatch (a released handle).
    ///
    pub fn resolve(&self, handle: Handle) -> Option<T> {
        if handle.kind() != Some(self.kind) {
            return None;
        }

        let slots = self.slots.read();
        let (generation, value) = slots.get(handle.slot() as usize)?;
        if *generation != handle.generation() {
            return None;
        }

        Some(value.clone())
    }

    /// Releases a handle, dropping the table's reference.
    /// Returns the object if the handle was valid.
    ///
    pub fn release(&self, handle: Handle) -> Option<T> {
        if self.resolve(handle).is_none() {
            return None;
        }

        let (_, value) = self.slots.write().remove(handle.slot() as usize);
        Some(value)
    }

    /// Returns the number of live handles in the table.
    ///
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns whether the table is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static TASKS: HandleTable<Arc<Task>> = HandleTable::new(HandleType::Task);
static THREADS: HandleTable<Arc<Thread>> = HandleTable::new(HandleType::Thread);
static PORTS: HandleTable<Arc<Port>> = HandleTable::new(HandleType::Port);
static VM_OBJECTS: HandleTable<Arc<MapEntry>> = HandleTable::new(HandleType::VmObject);
static IRQ_HANDLERS: HandleTable<Arc<IrqHandler>> = HandleTable::new(HandleType::IrqHandler);

/// Issues a handle for a task and records it on the task.
///
pub fn make_task_handle(task: &Arc<Task>) -> Handle {
    let handle = TASKS.make(task.clone());
    task.set_handle(handle);
    handle
}

/// Resolves a task handle.
///
pub fn task(handle: Handle) -> Option<Arc<Task>> {
    TASKS.resolve(handle)
}

/// Releases a task handle.
///
pub fn release_task_handle(handle: Handle) -> Option<Arc<Task>> {
    TASKS.release(handle)
}

/// Issues a handle for a thread and records it on the
/// thread.
///
pub fn make_thread_handle(thread: &Arc<Thread>) -> Handle {
    let handle = THREADS.make(thread.clone());
    thread.set_handle(handle);
    handle
}

/// Resolves a thread handle.
///
pub fn thread(handle: Handle) -> Option<Arc<Thread>> {
    THREADS.resolve(handle)
}

/// Releases a thread handle.
///
pub fn release_thread_handle(handle: Handle) -> Option<Arc<Thread>> {
    THREADS.release(handle)
}

/// Issues a handle for a port and records it on the port.
///
pub fn make_port_handle(port: &Arc<Port>) -> Handle {
    let handle = PORTS.make(port.clone());
    port.set_handle(handle);
    handle
}

/// Resolves a port handle.
///
pub fn port(handle: Handle) -> Option<Arc<Port>> {
    PORTS.resolve(handle)
}

/// Releases a port handle.
///
pub fn release_port_handle(handle: Handle) -> Option<Arc<Port>> {
    PORTS.release(handle)
}

/// Issues a handle for a memory object and records it on
/// the object.
///
pub fn make_vm_object_handle(entry: &Arc<MapEntry>) -> Handle {
    let handle = VM_OBJECTS.make(entry.clone());
    entry.set_handle(handle);
    handle
}

/// Resolves a memory object handle.
///
pub fn vm_object(handle: Handle) -> Option<Arc<MapEntry>> {
    VM_OBJECTS.resolve(handle)
}

/// Releases a memory object handle.
///
pub fn release_vm_object_handle(handle: Handle) -> Option<Arc<MapEntry>> {
    VM_OBJECTS.release(handle)
}

/// Issues a handle for an IRQ handler and records it on the
/// handler.
///
pub fn make_irq_handle(handler: &Arc<IrqHandler>) -> Handle {
    let handle = IRQ_HANDLERS.make(handler.clone());
    handler.set_handle(handle);
    handle
}

/// Resolves an IRQ handler handle.
///
pub fn irq_handler(handle: Handle) -> Option<Arc<IrqHandler>> {
    IRQ_HANDLERS.resolve(handle)
}

/// Releases an IRQ handler handle.
///
pub fn release_irq_handle(handle: Handle) -> Option<Arc<IrqHandler>> {
    IRQ_HANDLERS.release(handle)
}

#[cfg(test)]
mod tests {
    use super::HandleTable;
    use syscalls::{Handle, HandleType};

    #[test]
    fn handles_resolve_until_released() {
        let table: HandleTable<u64> = HandleTable::new(HandleType::Port);

        let handle = table.make(77);
        assert!(handle.is_valid());
        assert_eq!(handle.kind(), Some(HandleType::Port));
        assert_eq!(table.resolve(handle), Some(77));
        assert_eq!(table.len(), 1);

        // Releasing invalidates the handle permanently.
        assert_eq!(table.release(handle), Some(77));
        assert_eq!(table.resolve(handle), None);
        assert_eq!(table.release(handle), None);
        assert!(table.is_empty());
    }

    #[test]
    fn released_slots_do_not_alias() {
        let table: HandleTable<u64> = HandleTable::new(HandleType::Thread);

        let stale = table.make(1);
        table.release(stale);

        // The slot is reused, but the stale handle still
        // resolves to nothing.
        let fresh = table.make(2);
        assert_eq!(fresh.slot(), stale.slot());
        assert_ne!(fresh, stale);
        assert_eq!(table.resolve(stale), None);
        assert_eq!(table.resolve(fresh), Some(2));
    }

    #[test]
    fn wrong_type_handles_fail() {
        let ports: HandleTable<u64> = HandleTable::new(HandleType::Port);
        let tasks: HandleTable<u64> = HandleTable::new(HandleType::Task);

        let port = ports.make(5);
        assert_eq!(tasks.resolve(port), None);
        assert_eq!(ports.resolve(port), Some(5));

        // Structurally invalid handles fail everywhere.
        assert_eq!(ports.resolve(Handle::INVALID), None);
        assert_eq!(ports.resolve(Handle::from_raw(0xdead_beef)), None);
    }
}
