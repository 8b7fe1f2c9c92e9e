// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The IRQ-to-notification bridge.
//!
//! An [`IrqHandler`] ties a hardware interrupt to a thread: while
//! installed, every firing of the IRQ ORs the handler's notification
//! bits into the target thread. The handler holds a strong reference
//! to its thread, and the thread records the handler so its interrupt
//! registrations are torn down when it dies.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};
use interrupts::IrqRegistry;
use multitasking::thread::{IrqBinding, Thread};
use spin::Mutex;
use syscalls::Handle;

/// A registered interrupt handler delivering notifications
/// to a thread.
///
pub struct IrqHandler {
    us: Weak<IrqHandler>,
    handle: AtomicU64,
    /// The registry the handler is installed in.
    registry: &'static IrqRegistry,
    /// The logical IRQ number.
    irq: usize,
    /// The registry token, present while installed.
    token: Mutex<Option<usize>>,
    /// The thread to notify and the bits to deliver.
    target: Mutex<(Arc<Thread>, usize)>,
}

impl IrqHandler {
    /// Installs a handler for `irq` that notifies `thread`
    /// with `bits` on every firing.
    ///
    /// The handler is recorded on the thread, so it is removed
    /// automatically when the thread terminates. Returns `None` if
    /// the IRQ number is out of range.
    ///
    pub fn install(
        registry: &'static IrqRegistry,
        irq: usize,
        thread: Arc<Thread>,
        bits: usize,
    ) -> Option<Arc<IrqHandler>> {
        let handler = Arc::new_cyclic(|us| IrqHandler {
            us: us.clone(),
            handle: AtomicU64::new(Handle::INVALID.as_raw()),
            registry,
            irq,
            token: Mutex::new(None),
            target: Mutex::new((thread.clone(), bits)),
        });

        // The registration context carries a raw reference to
        // the handler; the matching release happens in
        // remove().
        let context = Arc::into_raw(handler.clone()) as usize;
        let token = match registry.add(irq, irq_fired, context) {
            Some(token) => token,
            None => {
                // Take the raw reference back.
                unsafe { Arc::from_raw(context as *const IrqHandler) };
                return None;
            }
        };

        *handler.token.lock() = Some(token);
        thread.add_irq_binding(handler.clone());

        Some(handler)
    }

    /// Returns the handler's handle.
    ///
    pub fn irq_handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Acquire))
    }

    /// Records the handler's handle.
    ///
    pub fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.as_raw(), Ordering::Release);
    }

    /// Returns the logical IRQ number.
    ///
    pub fn irq(&self) -> usize {
        self.irq
    }

    /// Returns the CPU vector the IRQ routes through.
    ///
    pub fn vector(&self) -> usize {
        interrupts::vector_for_irq(self.irq)
    }

    /// Returns the thread the handler notifies.
    ///
    pub fn thread(&self) -> Arc<Thread> {
        self.target.lock().0.clone()
    }

    /// Re-targets the handler at a different thread or bit
    /// set.
    ///
    pub fn set_target(&self, thread: Arc<Thread>, bits: usize) {
        let previous = {
            let mut target = self.target.lock();
            let previous = target.0.clone();
            *target = (thread.clone(), bits);
            previous
        };

        // Move the ownership record between the threads.
        if !Arc::ptr_eq(&previous, &thread) {
            if let Some(us) = self.us.upgrade() {
                let binding: Arc<dyn IrqBinding> = us;
                previous.remove_irq_binding(&binding);
                thread.add_irq_binding(binding.clone());
            }
        }
    }

    /// Uninstalls the handler. Further firings of the IRQ no
    /// longer notify the thread.
    ///
    pub fn remove(&self) {
        let token = self.token.lock().take();
        if let Some(token) = token {
            self.registry.remove(token);

            // Release the raw reference the registration
            // held.
            unsafe { Arc::from_raw(self as *const IrqHandler) };
        }
    }

    /// The IRQ fired: deliver the notification.
    ///
    fn fired(&self) {
        let (thread, bits) = {
            let target = self.target.lock();
            (target.0.clone(), target.1)
        };

        thread.notify(bits);
    }
}

impl IrqBinding for IrqHandler {
    fn detach(&self) {
        self.remove();
    }
}

/// The registry-facing trampoline.
///
fn irq_fired(context: usize, _irq: usize) -> bool {
    let handler = unsafe { &*(context as *const IrqHandler) };
    handler.fired();

    true
}

#[cfg(test)]
mod tests {
    use super::IrqHandler;
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use interrupts::{IrqController, IrqRegistry};
    use multitasking::thread::Thread;

    #[derive(Default)]
    struct FakeController {
        acknowledged: AtomicUsize,
    }

    impl IrqController for FakeController {
        fn enable(&self, _irq: usize) {}
        fn disable(&self, _irq: usize) {}
        fn acknowledge(&self, _irq: usize) {
            self.acknowledged.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> &'static IrqRegistry {
        let controller = Box::leak(Box::new(FakeController::default()));
        Box::leak(Box::new(IrqRegistry::new(controller)))
    }

    #[test]
    fn firing_notifies_the_thread() {
        let registry = registry();
        let thread = Thread::adopt("irq-target");
        thread.set_notification_mask(0x4);

        let handler = IrqHandler::install(registry, 9, thread.clone(), 0x4).unwrap();
        assert_eq!(handler.irq(), 9);
        assert_eq!(handler.vector(), interrupts::vector_for_irq(9));

        // Dispatching the IRQ delivers the bits.
        registry.dispatch(9);
        assert_eq!(thread.notifications(), 0x4);

        // Twice in a row coalesces.
        registry.dispatch(9);
        assert_eq!(thread.notifications(), 0x4);

        handler.remove();
        assert_eq!(registry.handler_count(9), 0);
    }

    #[test]
    fn retargeting_moves_the_notification() {
        let registry = registry();
        let first = Thread::adopt("first");
        let second = Thread::adopt("second");

        let handler = IrqHandler::install(registry, 3, first.clone(), 0x1).unwrap();
        registry.dispatch(3);
        assert_eq!(first.notifications(), 0x1);

        handler.set_target(second.clone(), 0x2);
        registry.dispatch(3);
        assert_eq!(first.notifications(), 0x1);
        assert_eq!(second.notifications(), 0x2);

        handler.remove();
    }

    #[test]
    fn out_of_range_irq_fails() {
        let registry = registry();
        let thread = Thread::adopt("nope");
        assert!(IrqHandler::install(registry, interrupts::NUM_IRQS, thread, 0x1).is_none());
    }
}
