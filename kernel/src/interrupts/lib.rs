// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Interrupt dispatch: the core-local IRQ registry.
//!
//! Each core owns an [`IrqRegistry`]: an array indexed by logical IRQ
//! number of handler registrations. Installing the first handler for
//! an IRQ routes the hardware vector to the registry and unmasks the
//! IRQ at the controller; removing the last one masks it again. The
//! controller itself (IOAPIC programming, vector trampolines) is a
//! platform collaborator behind the [`IrqController`] trait.
//!
//! Dispatch walks the registration list in order. Each handler
//! returns whether traversal should continue; after the walk the
//! controller is acknowledged unconditionally.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use cpu::MAX_CPUS;
use spin::{Mutex, Once};

/// The number of logical IRQ lines a registry routes.
///
pub const NUM_IRQS: usize = 64;

/// The CPU vector assigned to logical IRQ 0; the rest follow
/// in order.
///
pub const FIRST_VECTOR: usize = 0x40;

/// Returns the CPU vector for a logical IRQ.
///
pub fn vector_for_irq(irq: usize) -> usize {
    FIRST_VECTOR + irq
}

/// A handler invoked when an IRQ fires. Returns whether
/// dispatch should continue to the next handler.
///
pub type HandlerFn = fn(context: usize, irq: usize) -> bool;

/// The platform interrupt controller, as the registry sees
/// it.
///
pub trait IrqController: Send + Sync {
    /// Routes the IRQ's vector to the registry and unmasks
    /// it.
    fn enable(&self, irq: usize);

    /// Masks the IRQ and removes its vector routing.
    fn disable(&self, irq: usize);

    /// Signals completion of the IRQ to the controller.
    fn acknowledge(&self, irq: usize);
}

/// One registered handler.
///
struct Registration {
    token: usize,
    handler: HandlerFn,
    context: usize,
}

/// Registration tokens are allocated from a single counter
/// across all cores; zero is never issued.
///
static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

/// One core's IRQ registry.
///
pub struct IrqRegistry {
    controller: &'static dyn IrqController,
    vectors: Mutex<[Vec<Registration>; NUM_IRQS]>,
}

/// The per-core registries.
///
static REGISTRIES: [Once<IrqRegistry>; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NONE: Once<IrqRegistry> = Once::new();
    [NONE; MAX_CPUS]
};

/// Builds the calling core's registry over the platform
/// controller.
///
/// # Panics
///
/// `init_core` will panic if the core already has a registry.
///
pub fn init_core(controller: &'static dyn IrqController) -> &'static IrqRegistry {
    let core = cpu::core_id();
    let mut fresh = false;
    let registry = REGISTRIES[core as usize].call_once(|| {
        fresh = true;
        IrqRegistry::new(controller)
    });
    if !fresh {
        panic!("core {} already has an IRQ registry", core);
    }

    registry
}

/// Returns the calling core's registry.
///
/// # Panics
///
/// `current` will panic before [`init_core`].
///
pub fn current() -> &'static IrqRegistry {
    REGISTRIES[cpu::core_id() as usize]
        .get()
        .expect("IRQ registry used before init_core")
}

impl IrqRegistry {
    /// Builds a registry over a controller. [`init_core`] is
    /// the normal way in.
    ///
    pub fn new(controller: &'static dyn IrqController) -> IrqRegistry {
        IrqRegistry {
            controller,
            vectors: Mutex::new([(); NUM_IRQS].map(|_| Vec::new())),
        }
    }

    /// Installs a handler for a logical IRQ, prepending it
    /// to the IRQ's list. The first handler for an IRQ
    /// enables it at the controller.
    ///
    /// Returns a token identifying the registration, or `None` if
    /// the IRQ number is out of range.
    ///
    pub fn add(&self, irq: usize, handler: HandlerFn, context: usize) -> Option<usize> {
        if irq >= NUM_IRQS {
            return None;
        }

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let first = {
            let _critical = cpu::critical();
            let mut vectors = self.vectors.lock();
            let list = &mut vectors[irq];
            list.insert(
                0,
                Registration {
                    token,
                    handler,
                    context,
                },
            );

            list.len() == 1
        };

        if first {
            self.controller.enable(irq);
        }

        Some(token)
    }

    /// Removes the registration with the given token. The
    /// last handler removed from an IRQ disables it at the
    /// controller.
    ///
    /// Returns whether the token was found.
    ///
    pub fn remove(&self, token: usize) -> bool {
        let mut found = false;
        let mut disable = None;
        {
            let _critical = cpu::critical();
            let mut vectors = self.vectors.lock();
            for (irq, list) in vectors.iter_mut().enumerate() {
                let before = list.len();
                list.retain(|registration| registration.token != token);
                if list.len() != before {
                    found = true;
                    if list.is_empty() {
                        disable = Some(irq);
                    }

                    break;
                }
            }
        }

        if let Some(irq) = disable {
            self.controller.disable(irq);
        }

        found
    }

    /// Returns the number of handlers installed for an IRQ.
    ///
    pub fn handler_count(&self, irq: usize) -> usize {
        self.vectors.lock()[irq].len()
    }

    /// Dispatches an IRQ: invokes its handlers in list order
    /// until one declines to continue, then acknowledges the
    /// controller unconditionally.
    ///
    pub fn dispatch(&self, irq: usize) {
        if irq < NUM_IRQS {
            // Snapshot under the lock, invoke outside it;
            // handlers may install or remove registrations.
            let handlers: Vec<(HandlerFn, usize)> = {
                let vectors = self.vectors.lock();
                vectors[irq]
                    .iter()
                    .map(|registration| (registration.handler, registration.context))
                    .collect()
            };

            for (handler, context) in handlers {
                if !handler(context, irq) {
                    break;
                }
            }
        }

        self.controller.acknowledge(irq);
    }
}

/// A window of IRQ lines claimed by one controller, in the
/// shape the platform's IOAPIC bookkeeping uses.
///
pub struct IrqRange {
    base: usize,
    count: usize,
}

impl IrqRange {
    /// Describes a controller routing `count` lines starting
    /// at `base`.
    ///
    pub fn new(base: usize, count: usize) -> IrqRange {
        IrqRange { base, count }
    }

    /// Returns whether this controller routes `irq`.
    ///
    pub fn handles_irq(&self, irq: usize) -> bool {
        self.base < irq && irq - self.base < self.count
    }

    /// Builds the 64-bit redirection entry routing `irq` to
    /// the given destination.
    ///
    pub fn redirection_entry(&self, irq: usize, dest: u32, masked: bool) -> u64 {
        let vector = (FIRST_VECTOR + irq) as u64;
        let mut entry = vector & 0xff;
        entry |= (dest as u64 & 0xff) << 56;
        if masked {
            entry |= 1 << 16;
        }

        entry
    }
}

#[cfg(test)]
mod tests {
    use super::{IrqController, IrqRange, IrqRegistry};
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeController {
        enabled: AtomicUsize,
        disabled: AtomicUsize,
        acknowledged: AtomicUsize,
    }

    impl IrqController for FakeController {
        fn enable(&self, _irq: usize) {
            self.enabled.fetch_add(1, Ordering::SeqCst);
        }

        fn disable(&self, _irq: usize) {
            self.disabled.fetch_add(1, Ordering::SeqCst);
        }

        fn acknowledge(&self, _irq: usize) {
            self.acknowledged.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake() -> &'static FakeController {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(FakeController::default()))
    }

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count_and_continue(_context: usize, _irq: usize) -> bool {
        CALLS.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn count_and_stop(_context: usize, _irq: usize) -> bool {
        CALLS.fetch_add(1, Ordering::SeqCst);
        false
    }

    #[test]
    fn first_and_last_toggle_the_controller() {
        let controller = fake();
        let registry = IrqRegistry::new(controller);

        let first = registry.add(5, count_and_continue, 0).unwrap();
        assert_eq!(controller.enabled.load(Ordering::SeqCst), 1);

        // A second handler does not re-enable.
        let second = registry.add(5, count_and_continue, 0).unwrap();
        assert_eq!(controller.enabled.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_count(5), 2);

        assert!(registry.remove(first));
        assert_eq!(controller.disabled.load(Ordering::SeqCst), 0);
        assert!(registry.remove(second));
        assert_eq!(controller.disabled.load(Ordering::SeqCst), 1);

        // Unknown tokens report failure.
        assert!(!registry.remove(0));
    }

    #[test]
    fn dispatch_stops_when_a_handler_claims() {
        let controller = fake();
        let registry = IrqRegistry::new(controller);

        // add() prepends: the stopper is installed last, so
        // it runs first and the other handler never runs.
        registry.add(3, count_and_continue, 0).unwrap();
        registry.add(3, count_and_stop, 0).unwrap();

        CALLS.store(0, Ordering::SeqCst);
        registry.dispatch(3);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        // The controller is acknowledged regardless.
        assert_eq!(controller.acknowledged.load(Ordering::SeqCst), 1);

        // Even an unhandled IRQ acknowledges.
        registry.dispatch(40);
        assert_eq!(controller.acknowledged.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn out_of_range_irqs_are_rejected() {
        let registry = IrqRegistry::new(fake());
        assert!(registry.add(super::NUM_IRQS, count_and_continue, 0).is_none());
        assert!(registry.add(5000, count_and_continue, 0).is_none());
    }

    #[test]
    fn range_bounds() {
        // The lower bound comparison is strict: the base
        // line itself is not claimed.
        let range = IrqRange::new(8, 16);
        assert!(!range.handles_irq(8));
        assert!(range.handles_irq(9));
        assert!(range.handles_irq(23));
        assert!(!range.handles_irq(24));
        assert!(!range.handles_irq(0));
    }

    #[test]
    fn redirection_entries() {
        let range = IrqRange::new(0, 24);

        // The vector field is always first_vector + irq.
        let entry = range.redirection_entry(2, 1, false);
        assert_eq!(entry & 0xff, (super::FIRST_VECTOR + 2) as u64);
        assert_eq!((entry >> 56) & 0xff, 1);
        assert_eq!(entry & (1 << 16), 0);

        let masked = range.redirection_entry(2, 0, true);
        assert_ne!(masked & (1 << 16), 0);
    }
}
