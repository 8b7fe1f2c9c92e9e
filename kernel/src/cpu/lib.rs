// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Per-core state: core identifiers, interrupt request levels, and
//! critical sections.
//!
//! Every core runs at an interrupt request level ([`Irql`]). Raising
//! the level masks all interrupt classes at or below it on that core;
//! lowering re-enables them. [`raise`] returns a guard that restores
//! the previous level when dropped, so levels strictly nest.
//!
//! [`Irql::Dispatch`] and above inhibit preemption, [`Irql::Scheduler`]
//! and above inhibit the scheduler timer, and [`Irql::Critical`]
//! masks all interrupts outright. Context switches happen at
//! [`Irql::Dispatch`].

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// The maximum number of cores the kernel supports.
///
pub const MAX_CPUS: usize = 16;

/// The identifier of the core this code is executing on.
///
/// The platform bring-up stores each core's id here during early
/// initialisation, before any other kernel facility runs on that core.
///
static CORE_ID: AtomicU32 = AtomicU32::new(0);

/// The current IRQL of each core.
///
static IRQL: [AtomicU8; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const PASSIVE: AtomicU8 = AtomicU8::new(Irql::Passive as u8);
    [PASSIVE; MAX_CPUS]
};

/// Records the identifier of the calling core.
///
/// # Panics
///
/// `set_core_id` will panic if `id` is not less than [`MAX_CPUS`].
///
pub fn set_core_id(id: u32) {
    assert!((id as usize) < MAX_CPUS, "core id {} out of range", id);
    CORE_ID.store(id, Ordering::Release);
}

/// Returns the identifier of the calling core.
///
pub fn core_id() -> u32 {
    CORE_ID.load(Ordering::Acquire)
}

/// The hierarchy of interrupt request levels.
///
/// Each level masks all interrupt classes at or below it on the
/// current core.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Irql {
    /// Normal thread execution.
    Passive = 0,
    /// Context switching; inhibits preemption.
    Dispatch = 1,
    /// Scheduler bookkeeping; inhibits the scheduler timer.
    Scheduler = 2,
    /// Device interrupt handling.
    DeviceIrq = 3,
    /// Clock tick handling.
    Clock = 4,
    /// Inter-processor interrupt handling.
    Ipi = 5,
    /// All interrupts masked.
    Critical = 6,
}

impl Irql {
    fn from_u8(num: u8) -> Irql {
        match num {
            0 => Irql::Passive,
            1 => Irql::Dispatch,
            2 => Irql::Scheduler,
            3 => Irql::DeviceIrq,
            4 => Irql::Clock,
            5 => Irql::Ipi,
            6 => Irql::Critical,
            _ => panic!("invalid IRQL {}", num),
        }
    }
}

/// Returns the current core's IRQL.
///
pub fn current_irql() -> Irql {
    Irql::from_u8(IRQL[core_id() as usize].load(Ordering::Acquire))
}

/// Raises the current core's IRQL to `level`, returning a
/// guard that restores the previous level when dropped.
///
/// # Panics
///
/// `raise` will panic if `level` is below the current IRQL;
/// levels only nest upwards.
///
pub fn raise(level: Irql) -> IrqlGuard {
    let core = core_id() as usize;
    let previous = Irql::from_u8(IRQL[core].load(Ordering::Acquire));
    if level < previous {
        panic!("cannot raise IRQL from {:?} to {:?}", previous, level);
    }

    if level == Irql::Critical && previous != Irql::Critical {
        mask_interrupts();
    }

    IRQL[core].store(level as u8, Ordering::Release);

    IrqlGuard { core, previous }
}

/// Restores the IRQL that was current when it was created.
///
pub struct IrqlGuard {
    core: usize,
    previous: Irql,
}

impl Drop for IrqlGuard {
    fn drop(&mut self) {
        let current = Irql::from_u8(IRQL[self.core].load(Ordering::Acquire));
        IRQL[self.core].store(self.previous as u8, Ordering::Release);

        if current == Irql::Critical && self.previous != Irql::Critical {
            unmask_interrupts();
        }
    }
}

/// Enters a critical section, masking all interrupts on the
/// current core until the guard is dropped.
///
pub fn critical() -> IrqlGuard {
    raise(Irql::Critical)
}

// Interrupt masking is only meaningful on the bare-metal
// target; the IRQL bookkeeping alone carries the contract
// elsewhere.

#[cfg(target_os = "none")]
fn mask_interrupts() {
    x86_64::instructions::interrupts::disable();
}

#[cfg(target_os = "none")]
fn unmask_interrupts() {
    x86_64::instructions::interrupts::enable();
}

#[cfg(not(target_os = "none"))]
fn mask_interrupts() {}

#[cfg(not(target_os = "none"))]
fn unmask_interrupts() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irql_nesting() {
        assert_eq!(current_irql(), Irql::Passive);

        {
            let _dispatch = raise(Irql::Dispatch);
            assert_eq!(current_irql(), Irql::Dispatch);

            {
                let _clock = raise(Irql::Clock);
                assert_eq!(current_irql(), Irql::Clock);

                // Raising to the same level is allowed.
                let _again = raise(Irql::Clock);
                assert_eq!(current_irql(), Irql::Clock);
            }

            assert_eq!(current_irql(), Irql::Dispatch);
        }

        assert_eq!(current_irql(), Irql::Passive);
    }

    #[test]
    fn test_irql_order() {
        assert!(Irql::Passive < Irql::Dispatch);
        assert!(Irql::Dispatch < Irql::Scheduler);
        assert!(Irql::Scheduler < Irql::DeviceIrq);
        assert!(Irql::DeviceIrq < Irql::Clock);
        assert!(Irql::Clock < Irql::Ipi);
        assert!(Irql::Ipi < Irql::Critical);
    }
}
