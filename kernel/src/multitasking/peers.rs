// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The scheduler peer directory.
//!
//! Every scheduler registers its core here. Each core keeps a list of
//! its peers sorted by the platform's migration cost, ready for work
//! stealing; only the structure exists today, no threads migrate.
//!
//! A peer list is invalidated whenever any scheduler comes or goes,
//! and rebuilt lazily the next time its core is idle.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use cpu::MAX_CPUS;
use spin::{Mutex, RwLock};

/// The registered cores.
///
static CORES: RwLock<Vec<u32>> = RwLock::new(Vec::new());

/// Per-core peer lists, sorted cheapest first.
///
static PEERS: [Mutex<Vec<u32>>; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Mutex<Vec<u32>> = Mutex::new(Vec::new());
    [EMPTY; MAX_CPUS]
};

/// Whether each core's peer list needs rebuilding.
///
static STALE: [AtomicBool; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const FRESH: AtomicBool = AtomicBool::new(false);
    [FRESH; MAX_CPUS]
};

/// The migration cost between two cores. The platform may
/// install a topology-aware version; the default treats core
/// distance as the cost.
///
static DISTANCE: Mutex<fn(u32, u32) -> u32> = Mutex::new(default_distance);

fn default_distance(from: u32, to: u32) -> u32 {
    if from > to {
        from - to
    } else {
        to - from
    }
}

/// Installs the platform's core distance function.
///
pub fn set_distance_fn(distance: fn(u32, u32) -> u32) {
    *DISTANCE.lock() = distance;
}

/// Registers a core's scheduler and invalidates everyone
/// else's peer list.
///
pub fn register(core: u32) {
    CORES.write().push(core);
    invalidate_others(core);
}

/// Removes a core's scheduler and invalidates everyone
/// else's peer list.
///
pub fn unregister(core: u32) {
    CORES.write().retain(|&registered| registered != core);
    invalidate_others(core);
}

fn invalidate_others(core: u32) {
    let cores = CORES.read();
    for &other in cores.iter() {
        if other != core {
            STALE[other as usize].store(true, Ordering::Release);
        }
    }
}

/// Rebuilds the core's peer list if it has been invalidated.
/// Called when the core is otherwise idle.
///
pub fn rebuild_if_stale(core: u32) {
    if STALE[core as usize].swap(false, Ordering::AcqRel) {
        rebuild(core);
    }
}

/// Rebuilds the core's peer list: every other registered
/// core, sorted by ascending migration cost.
///
pub fn rebuild(core: u32) {
    let distance = *DISTANCE.lock();
    let mut peers: Vec<u32> = CORES
        .read()
        .iter()
        .copied()
        .filter(|&other| other != core)
        .collect();

    // An insertion sort; the list is tiny and this runs only
    // on idle cores.
    for i in 1..peers.len() {
        let mut j = i;
        while j > 0 && distance(core, peers[j - 1]) > distance(core, peers[j]) {
            peers.swap(j - 1, j);
            j -= 1;
        }
    }

    *PEERS[core as usize].lock() = peers;
}

/// Returns the core's peers, cheapest first.
///
pub fn peers_of(core: u32) -> Vec<u32> {
    PEERS[core as usize].lock().clone()
}

#[cfg(test)]
mod tests {
    use super::{peers_of, rebuild, rebuild_if_stale, register, unregister, STALE};
    use core::sync::atomic::Ordering;

    // One test only: the directory is global state.
    #[test]
    fn peer_directory() {
        register(9);
        register(12);
        register(10);
        register(15);

        // Peer lists sort by ascending distance and exclude
        // the owning core.
        rebuild(12);
        assert_eq!(peers_of(12), [10, 9, 15]);
        rebuild(9);
        assert_eq!(peers_of(9), [10, 12, 15]);

        // Removing a scheduler drops it from rebuilt lists.
        unregister(10);
        rebuild(12);
        assert_eq!(peers_of(12), [9, 15]);

        // Registration marks the other cores stale, and a
        // lazy rebuild clears the mark.
        register(14);
        assert!(STALE[12].load(Ordering::Acquire));
        rebuild_if_stale(12);
        assert!(!STALE[12].load(Ordering::Acquire));
        assert!(peers_of(12).contains(&14));

        unregister(9);
        unregister(12);
        unregister(14);
        unregister(15);
    }
}
