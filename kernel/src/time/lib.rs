// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Kernel time: the monotonic clock, time slices, and deadlines.
//!
//! The platform timer interrupt calls [`tick`] at a fixed period,
//! which advances the monotonic clock read by [`now`]. Threads'
//! scheduling quanta are counted in ticks through [`TimeSlice`].
//!
//! A [`Deadline`] is an action bound to an absolute time. The
//! scheduler keeps deadlines in a [`DeadlineQueue`], a priority queue
//! ordered soonest-first; on every tick it pops the deadlines that
//! have come due and invokes them. Deadline callbacks run in the timer
//! context and must confine themselves to small amounts of work, such
//! as moving a thread back onto a run queue.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod slice;

pub use crate::slice::TimeSlice;

use alloc::collections::binary_heap::BinaryHeap;
use alloc::sync::Arc;
use core::cmp::Ordering;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};
use core::sync::atomic::{AtomicU64, Ordering as MemOrdering};

/// Nanoseconds since boot, advanced by the platform tick.
///
static BOOT_TIME_NANOS: AtomicU64 = AtomicU64::new(0);

/// The period of the platform tick, in nanoseconds.
///
static TICK_PERIOD_NANOS: AtomicU64 = AtomicU64::new(DEFAULT_TICK_PERIOD.as_nanos());

/// The default platform tick period (1 ms).
///
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(1);

/// A span of time, in nanoseconds.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u64);

impl Duration {
    /// The zero duration.
    ///
    pub const ZERO: Duration = Duration(0);

    /// Returns a duration of `nanos` nanoseconds.
    ///
    pub const fn from_nanos(nanos: u64) -> Self {
        Duration(nanos)
    }

    /// Returns a duration of `micros` microseconds.
    ///
    pub const fn from_micros(micros: u64) -> Self {
        Duration(micros * 1_000)
    }

    /// Returns a duration of `millis` milliseconds.
    ///
    pub const fn from_millis(millis: u64) -> Self {
        Duration(millis * 1_000_000)
    }

    /// Returns a duration of `secs` seconds.
    ///
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1_000_000_000)
    }

    /// Returns the duration in nanoseconds.
    ///
    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

/// A point on the monotonic clock.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    /// Returns the instant `nanos` nanoseconds after boot.
    ///
    pub const fn from_nanos(nanos: u64) -> Self {
        Instant(nanos)
    }

    /// Returns the instant in nanoseconds since boot.
    ///
    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, other: Duration) -> Instant {
        Instant(self.0.saturating_add(other.0))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, other: Duration) {
        self.0 = self.0.saturating_add(other.0);
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, other: Instant) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Returns the current time on the monotonic clock.
///
pub fn now() -> Instant {
    Instant(BOOT_TIME_NANOS.load(MemOrdering::Acquire))
}

/// Sets the period of the platform tick. Called once by the
/// platform timer bring-up before ticking starts.
///
pub fn set_tick_period(period: Duration) {
    TICK_PERIOD_NANOS.store(period.as_nanos(), MemOrdering::Release);
}

/// Returns the period of the platform tick.
///
pub fn tick_period() -> Duration {
    Duration(TICK_PERIOD_NANOS.load(MemOrdering::Acquire))
}

/// Advances the monotonic clock by one tick period. Called
/// from the platform timer interrupt.
///
pub fn tick() {
    let period = TICK_PERIOD_NANOS.load(MemOrdering::Acquire);
    BOOT_TIME_NANOS.fetch_add(period, MemOrdering::AcqRel);
}

/// An action bound to an absolute time.
///
/// The queue invokes [`expired`](Deadline::expired) from the timer
/// context once [`when`](Deadline::when) is no longer in the future.
///
pub trait Deadline: Send + Sync {
    /// The absolute time at which the deadline comes due.
    fn when(&self) -> Instant;

    /// Invoked when the deadline comes due.
    fn expired(&self);
}

struct QueueEntry(Arc<dyn Deadline>);

impl PartialEq for QueueEntry {
    fn eq(&self, other: &QueueEntry) -> bool {
        self.0.when() == other.0.when()
    }
}

impl Eq for QueueEntry {}

// Entries order in reverse, so the binary heap's maximum is
// the soonest deadline.
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &QueueEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &QueueEntry) -> Ordering {
        other.0.when().cmp(&self.0.when())
    }
}

/// A priority queue of deadlines, ordered soonest-first.
///
pub struct DeadlineQueue {
    pending: BinaryHeap<QueueEntry>,
}

impl DeadlineQueue {
    /// Returns a new, empty queue.
    ///
    pub fn new() -> Self {
        DeadlineQueue {
            pending: BinaryHeap::new(),
        }
    }

    /// Returns the number of pending deadlines.
    ///
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns whether the queue is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Adds a deadline to the queue.
    ///
    pub fn insert(&mut self, deadline: Arc<dyn Deadline>) {
        self.pending.push(QueueEntry(deadline));
    }

    /// Removes a deadline from the queue, if present.
    ///
    /// Identity is by allocation, not by expiry time, so removing one
    /// of two deadlines with the same expiry removes the right one.
    ///
    pub fn remove(&mut self, deadline: &Arc<dyn Deadline>) {
        self.pending = self
            .pending
            .drain()
            .filter(|entry| !Arc::ptr_eq(&entry.0, deadline))
            .collect();
    }

    /// Removes and returns the soonest deadline if it is due
    /// at or before `now`.
    ///
    /// The caller loops until `pop_due` returns `None`, invoking each
    /// deadline in turn, so deadlines fire in time order.
    ///
    pub fn pop_due(&mut self, now: Instant) -> Option<Arc<dyn Deadline>> {
        let next = self.pending.peek()?;
        if next.0.when() > now {
            return None;
        }

        self.pending.pop().map(|entry| entry.0)
    }
}

impl Default for DeadlineQueue {
    fn default() -> Self {
        DeadlineQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct TestDeadline {
        when: Instant,
        fired: AtomicUsize,
    }

    impl TestDeadline {
        fn new(nanos: u64) -> Arc<TestDeadline> {
            Arc::new(TestDeadline {
                when: Instant::from_nanos(nanos),
                fired: AtomicUsize::new(0),
            })
        }
    }

    impl Deadline for TestDeadline {
        fn when(&self) -> Instant {
            self.when
        }

        fn expired(&self) {
            self.fired.fetch_add(1, MemOrdering::SeqCst);
        }
    }

    #[test]
    fn test_durations() {
        assert_eq!(Duration::from_micros(3).as_nanos(), 3_000);
        assert_eq!(Duration::from_millis(3).as_nanos(), 3_000_000);
        assert_eq!(Duration::from_secs(3).as_nanos(), 3_000_000_000);

        let base = Instant::from_nanos(100);
        assert_eq!((base + Duration::from_nanos(20)).as_nanos(), 120);
        assert_eq!(Instant::from_nanos(120) - base, Duration::from_nanos(20));
    }

    #[test]
    fn test_deadline_ordering() {
        let mut queue = DeadlineQueue::new();
        let first = TestDeadline::new(100);
        let second = TestDeadline::new(200);
        let third = TestDeadline::new(300);

        // Insert out of order.
        queue.insert(third.clone());
        queue.insert(first.clone());
        queue.insert(second.clone());
        assert_eq!(queue.len(), 3);

        // Nothing is due yet.
        assert!(queue.pop_due(Instant::from_nanos(99)).is_none());

        // The first two come due in time order.
        let now = Instant::from_nanos(250);
        let popped = queue.pop_due(now).unwrap();
        assert_eq!(popped.when(), first.when);
        let popped = queue.pop_due(now).unwrap();
        assert_eq!(popped.when(), second.when);
        assert!(queue.pop_due(now).is_none());
        assert_eq!(queue.len(), 1);

        // The last comes due exactly at its expiry.
        let popped = queue.pop_due(Instant::from_nanos(300)).unwrap();
        assert_eq!(popped.when(), third.when);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_deadline_removal() {
        let mut queue = DeadlineQueue::new();
        let one = TestDeadline::new(500);
        let two = TestDeadline::new(500);

        queue.insert(one.clone());
        queue.insert(two.clone());

        // Removal is by identity, even with equal expiry
        // times.
        let target: Arc<dyn Deadline> = one.clone();
        queue.remove(&target);
        assert_eq!(queue.len(), 1);

        let rest = queue.pop_due(Instant::from_nanos(500)).unwrap();
        assert!(Arc::ptr_eq(&rest, &(two as Arc<dyn Deadline>)));
    }
}
