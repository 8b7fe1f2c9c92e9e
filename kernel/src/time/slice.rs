// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Time slices: the quantum a thread may spend on the CPU before it
//! is preempted, counted in platform ticks.

use crate::{tick_period, Duration};

/// The number of timer ticks a thread has left on the CPU
/// before it is preempted.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSlice(u64);

impl TimeSlice {
    /// The empty time slice.
    ///
    pub const ZERO: TimeSlice = TimeSlice(0);

    /// Returns a time slice of exactly `ticks` ticks.
    ///
    pub const fn from_ticks(ticks: u64) -> Self {
        TimeSlice(ticks)
    }

    /// Returns the smallest time slice no shorter than
    /// `duration` at the current tick period.
    ///
    pub fn from_duration(duration: Duration) -> Self {
        let period = tick_period().as_nanos();
        let nanos = duration.as_nanos() + (period - 1);

        TimeSlice(nanos / period)
    }

    /// Returns the number of ticks remaining.
    ///
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Decrements the slice by one tick, returning whether
    /// it is now exhausted.
    ///
    pub fn tick(&mut self) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 == 0
    }

    /// Returns whether the slice is exhausted.
    ///
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_slice() {
        let mut slice = TimeSlice::from_ticks(3);
        assert!(!slice.is_zero());
        assert_eq!(slice.tick(), false);
        assert_eq!(slice.tick(), false);
        assert_eq!(slice.tick(), true);

        // Ticking an exhausted slice keeps it exhausted.
        assert_eq!(slice.tick(), true);
        assert!(slice.is_zero());
    }

    #[test]
    fn test_from_duration() {
        // Durations round up to whole ticks.
        let period = tick_period();
        let slice = TimeSlice::from_duration(Duration::from_nanos(period.as_nanos() * 2 + 1));
        assert_eq!(slice.ticks(), 3);

        let slice = TimeSlice::from_duration(Duration::from_nanos(period.as_nanos() * 2));
        assert_eq!(slice.ticks(), 2);
    }
}
