// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Pretty printing for byte counts in debug output, using powers of two
//! for the larger units.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

#[cfg(test)]
extern crate alloc;

use core::fmt;

/// Wraps a number of bytes for display.
///
pub struct Bytes(usize);

impl Bytes {
    /// Wraps a number of bytes.
    ///
    pub fn from_usize(n: usize) -> Self {
        Bytes(n)
    }

    /// Wraps a number of bytes.
    ///
    pub fn from_u64(n: u64) -> Self {
        Bytes(n as usize)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let units = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
        let mut n = self.0;
        for unit in units.iter() {
            // Keep dividing until the value fits its unit.
            // Amounts that aren't whole multiples print the
            // truncated value; this is debug output, not
            // accounting.
            if n >= 1024 && n % 1024 == 0 {
                n >>= 10;
                continue;
            }

            return write!(f, "{} {}", n, unit);
        }

        write!(f, "{} EiB", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_display_bytes() {
        assert_eq!(format!("{}", Bytes::from_usize(0)), "0 B");
        assert_eq!(format!("{}", Bytes::from_usize(2)), "2 B");
        assert_eq!(format!("{}", Bytes::from_usize(1023)), "1023 B");
        assert_eq!(format!("{}", Bytes::from_usize(1024)), "1 KiB");
        assert_eq!(format!("{}", Bytes::from_usize(1025)), "1025 B");
        assert_eq!(format!("{}", Bytes::from_usize(4096)), "4 KiB");
        assert_eq!(format!("{}", Bytes::from_usize(4 << 20)), "4 MiB");
        assert_eq!(format!("{}", Bytes::from_u64(3 << 30)), "3 GiB");
    }
}
