// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel log console, backed by the first serial port.
//!
//! All kernel logging goes through the [`print`] and [`println`]
//! macros defined here, which write to COM1 under a spin lock with
//! interrupts disabled. The panic handler uses the same path, so log
//! output and panic banners interleave cleanly.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use core::fmt::Write;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts::without_interrupts;

/// The first serial port device, which carries the kernel
/// log.
///
pub static COM1: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x3f8)) };

/// Initialises the log console. Output sent before `init`
/// may be dropped by the device.
///
pub fn init() {
    without_interrupts(|| COM1.lock().init());
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    without_interrupts(|| {
        // Ignore a failed write; there is nowhere to
        // report it.
        let _ = COM1.lock().write_fmt(args);
    });
}

/// Print to the kernel log console.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Print to the kernel log console, with a trailing
/// newline.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
