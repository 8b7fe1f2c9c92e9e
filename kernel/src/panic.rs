// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel panic path.
//!
//! A panic prints one banner with the failure location and message,
//! walks the frame pointer chain for a backtrace, and halts the
//! machine. The addresses are resolved against the kernel symbol
//! table by the debugger; the kernel itself prints raw return
//! addresses.

#[cfg(not(test))]
use serial::println;

/// The deepest backtrace the banner prints.
///
#[cfg(not(test))]
const MAX_FRAMES: usize = 16;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("");
    println!("KERNEL PANIC: {}", info);

    backtrace();

    // All cores halt; the panic banner is the last output.
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// Walks the frame pointer chain, printing return addresses.
///
/// Frames compiled without a frame pointer end the walk early; the
/// kernel builds with frame pointers kept.
///
#[cfg(not(test))]
fn backtrace() {
    let mut rbp: u64;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nostack, nomem, preserves_flags));
    }

    println!("backtrace:");
    for depth in 0..MAX_FRAMES {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }

        // A frame holds [saved rbp, return address].
        let frame = rbp as *const u64;
        let (next, ret) = unsafe { (frame.read(), frame.add(1).read()) };
        if ret == 0 {
            break;
        }

        println!("  #{:02} {:#018x}", depth, ret);
        rbp = next;
    }
}
