// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The context switch.
//!
//! A thread's suspended execution state lives in its
//! [`RegisterState`]: the callee-saved registers, stack pointer,
//! resume address and flags of the x86_64 System V ABI. Switching
//! threads stores the current core state into the outgoing thread's
//! record and loads the incoming thread's record, jumping to its
//! resume address.
//!
//! New threads resume at one of the start trampolines: kernel threads
//! at [`kernel_thread_start`], which enables interrupts and calls the
//! entry function; user threads at [`user_thread_start`], which drops
//! to ring 3 through `iretq` at the entry point recorded on the
//! thread.

use core::cell::UnsafeCell;
use x86_64::VirtAddr;

/// The saved execution state of a suspended thread.
///
/// The layout is known to the assembly below; keep the two in sync.
///
#[derive(Debug, Default)]
#[repr(C)]
pub struct RegisterState {
    rsp: u64,    // 0x00
    rip: u64,    // 0x08
    rbx: u64,    // 0x10
    rbp: u64,    // 0x18
    r12: u64,    // 0x20
    r13: u64,    // 0x28
    r14: u64,    // 0x30
    r15: u64,    // 0x38
    rflags: u64, // 0x40
    rdi: u64,    // 0x48
    rsi: u64,    // 0x50
}

/// Bit 1 of RFLAGS is reserved and always set; interrupts
/// start disabled and are enabled by the start trampolines.
///
const INITIAL_RFLAGS: u64 = 0x2;

impl RegisterState {
    /// Returns an empty record, filled in by the first
    /// switch away from the thread.
    ///
    pub fn zeroed() -> RegisterState {
        RegisterState::default()
    }

    /// Builds the initial state of a kernel thread: resume
    /// in [`kernel_thread_start`] on a fresh stack, with the
    /// entry function and its argument in the first two
    /// argument registers.
    ///
    pub fn kernel(entry: fn(usize) -> !, arg: usize, stack_top: VirtAddr) -> RegisterState {
        RegisterState {
            // Leave the stack as if a call had just
            // happened, so compiled code sees the alignment
            // it expects.
            rsp: (stack_top.as_u64() & !0xf) - 8,
            rip: kernel_thread_start as usize as u64,
            rflags: INITIAL_RFLAGS,
            rdi: entry as usize as u64,
            rsi: arg as u64,
            ..RegisterState::default()
        }
    }

    /// Builds the initial state of a user thread: resume in
    /// [`user_thread_start`] on the thread's kernel stack.
    /// The user-mode entry point is taken from the thread
    /// record when the trampoline runs.
    ///
    pub fn user(stack_top: VirtAddr) -> RegisterState {
        RegisterState {
            rsp: (stack_top.as_u64() & !0xf) - 8,
            rip: user_thread_start as usize as u64,
            rflags: INITIAL_RFLAGS,
            ..RegisterState::default()
        }
    }
}

/// Owns a thread's register state.
///
/// The state is only ever touched by the owning thread itself or by
/// the scheduler while the thread is switched out, which cannot
/// overlap, so the cell is sound in practice.
///
#[derive(Debug, Default)]
pub struct SavedState(UnsafeCell<RegisterState>);

unsafe impl Sync for SavedState {}

impl SavedState {
    /// Wraps an initial register state.
    ///
    pub fn new(state: RegisterState) -> SavedState {
        SavedState(UnsafeCell::new(state))
    }

    /// Returns the raw pointer handed to the switch code.
    ///
    pub fn as_ptr(&self) -> *mut RegisterState {
        self.0.get()
    }
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".global __kestrel_switch_context",
    "__kestrel_switch_context:",
    // Store the outgoing state. The resume address is the
    // local label at the end, so a switched-out thread
    // continues by returning to its caller.
    "mov [rdi + 0x00], rsp",
    "lea rax, [rip + 2f]",
    "mov [rdi + 0x08], rax",
    "mov [rdi + 0x10], rbx",
    "mov [rdi + 0x18], rbp",
    "mov [rdi + 0x20], r12",
    "mov [rdi + 0x28], r13",
    "mov [rdi + 0x30], r14",
    "mov [rdi + 0x38], r15",
    "pushfq",
    "pop qword ptr [rdi + 0x40]",
    // Load the incoming state and jump to its resume
    // address.
    "mov rax, rsi",
    "mov rsp, [rax + 0x00]",
    "mov rbx, [rax + 0x10]",
    "mov rbp, [rax + 0x18]",
    "mov r12, [rax + 0x20]",
    "mov r13, [rax + 0x28]",
    "mov r14, [rax + 0x30]",
    "mov r15, [rax + 0x38]",
    "push qword ptr [rax + 0x40]",
    "popfq",
    "mov rdi, [rax + 0x48]",
    "mov rsi, [rax + 0x50]",
    "jmp qword ptr [rax + 0x08]",
    "2:",
    "ret",
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn __kestrel_switch_context(from: *mut RegisterState, to: *const RegisterState);
}

/// Switches execution from the state at `from` to the state
/// at `to`. Returns when something switches back to `from`.
///
/// # Safety
///
/// `to` must hold a valid suspended state whose stack is live, and
/// nothing else may run on either state concurrently. Interrupts must
/// be masked across the call.
///
pub unsafe fn switch_context(from: *mut RegisterState, to: *const RegisterState) {
    #[cfg(target_arch = "x86_64")]
    __kestrel_switch_context(from, to);

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (from, to);
        unreachable!("context switch is only implemented for x86_64");
    }
}

/// First code of every kernel thread: enables interrupts and
/// calls the entry function. The entry function must not
/// return; threads end themselves through the thread exit
/// path.
///
extern "C" fn kernel_thread_start(entry: usize, arg: usize) -> ! {
    x86_64::instructions::interrupts::enable();

    let entry: fn(usize) -> ! = unsafe { core::mem::transmute(entry) };
    entry(arg)
}

/// First code of every user thread: reads the user entry
/// state off the current thread and drops to ring 3.
///
extern "C" fn user_thread_start() -> ! {
    let thread = crate::cpu_local::current_thread();
    let (pc, sp, arg) = thread.user_entry();
    drop(thread);

    unsafe { return_to_user(pc, sp, arg) }
}

/// The GDT selectors for ring 3, as laid out by the platform
/// bring-up.
///
const USER_CODE_SELECTOR: u64 = 0x1b;
const USER_STACK_SELECTOR: u64 = 0x23;

/// RFLAGS for entering user mode: reserved bit plus
/// interrupts enabled.
///
const USER_RFLAGS: u64 = 0x202;

/// Enters user mode at `pc` with the given stack, passing
/// `arg` in the first argument register.
///
/// # Safety
///
/// `pc` and `sp` must point into mapped, user-accessible memory in
/// the active address space.
///
pub unsafe fn return_to_user(pc: VirtAddr, sp: VirtAddr, arg: usize) -> ! {
    #[cfg(target_arch = "x86_64")]
    {
        core::arch::asm!(
            "push {ss}",
            "push {sp}",
            "push {rflags}",
            "push {cs}",
            "push {pc}",
            "iretq",
            ss = in(reg) USER_STACK_SELECTOR,
            sp = in(reg) sp.as_u64(),
            rflags = in(reg) USER_RFLAGS,
            cs = in(reg) USER_CODE_SELECTOR,
            pc = in(reg) pc.as_u64(),
            in("rdi") arg as u64,
            options(noreturn),
        );
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (pc, sp, arg);
        unreachable!("user mode entry is only implemented for x86_64");
    }
}
