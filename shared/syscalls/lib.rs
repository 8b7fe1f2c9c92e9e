// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The Kestrel syscall ABI.
//!
//! This crate defines the types shared between the kernel and user
//! space: syscall numbers, error codes, kernel object handles, the
//! virtual memory flags, and the fixed record layouts exchanged through
//! pointers (port receive buffers, map requests, region and task info).
//!
//! Everything here is plain data. The kernel side lives in the `kernel`
//! crate's `sys` module; user-space runtimes link this crate for the
//! same definitions.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

use bitflags::bitflags;

/// The set of syscalls implemented by the Kestrel kernel.
///
/// The table index of a syscall is `code & 0xffff`; the upper bits of
/// the code word carry call-specific immediates for the few calls whose
/// argument count exceeds the four marshalled registers.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Return the calling thread's handle.
    ThreadGetHandle = 0x10,
    /// Yield the remainder of the calling thread's quantum.
    ThreadYield = 0x11,
    /// Sleep the calling thread for a number of microseconds.
    ThreadUsleep = 0x12,
    /// Create a new thread in the calling task.
    ThreadCreate = 0x13,
    /// Destroy a thread.
    ThreadDestroy = 0x14,
    /// Set a thread's scheduling priority.
    ThreadSetPriority = 0x15,
    /// Set a thread's notification mask.
    ThreadSetNoteMask = 0x16,
    /// Set a thread's descriptive name.
    ThreadSetName = 0x17,
    /// Resume a paused thread.
    ThreadResume = 0x18,
    /// Wait for a thread to terminate.
    ThreadJoin = 0x19,

    /// Return the calling task's handle.
    TaskGetHandle = 0x30,
    /// Create a new task.
    TaskCreate = 0x31,
    /// Terminate a task.
    TaskTerminate = 0x32,
    /// Complete task initialisation and enter user space.
    TaskInitialize = 0x33,
    /// Set a task's descriptive name.
    TaskSetName = 0x34,
    /// Write a message to the kernel log console.
    TaskDbgOut = 0x35,

    /// Allocate a VM object backed by a fixed physical range.
    VmAllocPhys = 0x50,
    /// Allocate a VM object backed by anonymous memory.
    VmAllocAnon = 0x51,
    /// Release a VM object.
    VmDealloc = 0x52,
    /// Update a VM object's default permissions.
    VmUpdatePermissions = 0x53,
    /// Resize a VM object.
    VmResize = 0x54,
    /// Map a VM object at a fixed address. Flags ride in the
    /// upper bits of the code word.
    VmMap = 0x55,
    /// Map a VM object according to a `MapRequest`.
    VmMapEx = 0x56,
    /// Unmap a VM object from a task.
    VmUnmap = 0x57,
    /// Get info about a VM object's mapping in a task.
    VmRegionInfo = 0x58,
    /// Get info about a task's VM environment.
    VmTaskInfo = 0x59,
    /// Find the VM object mapped at an address.
    VmAddrToRegion = 0x5a,
    /// Translate a virtual address to physical.
    VmTranslate = 0x5b,
    /// Query a memory subsystem parameter.
    VmQuery = 0x5c,

    /// Allocate a message port.
    PortAlloc = 0x70,
    /// Release a message port.
    PortDealloc = 0x71,
    /// Send a message to a port.
    PortSend = 0x72,
    /// Receive a message from a port.
    PortReceive = 0x73,
    /// Update a port's parameters.
    PortSetParams = 0x74,

    /// Set notification bits on a thread.
    NotifySend = 0x80,
    /// Wait to receive notifications.
    NotifyReceive = 0x81,

    /// Install an IRQ handler notifying a thread.
    IrqInstall = 0x90,
    /// Remove an IRQ handler.
    IrqRemove = 0x91,
    /// Re-target an IRQ handler.
    IrqUpdate = 0x92,
    /// Get info about an IRQ handler.
    IrqGetInfo = 0x93,
    /// Install a core-local IRQ handler.
    IrqInstallCoreLocal = 0x94,

    /// Fill a buffer with entropy.
    GetEntropy = 0xa0,
    // Ensure new values are added to from_usize below.
}

impl Syscall {
    /// Returns the syscall with the given table index, or `None`.
    ///
    pub fn from_usize(num: usize) -> Option<Self> {
        match num {
            0x10 => Some(Self::ThreadGetHandle),
            0x11 => Some(Self::ThreadYield),
            0x12 => Some(Self::ThreadUsleep),
            0x13 => Some(Self::ThreadCreate),
            0x14 => Some(Self::ThreadDestroy),
            0x15 => Some(Self::ThreadSetPriority),
            0x16 => Some(Self::ThreadSetNoteMask),
            0x17 => Some(Self::ThreadSetName),
            0x18 => Some(Self::ThreadResume),
            0x19 => Some(Self::ThreadJoin),
            0x30 => Some(Self::TaskGetHandle),
            0x31 => Some(Self::TaskCreate),
            0x32 => Some(Self::TaskTerminate),
            0x33 => Some(Self::TaskInitialize),
            0x34 => Some(Self::TaskSetName),
            0x35 => Some(Self::TaskDbgOut),
            0x50 => Some(Self::VmAllocPhys),
            0x51 => Some(Self::VmAllocAnon),
            0x52 => Some(Self::VmDealloc),
            0x53 => Some(Self::VmUpdatePermissions),
            0x54 => Some(Self::VmResize),
            0x55 => Some(Self::VmMap),
            0x56 => Some(Self::VmMapEx),
            0x57 => Some(Self::VmUnmap),
            0x58 => Some(Self::VmRegionInfo),
            0x59 => Some(Self::VmTaskInfo),
            0x5a => Some(Self::VmAddrToRegion),
            0x5b => Some(Self::VmTranslate),
            0x5c => Some(Self::VmQuery),
            0x70 => Some(Self::PortAlloc),
            0x71 => Some(Self::PortDealloc),
            0x72 => Some(Self::PortSend),
            0x73 => Some(Self::PortReceive),
            0x74 => Some(Self::PortSetParams),
            0x80 => Some(Self::NotifySend),
            0x81 => Some(Self::NotifyReceive),
            0x90 => Some(Self::IrqInstall),
            0x91 => Some(Self::IrqRemove),
            0x92 => Some(Self::IrqUpdate),
            0x93 => Some(Self::IrqGetInfo),
            0x94 => Some(Self::IrqInstallCoreLocal),
            0xa0 => Some(Self::GetEntropy),
            _ => None,
        }
    }
}

/// The set of error codes returned by syscalls.
///
/// Syscalls return a signed word; negative values are errors from this
/// enumeration, non-negative values are call-specific results.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Unspecified error.
    GeneralError = -1,
    /// An invalid memory address or range was provided.
    InvalidPointer = -2,
    /// The provided handle was invalid.
    InvalidHandle = -3,
    /// A provided argument was invalid.
    InvalidArgument = -4,
    /// The requested syscall does not exist.
    InvalidSyscall = -5,
    /// A virtual address specified is invalid.
    InvalidAddress = -6,
    /// Referenced memory is not mapped in the given task.
    Unmapped = -7,
    /// The kernel refuses to perform the operation.
    PermissionDenied = -8,
    /// The specified timeout elapsed.
    Timeout = -9,
    /// Temporary failure; try the call again later.
    TryAgain = -10,
    /// Out of memory.
    NoMemory = -11,
    // Ensure new values are added to from_isize below.
}

impl Error {
    /// Returns the error's numerical value, as returned
    /// from a syscall.
    ///
    pub fn as_isize(self) -> isize {
        self as isize
    }

    /// Returns the error with the given numerical value,
    /// or `None`.
    ///
    pub fn from_isize(num: isize) -> Option<Self> {
        match num {
            -1 => Some(Self::GeneralError),
            -2 => Some(Self::InvalidPointer),
            -3 => Some(Self::InvalidHandle),
            -4 => Some(Self::InvalidArgument),
            -5 => Some(Self::InvalidSyscall),
            -6 => Some(Self::InvalidAddress),
            -7 => Some(Self::Unmapped),
            -8 => Some(Self::PermissionDenied),
            -9 => Some(Self::Timeout),
            -10 => Some(Self::TryAgain),
            -11 => Some(Self::NoMemory),
            _ => None,
        }
    }
}

/// The syscall argument block, marshalled from registers
/// by the architecture entry stub.
///
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct SyscallArgs {
    /// Up to four register arguments.
    pub args: [usize; 4],
}

/// The kinds of kernel object a handle can refer to.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleType {
    Task = 1,
    Thread = 2,
    Port = 3,
    VmObject = 4,
    IrqHandler = 5,
}

impl HandleType {
    fn from_u64(num: u64) -> Option<Self> {
        match num {
            1 => Some(Self::Task),
            2 => Some(Self::Thread),
            3 => Some(Self::Port),
            4 => Some(Self::VmObject),
            5 => Some(Self::IrqHandler),
            _ => None,
        }
    }
}

/// An opaque identifier for a kernel object.
///
/// A handle packs the object type, a generation counter and a table
/// slot into one word: `{type: 8, generation: 24, slot: 32}`. The zero
/// value is never a valid handle. The generation is bumped every time a
/// slot is released, so a stale handle fails to resolve rather than
/// aliasing the slot's next occupant.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The invalid handle.
    ///
    pub const INVALID: Handle = Handle(0);

    /// Packs a handle from its parts.
    ///
    /// # Panics
    ///
    /// `new` will panic if `generation` exceeds 24 bits or `slot`
    /// exceeds 32 bits.
    ///
    pub fn new(kind: HandleType, generation: u32, slot: u32) -> Self {
        assert!(generation < (1 << 24), "handle generation overflow");
        Handle(((kind as u64) << 56) | ((generation as u64) << 32) | slot as u64)
    }

    /// Reconstructs a handle from its raw value, as passed
    /// across the syscall boundary.
    ///
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Returns the handle's raw value.
    ///
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns whether the handle is structurally valid; a
    /// valid handle may still fail to resolve.
    ///
    pub fn is_valid(self) -> bool {
        self.0 != 0 && self.kind().is_some()
    }

    /// Returns the type of object the handle refers to.
    ///
    pub fn kind(self) -> Option<HandleType> {
        HandleType::from_u64(self.0 >> 56)
    }

    /// Returns the handle's generation.
    ///
    pub fn generation(self) -> u32 {
        ((self.0 >> 32) & 0xff_ffff) as u32
    }

    /// Returns the handle's table slot.
    ///
    pub fn slot(self) -> u32 {
        self.0 as u32
    }
}

bitflags! {
    /// Flags describing a virtual memory object or mapping.
    ///
    pub struct VmFlags: usize {
        /// Allocate backing immediately rather than on first fault.
        const NO_LAZY_ALLOC = 1 << 0;
        /// Prefer large pages for the mapping. Accepted and
        /// currently ignored.
        const LARGE_PAGES = 1 << 1;
        /// The memory is readable.
        const READ = 1 << 10;
        /// The memory is writable.
        const WRITE = 1 << 11;
        /// The memory is executable.
        const EXEC = 1 << 12;
        /// The memory is device memory and must not be cached.
        const MMIO = 1 << 13;
        /// The memory uses write-through caching.
        const WRITE_THROUGH = 1 << 14;
    }
}

impl VmFlags {
    /// The flag bits that name access permissions.
    ///
    pub const PERMISSION_MASK: VmFlags = VmFlags::from_bits_truncate(
        VmFlags::READ.bits | VmFlags::WRITE.bits | VmFlags::EXEC.bits | VmFlags::MMIO.bits,
    );
}

/// Keys accepted by the VM query syscall.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmQueryKey {
    /// The platform page size, in bytes.
    PageSize = 0,
}

impl VmQueryKey {
    /// Returns the key with the given numerical value, or `None`.
    ///
    pub fn from_usize(num: usize) -> Option<Self> {
        match num {
            0 => Some(Self::PageSize),
            _ => None,
        }
    }
}

/// Keys accepted by the IRQ handler get-info syscall.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqInfoKey {
    /// The logical interrupt number the handler is attached to.
    InterruptNumber = 1,
    /// The CPU vector number the interrupt is routed through.
    VectorNumber = 2,
}

impl IrqInfoKey {
    /// Returns the key with the given numerical value, or `None`.
    ///
    pub fn from_usize(num: usize) -> Option<Self> {
        match num {
            1 => Some(Self::InterruptNumber),
            2 => Some(Self::VectorNumber),
            _ => None,
        }
    }
}

/// A timeout argument that never blocks.
///
pub const TIMEOUT_POLL: usize = 0;

/// A timeout argument that blocks forever.
///
pub const TIMEOUT_FOREVER: usize = usize::MAX;

/// The largest message a port will accept, in bytes.
///
pub const MAX_MESSAGE_LEN: usize = 4096 * 9;

/// The header of a port receive buffer.
///
/// The caller passes a buffer of at least `size_of::<RecvInfo>()`
/// bytes, 16-byte aligned, whose payload space (everything after the
/// header) is a multiple of 16 bytes. The kernel fills in the header
/// and copies the message payload after it.
///
#[derive(Clone, Copy, Debug)]
#[repr(C, align(16))]
pub struct RecvInfo {
    /// Thread handle of the sender.
    pub thread: Handle,
    /// Task handle containing the sending thread.
    pub task: Handle,
    /// Flags; currently always zero.
    pub flags: u16,
    /// Length of the message payload, in bytes.
    pub message_length: u16,
    _reserved: [u8; 12],
    // The payload follows the header, 16-byte aligned.
}

impl RecvInfo {
    /// Returns an empty receive header.
    ///
    pub fn empty() -> Self {
        RecvInfo {
            thread: Handle::INVALID,
            task: Handle::INVALID,
            flags: 0,
            message_length: 0,
            _reserved: [0u8; 12],
        }
    }
}

/// A request to map a VM object into an address space.
///
/// A zero `end` requests a fixed mapping at `start`; otherwise the
/// kernel searches `[start, end)` for a hole of `length` bytes.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct MapRequest {
    /// Fixed base, or the low bound of the search range.
    pub start: usize,
    /// Zero, or the high bound of the search range.
    pub end: usize,
    /// Length of the mapping, in bytes.
    pub length: usize,
    /// Flags overriding the object's defaults for this mapping.
    pub flags: usize,
}

/// Information about a VM object's mapping in a task.
///
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct RegionInfo {
    /// Virtual base address of the mapping.
    pub base: usize,
    /// Length of the object, in bytes.
    pub length: usize,
    /// The object's current flags.
    pub flags: usize,
}

/// Information about a task's virtual memory environment.
///
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct TaskVmInfo {
    /// Number of physical pages owned by the task.
    pub pages_owned: usize,
    /// Number of VM objects owned by the task.
    pub regions_owned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn check_numerical_conversion() {
        // Every syscall must round-trip through its numerical
        // value.
        let calls = [
            Syscall::ThreadGetHandle,
            Syscall::ThreadYield,
            Syscall::ThreadUsleep,
            Syscall::ThreadCreate,
            Syscall::ThreadDestroy,
            Syscall::ThreadSetPriority,
            Syscall::ThreadSetNoteMask,
            Syscall::ThreadSetName,
            Syscall::ThreadResume,
            Syscall::ThreadJoin,
            Syscall::TaskGetHandle,
            Syscall::TaskCreate,
            Syscall::TaskTerminate,
            Syscall::TaskInitialize,
            Syscall::TaskSetName,
            Syscall::TaskDbgOut,
            Syscall::VmAllocPhys,
            Syscall::VmAllocAnon,
            Syscall::VmDealloc,
            Syscall::VmUpdatePermissions,
            Syscall::VmResize,
            Syscall::VmMap,
            Syscall::VmMapEx,
            Syscall::VmUnmap,
            Syscall::VmRegionInfo,
            Syscall::VmTaskInfo,
            Syscall::VmAddrToRegion,
            Syscall::VmTranslate,
            Syscall::VmQuery,
            Syscall::PortAlloc,
            Syscall::PortDealloc,
            Syscall::PortSend,
            Syscall::PortReceive,
            Syscall::PortSetParams,
            Syscall::NotifySend,
            Syscall::NotifyReceive,
            Syscall::IrqInstall,
            Syscall::IrqRemove,
            Syscall::IrqUpdate,
            Syscall::IrqGetInfo,
            Syscall::IrqInstallCoreLocal,
            Syscall::GetEntropy,
        ];

        for call in calls.iter() {
            assert_eq!(Syscall::from_usize(*call as usize), Some(*call));
        }

        assert_eq!(Syscall::from_usize(0), None);
        assert_eq!(Syscall::from_usize(0xffff), None);
    }

    #[test]
    fn check_error_conversion() {
        for raw in -11..0 {
            let err = Error::from_isize(raw).unwrap();
            assert_eq!(err.as_isize(), raw);
        }

        assert_eq!(Error::from_isize(0), None);
        assert_eq!(Error::from_isize(-12), None);
        assert_eq!(Error::from_isize(1), None);
    }

    #[test]
    fn handle_packing() {
        let handle = Handle::new(HandleType::Port, 0x123456, 0xdead_beef);
        assert!(handle.is_valid());
        assert_eq!(handle.kind(), Some(HandleType::Port));
        assert_eq!(handle.generation(), 0x123456);
        assert_eq!(handle.slot(), 0xdead_beef);
        assert_eq!(Handle::from_raw(handle.as_raw()), handle);

        assert!(!Handle::INVALID.is_valid());
        assert_eq!(Handle::INVALID.kind(), None);

        // A raw value with a nonsense type tag is invalid.
        assert!(!Handle::from_raw(0xff00_0000_0000_0001).is_valid());
    }

    #[test]
    fn recv_info_layout() {
        // The payload that follows the header must land on a
        // 16-byte boundary.
        assert_eq!(mem::size_of::<RecvInfo>() % 16, 0);
        assert_eq!(mem::align_of::<RecvInfo>(), 16);
    }

    #[test]
    fn vm_flags() {
        let flags = VmFlags::READ | VmFlags::WRITE;
        assert!(VmFlags::PERMISSION_MASK.contains(flags));
        assert!(!flags.contains(VmFlags::MMIO));
        assert_eq!(VmFlags::READ.bits(), 1 << 10);
        assert_eq!(VmFlags::WRITE.bits(), 1 << 11);
        assert_eq!(VmFlags::EXEC.bits(), 1 << 12);
        assert_eq!(VmFlags::MMIO.bits(), 1 << 13);
        assert_eq!(VmFlags::WRITE_THROUGH.bits(), 1 << 14);
    }
}
