// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Inter-process communication: message ports and the
//! IRQ-to-notification bridge.
//!
//! A [`Port`] is a unidirectional, buffered message endpoint owned by
//! a task. Any thread with the handle may send; the owning task
//! receives, with at most one thread blocked on receive at a time.
//! Messages arrive in send order.
//!
//! An [`IrqHandler`] connects a hardware interrupt to a thread: when
//! the IRQ fires, the handler ORs its notification bits into the
//! target thread, waking it from a notify-wait.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod irq;
mod port;

pub use crate::irq::IrqHandler;
pub use crate::port::{Message, Port, PortError};
