// Copyright 2022 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Message ports.
//!
//! A port buffers messages in arrival order, up to an optional queue
//! depth. Sending copies the payload into the kernel heap and stamps
//! it with the sending thread and task; receiving hands the oldest
//! message out. A receiver that finds the queue empty blocks on the
//! port's receive blocker, which is signalled when the next message
//! is queued.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use multitasking::blockable::{Blockable, Waiter};
use multitasking::cpu_local;
use multitasking::task::OwnedPort;
use multitasking::thread::{BlockResult, Thread};
use spin::{Mutex, RwLock};
use syscalls::{Handle, MAX_MESSAGE_LEN};
use time::Instant;

/// The ways a port operation can fail.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortError {
    /// The message exceeds [`MAX_MESSAGE_LEN`].
    TooLarge,
    /// The queue has reached its configured depth.
    QueueFull,
    /// No message arrived within the timeout.
    Timeout,
    /// Another thread is already blocked on receive.
    AlreadyReceiving,
    /// The wait failed internally.
    Error,
}

/// One queued message.
///
pub struct Message {
    /// When the message was sent.
    pub timestamp: Instant,
    /// The sending thread.
    pub sender_thread: Handle,
    /// The task containing the sending thread.
    pub sender_task: Handle,
    /// The payload.
    pub content: Vec<u8>,
}

struct PortInner {
    /// Maximum queued messages; zero means unlimited.
    max_messages: usize,
    messages: alloc::collections::VecDeque<Message>,
}

/// A unidirectional, buffered message endpoint.
///
pub struct Port {
    us: Weak<Port>,
    handle: AtomicU64,
    inner: RwLock<PortInner>,
    /// The receive blocker, present while a receiver waits.
    blocker: Mutex<Option<Arc<ReceiveBlocker>>>,
}

impl Port {
    /// Allocates a new port with an unlimited queue.
    ///
    pub fn alloc() -> Arc<Port> {
        Arc::new_cyclic(|us| Port {
            us: us.clone(),
            handle: AtomicU64::new(Handle::INVALID.as_raw()),
            inner: RwLock::new(PortInner {
                max_messages: 0,
                messages: alloc::collections::VecDeque::new(),
            }),
            blocker: Mutex::new(None),
        })
    }

    /// Returns the port's handle.
    ///
    pub fn port_handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Acquire))
    }

    /// Records the port's handle.
    ///
    pub fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.as_raw(), Ordering::Release);
    }

    /// Sets the maximum number of queued messages; zero
    /// removes the limit.
    ///
    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.write().max_messages = depth;
    }

    /// Returns whether messages are waiting.
    ///
    pub fn messages_pending(&self) -> bool {
        !self.inner.read().messages.is_empty()
    }

    /// Returns the number of queued messages.
    ///
    pub fn pending_count(&self) -> usize {
        self.inner.read().messages.len()
    }

    /// Queues a message on the port, stamped with the
    /// calling thread.
    ///
    pub fn send(&self, payload: &[u8]) -> Result<(), PortError> {
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(PortError::TooLarge);
        }

        let (sender_thread, sender_task) = sender_stamp();

        {
            let mut inner = self.inner.write();
            if inner.max_messages != 0 && inner.messages.len() >= inner.max_messages {
                return Err(PortError::QueueFull);
            }

            inner.messages.push_back(Message {
                timestamp: time::now(),
                sender_thread,
                sender_task,
                content: payload.to_vec(),
            });
        }

        // Wake a waiting receiver.
        let blocker = self.blocker.lock().clone();
        if let Some(blocker) = blocker {
            blocker.message_queued();
        }

        Ok(())
    }

    /// Takes the oldest message without blocking.
    ///
    pub fn try_receive(&self) -> Option<Message> {
        self.inner.write().messages.pop_front()
    }

    /// Receives a message, blocking the calling thread until
    /// one arrives or `until` passes. A `None` deadline
    /// waits forever.
    ///
    /// Only one thread may be blocked on receive at a time.
    ///
    pub fn receive(&self, until: Option<Instant>) -> Result<Message, PortError> {
        loop {
            if let Some(message) = self.try_receive() {
                return Ok(message);
            }

            // Install ourselves as the receiver.
            let blocker = {
                let mut slot = self.blocker.lock();
                if slot.is_some() {
                    return Err(PortError::AlreadyReceiving);
                }

                let blocker = ReceiveBlocker::new(&self.us);
                *slot = Some(blocker.clone());
                blocker
            };

            let result = Thread::current().block_on(blocker, until);
            *self.blocker.lock() = None;

            match result {
                // Signalled, or the message beat us to the
                // queue; either way, go take it.
                BlockResult::Unblocked | BlockResult::Aborted => continue,
                BlockResult::Timeout => return Err(PortError::Timeout),
                BlockResult::Error => return Err(PortError::Error),
            }
        }
    }
}

impl OwnedPort for Port {
    fn handle(&self) -> Handle {
        self.port_handle()
    }
}

/// Stamps a message with the sending thread and task.
///
fn sender_stamp() -> (Handle, Handle) {
    match cpu_local::try_current_thread() {
        Some(thread) => {
            let task = thread
                .task()
                .map(|task| task.handle())
                .unwrap_or(Handle::INVALID);
            (thread.handle(), task)
        }
        None => (Handle::INVALID, Handle::INVALID),
    }
}

/// The port's receive blocker: signalled whenever the
/// message queue is non-empty.
///
struct ReceiveBlocker {
    port: Weak<Port>,
    waiter: Waiter,
    /// Set by the first message to arrive while a receiver
    /// is blocked.
    signalled: AtomicBool,
    /// Set by a message that arrived before the receiver
    /// committed to blocking.
    early_signalled: AtomicBool,
}

impl ReceiveBlocker {
    fn new(port: &Weak<Port>) -> Arc<ReceiveBlocker> {
        Arc::new(ReceiveBlocker {
            port: port.clone(),
            waiter: Waiter::new(),
            signalled: AtomicBool::new(false),
            early_signalled: AtomicBool::new(false),
        })
    }

    /// Called by senders after queueing a message.
    ///
    fn message_queued(&self) {
        if !self.waiter.is_armed() {
            self.early_signalled.store(true, Ordering::Release);
            return;
        }

        if self
            .signalled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.waiter.wake();
        }
    }
}

impl Blockable for ReceiveBlocker {
    fn is_signalled(&self) -> bool {
        match self.port.upgrade() {
            Some(port) => port.messages_pending(),
            None => false,
        }
    }

    fn reset(&self) {
        self.early_signalled.store(false, Ordering::Release);
        self.signalled.store(false, Ordering::Release);
    }

    fn will_block_on(&self, thread: &Arc<Thread>) -> Result<(), ()> {
        self.waiter.arm(thread);

        // A message that slipped in already means there is
        // no point blocking.
        if self.signalled.load(Ordering::Acquire) || self.early_signalled.load(Ordering::Acquire)
        {
            self.waiter.disarm();
            return Err(());
        }

        Ok(())
    }

    fn did_unblock(&self) {
        self.waiter.disarm();
    }

    fn has_blocker(&self) -> bool {
        self.waiter.is_armed()
    }
}

#[cfg(test)]
mod tests {
    use super::{Port, PortError};
    use syscalls::MAX_MESSAGE_LEN;

    #[test]
    fn messages_arrive_in_order() {
        let port = Port::alloc();
        assert!(!port.messages_pending());

        port.send(b"first").unwrap();
        port.send(b"second").unwrap();
        port.send(b"third").unwrap();
        assert_eq!(port.pending_count(), 3);

        // Strict FIFO.
        assert_eq!(port.try_receive().unwrap().content, b"first");
        assert_eq!(port.try_receive().unwrap().content, b"second");
        assert_eq!(port.try_receive().unwrap().content, b"third");
        assert!(port.try_receive().is_none());
    }

    #[test]
    fn queue_depth_limits_senders() {
        let port = Port::alloc();
        port.set_queue_depth(2);

        port.send(b"a").unwrap();
        port.send(b"b").unwrap();
        assert_eq!(port.send(b"c"), Err(PortError::QueueFull));

        // Draining one slot unblocks sending.
        port.try_receive().unwrap();
        port.send(b"c").unwrap();
        assert_eq!(port.pending_count(), 2);
    }

    #[test]
    fn oversized_messages_are_refused() {
        let port = Port::alloc();
        let payload = alloc::vec![0u8; MAX_MESSAGE_LEN + 1];
        assert_eq!(port.send(&payload), Err(PortError::TooLarge));

        let payload = alloc::vec![0u8; MAX_MESSAGE_LEN];
        port.send(&payload).unwrap();
        assert_eq!(port.try_receive().unwrap().content.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn message_stamps() {
        // Without a current thread the stamp is the invalid
        // handle; the payload is still intact.
        let port = Port::alloc();
        port.send(b"PING").unwrap();

        let message = port.try_receive().unwrap();
        assert_eq!(message.content, b"PING");
        assert_eq!(message.content.len(), 4);
        assert!(!message.sender_thread.is_valid());
    }
}
