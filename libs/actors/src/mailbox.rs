//! Per-actor message queue
//!
//! Multi-producer, single-consumer FIFO with three reader states:
//!
//! ```text
//!            try_block (queue empty)
//!   Open  ─────────────────────────────▶  Blocked
//!    ▲                                       │
//!    └──────── enqueue → UnblockedReader ────┘
//!
//!   close(): any state ──▶ Closed (enqueue → QueueClosed)
//! ```
//!
//! `Open` means someone is responsible for draining the queue (a worker is
//! resuming the actor, or the actor has been scheduled). The producer that
//! flips `Blocked` back to `Open` receives `UnblockedReader` and must make
//! sure the reader runs again: cooperative actors are resubmitted to the
//! worker pool, dedicated-thread readers are woken through the condvar.

use crate::handle::{AbstractActor, ActorHandle};
use lattice_codec::Message;
use lattice_types::MessageId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// One queued message
#[derive(Clone)]
pub struct MailboxElement {
    pub sender: Option<ActorHandle>,
    pub mid: MessageId,
    pub content: Message,
}

impl MailboxElement {
    pub fn new(sender: Option<ActorHandle>, mid: MessageId, content: Message) -> Self {
        Self {
            sender,
            mid,
            content,
        }
    }
}

impl fmt::Debug for MailboxElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxElement")
            .field("sender", &self.sender.as_ref().map(|s| s.address()))
            .field("mid", &self.mid)
            .field("content", &self.content)
            .finish()
    }
}

/// Outcome of `Mailbox::enqueue`
#[derive(Debug)]
pub enum EnqueueResult {
    Success,
    /// The reader was blocked; the caller must get it running again
    UnblockedReader,
    /// The actor has terminated; the element is handed back for bouncing
    QueueClosed(MailboxElement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Blocked,
    Closed,
}

struct Inner {
    queue: VecDeque<MailboxElement>,
    state: State,
}

pub struct Mailbox {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl Mailbox {
    /// A new mailbox in the `Open` state
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                state: State::Open,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn enqueue(&self, element: MailboxElement) -> EnqueueResult {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => EnqueueResult::QueueClosed(element),
            State::Open => {
                inner.queue.push_back(element);
                EnqueueResult::Success
            }
            State::Blocked => {
                inner.queue.push_back(element);
                inner.state = State::Open;
                drop(inner);
                self.ready.notify_one();
                EnqueueResult::UnblockedReader
            }
        }
    }

    pub fn try_pop(&self) -> Option<MailboxElement> {
        self.inner.lock().queue.pop_front()
    }

    /// Marks the reader as blocked if nothing is queued
    ///
    /// Returns `false` if a message is waiting or the mailbox is closed; the
    /// reader must keep draining in that case.
    pub fn try_block(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == State::Open && inner.queue.is_empty() {
            inner.state = State::Blocked;
            true
        } else {
            false
        }
    }

    /// Waits until a producer unblocks the reader, the mailbox closes, or
    /// `deadline` passes. Returns `true` unless the deadline passed.
    pub fn await_unblocked(&self, deadline: Option<Instant>) -> bool {
        let mut inner = self.inner.lock();
        while inner.state == State::Blocked {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut inner, deadline).timed_out() {
                        if inner.state == State::Blocked {
                            inner.state = State::Open;
                            return false;
                        }
                        return true;
                    }
                }
                None => self.ready.wait(&mut inner),
            }
        }
        true
    }

    /// Blocking dequeue for dedicated-thread readers
    ///
    /// Returns `None` on timeout or when the mailbox is closed and drained.
    pub fn pop_blocking(&self, timeout: Option<Duration>) -> Option<MailboxElement> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(element) = self.try_pop() {
                return Some(element);
            }
            if self.is_closed() {
                return None;
            }
            if self.try_block() && !self.await_unblocked(deadline) {
                return None;
            }
        }
    }

    /// Closes the mailbox and returns everything still queued
    pub fn close(&self) -> Vec<MailboxElement> {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        let drained = inner.queue.drain(..).collect();
        drop(inner);
        self.ready.notify_all();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == State::Closed
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.lock().state == State::Blocked
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mailbox")
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_codec::message;
    use std::sync::Arc;
    use std::thread;

    fn element(n: u32) -> MailboxElement {
        MailboxElement::new(None, MessageId::ASYNC, message![n])
    }

    #[test]
    fn test_fifo_order() {
        let mailbox = Mailbox::new();
        for n in 0..100 {
            assert!(matches!(mailbox.enqueue(element(n)), EnqueueResult::Success));
        }
        for n in 0..100 {
            assert_eq!(mailbox.try_pop().unwrap().content.get::<u32>(0), Some(&n));
        }
        assert!(mailbox.try_pop().is_none());
    }

    #[test]
    fn test_blocked_reader_is_reported_once() {
        let mailbox = Mailbox::new();
        assert!(mailbox.try_block());
        assert!(mailbox.is_blocked());
        assert!(matches!(
            mailbox.enqueue(element(1)),
            EnqueueResult::UnblockedReader
        ));
        assert!(matches!(mailbox.enqueue(element(2)), EnqueueResult::Success));
        assert!(!mailbox.try_block());
    }

    #[test]
    fn test_closed_mailbox_hands_element_back() {
        let mailbox = Mailbox::new();
        mailbox.enqueue(element(1));
        let drained = mailbox.close();
        assert_eq!(drained.len(), 1);
        match mailbox.enqueue(element(7)) {
            EnqueueResult::QueueClosed(returned) => {
                assert_eq!(returned.content.get::<u32>(0), Some(&7))
            }
            other => panic!("expected QueueClosed, got {other:?}"),
        }
        assert!(mailbox.pop_blocking(None).is_none());
    }

    #[test]
    fn test_pop_blocking_wakes_on_enqueue() {
        let mailbox = Arc::new(Mailbox::new());
        let reader = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || mailbox.pop_blocking(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        mailbox.enqueue(element(3));
        let got = reader.join().unwrap().unwrap();
        assert_eq!(got.content.get::<u32>(0), Some(&3));
    }

    #[test]
    fn test_pop_blocking_times_out() {
        let mailbox = Mailbox::new();
        assert!(mailbox.pop_blocking(Some(Duration::from_millis(10))).is_none());
        assert!(!mailbox.is_blocked());
    }
}
