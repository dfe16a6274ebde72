use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use parking_lot::Mutex;

use crate::callable::Callable;
use crate::eventfd::EventFd;

/// A concurrent FIFO handing nullary continuations from any thread to
/// the driver thread, with an [`EventFd`] as the notification channel.
///
/// Producers push under a short lock and then bump the event counter.
/// The driver observes the descriptor becoming readable, consumes the
/// counter to learn how many items were published, and pops exactly that
/// many. Ordering is FIFO per producer; across producers it is whatever
/// order the lock grants.
///
/// The deque doubles as the node free list: popped slots are reused by
/// later pushes without further allocation once the buffer has grown.
pub(crate) struct NotifyQueue {
    event: EventFd,
    inner: Mutex<VecDeque<Callable<()>>>,
}

impl NotifyQueue {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(NotifyQueue {
            event: EventFd::new(0, false)?,
            inner: Mutex::new(VecDeque::new()),
        })
    }

    /// Publishes a continuation.
    ///
    /// If bumping the event counter fails the item remains queued and
    /// the error propagates; a later successful push makes it visible
    /// to the driver along with the new one.
    pub(crate) fn push(&self, f: Callable<()>) -> io::Result<()> {
        self.inner.lock().push_back(f);
        self.event.add(1)
    }

    /// Consumes the event counter, returning the number of published
    /// items not yet accounted for. Only meaningful after the descriptor
    /// polled readable.
    pub(crate) fn pending(&self) -> io::Result<u64> {
        self.event.consume()
    }

    pub(crate) fn pop(&self) -> Option<Callable<()>> {
        self.inner.lock().pop_front()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl AsRawFd for NotifyQueue {
    fn as_raw_fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }
}
