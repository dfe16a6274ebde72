use std::io;
use std::os::fd::RawFd;

use io_uring::{cqueue, squeue, IoUring};

use crate::error::{Error, Result};

/// Owns the kernel ring and mediates every touch of the shared queues.
///
/// The submission side is only ever driven from one thread at a time
/// (the initiation paths and the driver serialize through the proactor
/// core), so entries are pushed without additional synchronization and
/// synced to the kernel right before each `enter`.
pub(crate) struct Ring {
    ring: IoUring,
}

impl Ring {
    pub(crate) fn try_new(entries: u32) -> Result<Self> {
        let ring = IoUring::builder().build(entries).map_err(Error::Io)?;
        Ok(Ring { ring })
    }

    /// Registers descriptors as kernel-side fixed files. Index in the
    /// slice becomes the fixed file index.
    pub(crate) fn register_files(&self, fds: &[RawFd]) -> io::Result<()> {
        self.ring.submitter().register_files(fds)
    }

    /// Stages one prepared entry. Fails with [`Error::SqFull`] when the
    /// submission ring has no free slot; callers do not retry.
    pub(crate) fn push(&mut self, entry: &squeue::Entry) -> Result<()> {
        unsafe { self.ring.submission().push(entry) }.map_err(|_| Error::SqFull)
    }

    /// Syncs and submits everything staged so far without waiting.
    pub(crate) fn submit(&mut self) -> io::Result<usize> {
        self.ring.submission().sync();
        self.ring.submitter().submit()
    }

    /// Syncs and submits, then blocks in the kernel until at least
    /// `want` completions are available.
    pub(crate) fn submit_and_wait(&mut self, want: usize) -> io::Result<usize> {
        self.ring.submission().sync();
        self.ring.submitter().submit_and_wait(want)
    }

    /// Pops one completion if any is ready. The queue head advances when
    /// the borrowed completion queue drops, which marks the entry seen.
    pub(crate) fn next_cqe(&mut self) -> Option<cqueue::Entry> {
        let mut cq = self.ring.completion();
        cq.sync();
        cq.next()
    }

    #[cfg(test)]
    pub(crate) fn sq_capacity(&mut self) -> usize {
        self.ring.submission().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use io_uring::opcode::Nop;

    #[test]
    fn test_nop_round_trip() -> anyhow::Result<()> {
        let mut ring = Ring::try_new(4)?;
        ring.push(&Nop::new().build().user_data(99))?;
        ring.submit_and_wait(1)?;
        let cqe = ring.next_cqe().expect("one completion");
        assert_eq!(cqe.user_data(), 99);
        assert_eq!(cqe.result(), 0);
        assert!(ring.next_cqe().is_none());
        Ok(())
    }

    #[test]
    fn test_push_fails_when_ring_full() -> anyhow::Result<()> {
        let mut ring = Ring::try_new(2)?;
        assert_eq!(ring.sq_capacity(), 2);
        ring.push(&Nop::new().build())?;
        ring.push(&Nop::new().build())?;
        assert_eq!(ring.push(&Nop::new().build()), Err(Error::SqFull));

        // Submitting drains the staged entries and slots free up again.
        ring.submit_and_wait(2)?;
        ring.push(&Nop::new().build())?;
        Ok(())
    }

    #[test]
    fn test_completions_delivered_in_kernel_order() -> anyhow::Result<()> {
        let mut ring = Ring::try_new(8)?;
        for i in 0..3 {
            ring.push(&Nop::new().build().user_data(i))?;
        }
        ring.submit_and_wait(3)?;
        for i in 0..3 {
            assert_eq!(ring.next_cqe().expect("cqe").user_data(), i);
        }
        Ok(())
    }
}
