use std::io;
use std::os::fd::{AsRawFd, RawFd};

use crate::error::Result;
use crate::fd::Fd;
use crate::file::{Buf, BufMut, BufSet, FileBase};
use crate::ops;
use crate::proactor::{Executor, Proactor};
use crate::service::{poll_add_result, Readiness};

/// An I/O object for byte streams that the ring cannot serve directly
/// with vectored reads and writes: sockets, pipes and other non-regular
/// descriptors.
///
/// Streaming operations follow the classic two-step pattern: the ring is
/// used only to wait for readiness, then a non-blocking syscall performs
/// the transfer in user space. Construction therefore requires (and
/// enforces) that the descriptor is in non-blocking mode.
pub struct PollFile {
    base: FileBase,
}

impl PollFile {
    /// Wraps `file`, enabling `O_NONBLOCK` on it if not already set.
    pub fn new(ctx: &Proactor, file: Fd) -> Result<PollFile> {
        ops::set_nonblocking(file.as_raw_fd())?;
        Ok(PollFile {
            base: FileBase::new(ctx, file),
        })
    }

    pub fn executor(&self) -> Executor {
        self.base.executor()
    }

    /// Completes when the descriptor becomes readable.
    pub fn async_poll_in<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        self.poll_ready(Readiness::IN, handler)
    }

    /// Completes when the descriptor becomes writable.
    pub fn async_poll_out<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        self.poll_ready(Readiness::OUT, handler)
    }

    /// The `user_data` cookies of this object's in-flight operations,
    /// usable as [`PollFile::async_cancel`] targets.
    pub fn pending_ops(&self) -> Vec<u64> {
        self.base.pending_ops()
    }

    /// Asks the kernel to remove the readiness poll identified by
    /// `user_data`. The cancelled operation completes with an
    /// operation-aborted error; this operation's own handler sees the
    /// removal result (`ENOENT` when nothing matched).
    pub fn async_cancel<F>(&self, user_data: u64, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        self.base.cancel(user_data, handler)
    }

    /// Reads into `bufs` once the descriptor is readable.
    ///
    /// A zero-length buffer sequence completes immediately with zero
    /// bytes through the executor, without waiting for readiness.
    ///
    /// # Safety
    ///
    /// The memory behind `bufs` must stay valid and unaliased until the
    /// handler is invoked or the proactor is dropped, whichever comes
    /// first.
    pub unsafe fn async_read_some<F>(&self, bufs: &[BufMut], handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<usize>) + Send + 'static,
    {
        let h = self.base.guard_fd(handler);
        if bufs.iter().map(|b| b.len).sum::<usize>() == 0 {
            return self.base.executor().post(move || h(Ok(0)));
        }
        let raw = self.base.raw();
        let bufs = BufSet::copied(bufs);
        self.base.initiate_poll(Readiness::IN, move |cqe| {
            let out = poll_add_result(cqe.res)
                .and_then(|_| unsafe { ops::read_some(raw, bufs.as_slice()) });
            h(out)
        })
    }

    /// Writes from `bufs` once the descriptor is writable.
    ///
    /// A zero-length buffer sequence completes immediately with zero
    /// bytes through the executor, without waiting for writability.
    ///
    /// # Safety
    ///
    /// The memory behind `bufs` must stay valid until the handler is
    /// invoked or the proactor is dropped, whichever comes first.
    pub unsafe fn async_write_some<F>(&self, bufs: &[Buf], handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<usize>) + Send + 'static,
    {
        let h = self.base.guard_fd(handler);
        if bufs.iter().map(|b| b.len).sum::<usize>() == 0 {
            return self.base.executor().post(move || h(Ok(0)));
        }
        let raw = self.base.raw();
        let bufs = BufSet::copied(bufs);
        self.base.initiate_poll(Readiness::OUT, move |cqe| {
            let out = poll_add_result(cqe.res)
                .and_then(|_| unsafe { ops::write_some(raw, bufs.as_slice()) });
            h(out)
        })
    }

    fn poll_ready<F>(&self, interest: Readiness, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        let h = self.base.guard_fd(handler);
        self.base
            .initiate_poll(interest, move |cqe| h(poll_add_result(cqe.res).map(drop)))
    }
}

impl AsRawFd for PollFile {
    fn as_raw_fd(&self) -> RawFd {
        self.base.raw()
    }
}
