use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use crate::error::Result;
use crate::fd::Fd;
use crate::file::FileBase;
use crate::ops;
use crate::proactor::{Executor, Proactor};
use crate::service::{poll_add_result, Readiness};

/// An I/O object wrapping a socket to connect somewhere.
pub struct ConnectFile {
    base: FileBase,
}

impl ConnectFile {
    /// Wraps `file`, enabling `O_NONBLOCK` on it if not already set.
    pub fn new(ctx: &Proactor, file: Fd) -> Result<ConnectFile> {
        ops::set_nonblocking(file.as_raw_fd())?;
        Ok(ConnectFile {
            base: FileBase::new(ctx, file),
        })
    }

    pub fn executor(&self) -> Executor {
        self.base.executor()
    }

    pub fn pending_ops(&self) -> Vec<u64> {
        self.base.pending_ops()
    }

    pub fn async_cancel<F>(&self, user_data: u64, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        self.base.cancel(user_data, handler)
    }

    /// Connects the socket to `addr`.
    ///
    /// The non-blocking connect is attempted immediately. If it
    /// completes at once (either way) the handler is posted through the
    /// executor, never invoked from this frame. Otherwise the socket is
    /// watched for writability and the handler receives the connection
    /// result read back from the socket error slot.
    pub fn async_connect<F>(&self, addr: &SocketAddr, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        let raw = self.base.raw();
        let h = self.base.guard_fd(handler);
        match ops::connect_start(raw, addr) {
            Ok(true) => self.base.executor().post(move || h(Ok(()))),
            Err(e) => self.base.executor().post(move || h(Err(e))),
            Ok(false) => self.base.initiate_poll(Readiness::OUT, move |cqe| {
                h(poll_add_result(cqe.res).and_then(|_| ops::connect_error(raw)))
            }),
        }
    }
}

impl AsRawFd for ConnectFile {
    fn as_raw_fd(&self) -> RawFd {
        self.base.raw()
    }
}
