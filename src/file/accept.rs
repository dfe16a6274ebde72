use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::callable::Callable;
use crate::error::Result;
use crate::fd::Fd;
use crate::file::FileBase;
use crate::ops;
use crate::proactor::{Executor, Proactor, Shared};
use crate::service::{poll_add_result, CqeEvent, Readiness};

/// One accepted connection: the new descriptor (created non-blocking)
/// and the peer address when the kernel provided one.
#[derive(Debug)]
pub struct Accepted {
    pub fd: Fd,
    pub addr: Option<SocketAddr>,
}

/// An I/O object wrapping a listening socket.
pub struct AcceptFile {
    base: FileBase,
}

impl AcceptFile {
    /// Wraps `file`, enabling `O_NONBLOCK` on it if not already set.
    pub fn new(ctx: &Proactor, file: Fd) -> Result<AcceptFile> {
        ops::set_nonblocking(file.as_raw_fd())?;
        Ok(AcceptFile {
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

    /// Accepts one connection: waits for the listener to become
    /// readable, then performs a non-blocking accept. A raced-away
    /// connection (the accept queue was drained before we got there)
    /// re-arms the readiness wait instead of failing.
    pub fn async_accept<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<Accepted>) + Send + 'static,
    {
        let handler: AcceptHandler = Box::new(self.base.guard_fd(handler));
        arm_accept(
            self.base.shared(),
            self.base.object(),
            self.base.raw(),
            Arc::new(HandlerCell::new(handler)),
        )
    }
}

impl AsRawFd for AcceptFile {
    fn as_raw_fd(&self) -> RawFd {
        self.base.raw()
    }
}

type AcceptHandler = Box<dyn FnOnce(io::Result<Accepted>) + Send>;

/// Carries the user handler across re-arms of the readiness wait.
struct HandlerCell {
    slot: parking_lot::Mutex<Option<AcceptHandler>>,
}

impl HandlerCell {
    fn new(handler: AcceptHandler) -> Self {
        HandlerCell {
            slot: parking_lot::Mutex::new(Some(handler)),
        }
    }

    fn take(&self) -> Option<AcceptHandler> {
        self.slot.lock().take()
    }

    fn put_back(&self, handler: AcceptHandler) {
        *self.slot.lock() = Some(handler);
    }
}

fn arm_accept(
    shared: &Arc<Shared>,
    object: u64,
    raw: RawFd,
    cell: Arc<HandlerCell>,
) -> Result<()> {
    let rearm_shared = Arc::clone(shared);
    let rearm_cell = Arc::clone(&cell);
    shared
        .initiate(
            object,
            0,
            move |_, _| {
                io_uring::opcode::PollAdd::new(io_uring::types::Fd(raw), Readiness::IN.bits())
                    .build()
            },
            Callable::new(move |cqe: CqeEvent| {
                let Some(handler) = rearm_cell.take() else {
                    return;
                };
                match poll_add_result(cqe.res) {
                    Err(e) => handler(Err(e)),
                    Ok(_) => match ops::accept_some(raw) {
                        Ok(Some((fd, addr))) => handler(Ok(Accepted { fd, addr })),
                        Err(e) => handler(Err(e)),
                        Ok(None) => {
                            rearm_cell.put_back(handler);
                            if let Err(e) =
                                arm_accept(&rearm_shared, object, raw, Arc::clone(&rearm_cell))
                            {
                                if let Some(handler) = rearm_cell.take() {
                                    handler(Err(io::Error::from_raw_os_error(e.to_errno())));
                                }
                            }
                        }
                    },
                }
            }),
        )
        .map(drop)
}
