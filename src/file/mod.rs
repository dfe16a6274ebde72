use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use io_uring::{opcode, squeue};

use crate::callable::Callable;
use crate::error::Result;
use crate::fd::Fd;
use crate::proactor::{Executor, Proactor, Shared};
use crate::service::{poll_remove_result, CqeEvent, IoHandle, Readiness};

// Exports
mod accept;
mod async_file;
mod connect;
mod poll_file;

pub use accept::{AcceptFile, Accepted};
pub use async_file::AsyncFile;
pub use connect::ConnectFile;
pub use poll_file::PollFile;

/// A borrowed view of writable memory handed to a read operation.
///
/// The view carries no lifetime: the caller of the operation taking it
/// guarantees the memory outlives the operation. [`BufMut::from_slice`]
/// is safe to call; only using the view in an operation is `unsafe`.
#[derive(Debug, Clone, Copy)]
pub struct BufMut {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
}

impl BufMut {
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        BufMut { ptr, len }
    }

    pub fn from_slice(slice: &mut [u8]) -> Self {
        BufMut {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A borrowed view of readable memory handed to a write operation.
#[derive(Debug, Clone, Copy)]
pub struct Buf {
    pub(crate) ptr: *const u8,
    pub(crate) len: usize,
}

impl Buf {
    pub fn new(ptr: *const u8, len: usize) -> Self {
        Buf { ptr, len }
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        Buf {
            ptr: slice.as_ptr(),
            len: slice.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Owned buffer views retained by an operation until it completes. The
/// initiating call's safety contract makes the pointers live for that
/// long, so carrying them across the driver thread is sound.
pub(crate) struct BufSet<T>(Vec<T>);

unsafe impl<T> Send for BufSet<T> {}

impl<T: Copy> BufSet<T> {
    pub(crate) fn copied(bufs: &[T]) -> Self {
        BufSet(bufs.to_vec())
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        &self.0
    }
}

/// State every facade owns: the executor handle, the shared descriptor
/// and the per-object service handle.
///
/// The descriptor is reference counted; each in-flight operation holds
/// one strong reference through its wrapped continuation, so the kernel
/// never sees the descriptor close while an operation is outstanding.
pub(crate) struct FileBase {
    exec: Executor,
    fd: Arc<Fd>,
    handle: Option<IoHandle>,
}

impl FileBase {
    pub(crate) fn new(ctx: &Proactor, file: Fd) -> FileBase {
        let shared = Arc::clone(ctx.shared());
        let handle = shared.construct_handle();
        FileBase {
            exec: Executor::new(shared),
            fd: Arc::new(file),
            handle: Some(handle),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        self.exec.shared()
    }

    pub(crate) fn executor(&self) -> Executor {
        self.exec.clone()
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn object(&self) -> u64 {
        self.handle.as_ref().expect("handle lives until drop").id()
    }

    /// Wraps a continuation so that it extends the descriptor's lifetime
    /// until it runs, and releases that reference immediately before the
    /// user code executes.
    pub(crate) fn guard_fd<A, F>(&self, f: F) -> impl FnOnce(A) + Send + 'static
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        let fd = Arc::clone(&self.fd);
        move |arg| {
            drop(fd);
            f(arg)
        }
    }

    pub(crate) fn initiate<P, F>(&self, iov_count: usize, prepare: P, handler: F) -> Result<()>
    where
        P: FnOnce(&mut [libc::iovec], u64) -> squeue::Entry,
        F: FnOnce(CqeEvent) + Send + 'static,
    {
        self.shared()
            .initiate(self.object(), iov_count, prepare, Callable::new(handler))
            .map(drop)
    }

    pub(crate) fn initiate_poll<F>(&self, interest: Readiness, handler: F) -> Result<()>
    where
        F: FnOnce(CqeEvent) + Send + 'static,
    {
        let raw = self.raw();
        self.initiate(
            0,
            move |_, _| {
                opcode::PollAdd::new(io_uring::types::Fd(raw), interest.bits()).build()
            },
            handler,
        )
    }

    pub(crate) fn pending_ops(&self) -> Vec<u64> {
        self.shared()
            .handle_user_data(self.handle.as_ref().expect("handle lives until drop"))
    }

    pub(crate) fn cancel<F>(&self, user_data: u64, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        let h = self.guard_fd(handler);
        self.initiate(
            0,
            move |_, _| opcode::PollRemove::new(user_data).build(),
            move |cqe| h(poll_remove_result(cqe.res)),
        )
    }
}

impl Drop for FileBase {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared().destroy_handle(handle);
        }
    }
}
