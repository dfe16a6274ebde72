//! Shared fixtures for the in-crate test suites.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fd::Fd;

/// Creates a close-on-exec pipe, returning the read and write ends.
pub(crate) fn pipe() -> io::Result<(Fd, Fd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((Fd::new(fds[0])?, Fd::new(fds[1])?))
}

/// Writes the whole payload into the descriptor.
pub(crate) fn write_fd(fd: &Fd, payload: &[u8]) -> io::Result<()> {
    let written =
        unsafe { libc::write(fd.as_raw_fd(), payload.as_ptr().cast(), payload.len()) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    assert_eq!(written as usize, payload.len());
    Ok(())
}

/// A one-shot result slot plus the handler that fills it. Lets a test
/// hand a continuation to an operation and assert on the outcome after
/// driving the proactor.
pub(crate) fn capture<T: Send + 'static>(
) -> (Arc<Mutex<Option<T>>>, impl FnOnce(T) + Send + 'static) {
    let slot = Arc::new(Mutex::new(None));
    let setter_slot = Arc::clone(&slot);
    (slot, move |value| {
        *setter_slot.lock() = Some(value);
    })
}
