use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// An owning wrapper for a kernel file descriptor.
///
/// At most one `Fd` owns a given descriptor. The descriptor is closed on
/// drop unless it is the invalid sentinel (`-1`) or ownership was given
/// away through [`Fd::into_raw`]. Moving an `Fd` leaves nothing behind to
/// close twice; the type is deliberately not `Clone`. Facades that need
/// to share a descriptor with in-flight operations wrap it in an `Arc`.
pub struct Fd {
    raw: RawFd,
}

impl Fd {
    /// Assumes ownership of `raw`.
    ///
    /// A negative handle is rejected with the current OS error, which is
    /// the common shape right after a failed creating syscall.
    pub fn new(raw: RawFd) -> io::Result<Self> {
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Fd { raw })
    }

    /// The invalid sentinel descriptor. Dropping it is a no-op.
    pub const fn invalid() -> Self {
        Fd { raw: -1 }
    }

    pub fn is_valid(&self) -> bool {
        self.raw >= 0
    }

    /// Releases ownership of the wrapped descriptor without closing it.
    pub fn into_raw(self) -> RawFd {
        let raw = self.raw;
        mem::forget(self);
        raw
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.raw >= 0 {
            // Nothing useful can be done with a close error here.
            unsafe { libc::close(self.raw) };
        }
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.raw
    }
}

impl FromRawFd for Fd {
    unsafe fn from_raw_fd(raw: RawFd) -> Self {
        Fd { raw }
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        self.into_raw()
    }
}

impl From<OwnedFd> for Fd {
    fn from(owned: OwnedFd) -> Self {
        Fd {
            raw: owned.into_raw_fd(),
        }
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fd").field(&self.raw).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn fd_is_open(raw: RawFd) -> bool {
        unsafe { libc::fcntl(raw, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_close_on_drop() {
        let (r, w) = raw_pipe();
        {
            let _r = Fd::new(r).unwrap();
            let _w = Fd::new(w).unwrap();
            assert!(fd_is_open(r));
        }
        assert!(!fd_is_open(r));
        assert!(!fd_is_open(w));
    }

    #[test]
    fn test_into_raw_releases_ownership() {
        let (r, w) = raw_pipe();
        let fd = Fd::new(r).unwrap();
        let released = fd.into_raw();
        assert_eq!(released, r);
        assert!(fd_is_open(released));
        unsafe {
            libc::close(released);
            libc::close(w);
        }
    }

    #[test]
    fn test_invalid_sentinel() {
        let fd = Fd::invalid();
        assert!(!fd.is_valid());
        assert_eq!(fd.as_raw_fd(), -1);
        // Dropping the sentinel must not close anything.
    }

    #[test]
    fn test_negative_handle_rejected() {
        assert!(Fd::new(-1).is_err());
    }
}
