use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};

use crate::fd::Fd;

/// Wraps a kernel event counter created by `eventfd(2)`.
///
/// The counter is a saturating 64-bit value maintained by the kernel.
/// [`EventFd::add`] increments it from any thread and [`EventFd::consume`]
/// reads it back. In the default mode a read resets the counter and
/// returns everything accumulated since the previous read; in semaphore
/// mode each read decrements the counter by one and returns one.
///
/// The proactor uses reset-on-read for all of its internal counters.
pub(crate) struct EventFd {
    fd: Fd,
}

impl EventFd {
    pub(crate) fn new(initval: u32, semaphore: bool) -> io::Result<Self> {
        let mut flags = libc::EFD_CLOEXEC;
        if semaphore {
            flags |= libc::EFD_SEMAPHORE;
        }
        let raw = unsafe { libc::eventfd(initval, flags) };
        Ok(EventFd { fd: Fd::new(raw)? })
    }

    /// Adds `n` to the event counter.
    pub(crate) fn add(&self, n: u64) -> io::Result<()> {
        let buf = n.to_ne_bytes();
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr().cast(),
                mem::size_of::<u64>(),
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        debug_assert_eq!(written as usize, mem::size_of::<u64>());
        Ok(())
    }

    /// Reads the counter. Blocks if the counter is zero, so callers only
    /// consume after the descriptor polled readable.
    pub(crate) fn consume(&self) -> io::Result<u64> {
        let mut buf = [0u8; mem::size_of::<u64>()];
        let read = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                mem::size_of::<u64>(),
            )
        };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        debug_assert_eq!(read as usize, mem::size_of::<u64>());
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
