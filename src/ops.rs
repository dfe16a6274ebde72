//! Thin non-blocking syscall wrappers consumed by the poll-then-sync
//! facades. Every function maps errnos straight out of the kernel; the
//! readiness orchestration lives with the callers.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};

use crate::fd::Fd;
use crate::file::{Buf, BufMut};

fn retry_errno(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

/// Reads into the buffers in order, stopping at the first short
/// transfer, end of stream, or would-block condition.
///
/// A would-block yields zero bytes for the buffer at hand and ends the
/// iteration without an error. An errno hit after some progress reports
/// the progress and leaves the error to the next operation.
///
/// # Safety
///
/// Every buffer must point at `len` writable bytes.
pub(crate) unsafe fn read_some(fd: RawFd, bufs: &[BufMut]) -> io::Result<usize> {
    let mut total = 0;
    for buf in bufs {
        if buf.len == 0 {
            continue;
        }
        let n = loop {
            let n = libc::read(fd, buf.ptr.cast(), buf.len);
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(errno) if retry_errno(errno) => return Ok(total),
                _ => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        };
        if n == 0 {
            // End of stream.
            return Ok(total);
        }
        total += n;
        if n < buf.len {
            return Ok(total);
        }
    }
    Ok(total)
}

/// The write-side counterpart of [`read_some`].
///
/// # Safety
///
/// Every buffer must point at `len` readable bytes.
pub(crate) unsafe fn write_some(fd: RawFd, bufs: &[Buf]) -> io::Result<usize> {
    let mut total = 0;
    for buf in bufs {
        if buf.len == 0 {
            continue;
        }
        let n = loop {
            let n = libc::write(fd, buf.ptr.cast(), buf.len);
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(errno) if retry_errno(errno) => return Ok(total),
                _ => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        };
        total += n;
        if n < buf.len {
            return Ok(total);
        }
    }
    Ok(total)
}

/// Performs one non-blocking accept. `Ok(None)` means the queue was
/// empty and the caller should wait for readiness again. The returned
/// descriptor is created non-blocking.
pub(crate) fn accept_some(fd: RawFd) -> io::Result<Option<(Fd, Option<SocketAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let raw = unsafe {
        libc::accept4(
            fd,
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if raw >= 0 {
        let addr = from_sockaddr(&storage, len);
        return Ok(Some((Fd::new(raw)?, addr)));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(errno) if retry_errno(errno) => Ok(None),
        _ => Err(err),
    }
}

/// Starts a non-blocking connection attempt. `Ok(true)` means the
/// connection completed immediately; `Ok(false)` means the caller must
/// wait for writability and then read back the socket error.
pub(crate) fn connect_start(fd: RawFd, addr: &SocketAddr) -> io::Result<bool> {
    let (storage, len) = to_sockaddr(addr);
    let rc = unsafe {
        libc::connect(
            fd,
            (&storage as *const libc::sockaddr_storage).cast(),
            len,
        )
    };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => Ok(false),
        _ => Err(err),
    }
}

/// Retrieves the result of a connection attempt that did not complete
/// immediately. Only meaningful once the socket polled writable.
pub(crate) fn connect_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Enables `O_NONBLOCK` on the descriptor if it is not set already.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                (&mut storage as *mut libc::sockaddr_storage)
                    .cast::<libc::sockaddr_in>()
                    .write(sin)
            };
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                (&mut storage as *mut libc::sockaddr_storage)
                    .cast::<libc::sockaddr_in6>()
                    .write(sin6)
            };
            (
                storage,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

fn from_sockaddr(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe {
                (storage as *const libc::sockaddr_storage)
                    .cast::<libc::sockaddr_in>()
                    .read()
            };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe {
                (storage as *const libc::sockaddr_storage)
                    .cast::<libc::sockaddr_in6>()
                    .read()
            };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Creates a non-blocking TCP socket for the given address family.
#[cfg(test)]
pub(crate) fn tcp_socket(addr: &SocketAddr) -> io::Result<Fd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let raw = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    Fd::new(raw)
}
