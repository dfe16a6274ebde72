//! A single-threaded proactor on Linux `io_uring` with a
//! continuation-passing I/O surface.
//!
//! The [`Proactor`] owns the ring and multiplexes many outstanding
//! kernel operations on one driver thread. Other threads hand it work
//! through its [`Executor`]; completions are dispatched to the
//! continuation supplied when the operation was initiated. Facades wrap
//! descriptors: [`AsyncFile`] for regular files served natively by the
//! ring, [`PollFile`], [`AcceptFile`] and [`ConnectFile`] for streams
//! that go through a readiness wait followed by a non-blocking syscall.

pub mod error;
pub use error::{Error, Result};

mod fd;
pub use fd::Fd;

mod callable;
mod eventfd;
mod notify;
mod ring;

pub mod proactor;
pub use proactor::{Executor, Proactor};

mod ops;
mod service;

pub mod file;
pub use file::{AcceptFile, Accepted, AsyncFile, Buf, BufMut, ConnectFile, PollFile};

#[cfg(test)]
mod test_utils;
