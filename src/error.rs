use std::io;

/// A centralized result alias for proactor and facade operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the proactor, the ring and the initiation paths.
///
/// Failures of an individual asynchronous operation are not represented
/// here. Those travel through the operation's continuation as a
/// [`std::io::Error`] carrying the raw errno from the kernel.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The submission queue ring is full. This is a specific, recoverable
    /// state where the application should run the driver to reap
    /// completions before staging more I/O.
    #[error("submission queue ring is full, cannot stage operation")]
    SqFull,

    /// The submission queue ring is full while re-arming one of the
    /// internal event descriptors. The driver cannot make progress
    /// without its wakeup channels, so this is fatal for the current
    /// driver invocation.
    #[error("FATAL: submission queue ring is full, cannot re-arm internal event descriptor")]
    SqFullInternal,

    /// Operations were initiated against a proactor whose services have
    /// already been shut down.
    #[error("proactor services have been shut down")]
    Shutdown,

    /// An I/O error from the kernel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Collapses an initiation failure into an errno suitable for
    /// delivery through a continuation.
    pub(crate) fn to_errno(&self) -> i32 {
        match self {
            Error::SqFull | Error::SqFullInternal => libc::EBUSY,
            Error::Shutdown => libc::ECANCELED,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SqFull, Self::SqFull) => true,
            (Self::SqFullInternal, Self::SqFullInternal) => true,
            (Self::Shutdown, Self::Shutdown) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
