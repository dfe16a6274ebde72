use std::io;
use std::os::fd::{AsRawFd, RawFd};

use io_uring::{opcode, types};

use crate::error::Result;
use crate::fd::Fd;
use crate::file::{Buf, BufMut, BufSet, FileBase};
use crate::proactor::{Executor, Proactor};
use crate::service::{fsync_result, rw_result};

/// An I/O object for descriptors the ring serves natively with vectored
/// reads and writes at explicit offsets: regular file system files.
/// Sockets, pipes and event descriptors belong on [`PollFile`] instead.
///
/// [`PollFile`]: crate::PollFile
pub struct AsyncFile {
    base: FileBase,
}

impl AsyncFile {
    pub fn new(ctx: &Proactor, file: Fd) -> AsyncFile {
        AsyncFile {
            base: FileBase::new(ctx, file),
        }
    }

    pub fn executor(&self) -> Executor {
        self.base.executor()
    }

    /// Reads into `bufs` at byte offset `offset` from the start of the
    /// file. At or past end of file the operation completes with zero
    /// bytes and no error.
    ///
    /// # Safety
    ///
    /// The memory behind `bufs` must stay valid and unaliased until the
    /// handler is invoked or the proactor is dropped, whichever comes
    /// first.
    pub unsafe fn async_read_some_at<F>(
        &self,
        offset: u64,
        bufs: &[BufMut],
        handler: F,
    ) -> Result<()>
    where
        F: FnOnce(io::Result<usize>) + Send + 'static,
    {
        let raw = self.base.raw();
        let h = self.base.guard_fd(handler);
        let bufs = BufSet::copied(bufs);
        self.base.initiate(
            bufs.as_slice().len(),
            move |iovs, _| {
                for (iov, buf) in iovs.iter_mut().zip(bufs.as_slice()) {
                    *iov = libc::iovec {
                        iov_base: buf.ptr.cast(),
                        iov_len: buf.len,
                    };
                }
                opcode::Readv::new(types::Fd(raw), iovs.as_ptr(), iovs.len() as u32)
                    .offset(offset as _)
                    .build()
            },
            move |cqe| h(rw_result(cqe.res)),
        )
    }

    /// Writes `bufs` at byte offset `offset` from the start of the file.
    ///
    /// # Safety
    ///
    /// The memory behind `bufs` must stay valid until the handler is
    /// invoked or the proactor is dropped, whichever comes first.
    pub unsafe fn async_write_some_at<F>(
        &self,
        offset: u64,
        bufs: &[Buf],
        handler: F,
    ) -> Result<()>
    where
        F: FnOnce(io::Result<usize>) + Send + 'static,
    {
        let raw = self.base.raw();
        let h = self.base.guard_fd(handler);
        let bufs = BufSet::copied(bufs);
        self.base.initiate(
            bufs.as_slice().len(),
            move |iovs, _| {
                for (iov, buf) in iovs.iter_mut().zip(bufs.as_slice()) {
                    *iov = libc::iovec {
                        iov_base: buf.ptr as *mut libc::c_void,
                        iov_len: buf.len,
                    };
                }
                opcode::Writev::new(types::Fd(raw), iovs.as_ptr(), iovs.len() as u32)
                    .offset(offset as _)
                    .build()
            },
            move |cqe| h(rw_result(cqe.res)),
        )
    }

    /// Flushes the file to stable storage, as `fdatasync` when
    /// `data_only` is set and as `fsync` otherwise.
    pub fn async_flush<F>(&self, data_only: bool, handler: F) -> Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        let raw = self.base.raw();
        let h = self.base.guard_fd(handler);
        self.base.initiate(
            0,
            move |_, _| {
                let mut op = opcode::Fsync::new(types::Fd(raw));
                if data_only {
                    op = op.flags(types::FsyncFlags::DATASYNC);
                }
                op.build()
            },
            move |cqe| h(fsync_result(cqe.res)),
        )
    }
}

impl AsRawFd for AsyncFile {
    fn as_raw_fd(&self) -> RawFd {
        self.base.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::capture;
    use crate::Proactor;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::OwnedFd;

    fn wrap(file: File) -> Fd {
        Fd::from(OwnedFd::from(file))
    }

    #[test]
    fn test_read_at_offset() -> anyhow::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(b"hello world")?;
        tmp.flush()?;

        let ctx = Proactor::new(32)?;
        let file = AsyncFile::new(&ctx, wrap(File::open(tmp.path())?));

        let mut buf = [0u8; 10];
        let (slot, set) = capture::<io::Result<usize>>();
        unsafe { file.async_read_some_at(6, &[BufMut::from_slice(&mut buf)], set)? };

        assert_eq!(ctx.run()?, 1);
        assert_eq!(slot.lock().take().expect("handler ran")?, 5);
        assert_eq!(&buf[..5], b"world");
        Ok(())
    }

    #[test]
    fn test_read_past_eof_completes_with_zero() -> anyhow::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(b"short")?;
        tmp.flush()?;

        let ctx = Proactor::new(32)?;
        let file = AsyncFile::new(&ctx, wrap(File::open(tmp.path())?));

        let mut buf = [0u8; 8];
        let (slot, set) = capture::<io::Result<usize>>();
        unsafe { file.async_read_some_at(64, &[BufMut::from_slice(&mut buf)], set)? };

        assert_eq!(ctx.run()?, 1);
        assert_eq!(slot.lock().take().expect("handler ran")?, 0);
        Ok(())
    }

    #[test]
    fn test_three_concurrent_writes_assemble_the_file() -> anyhow::Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        let ctx = Proactor::new(32)?;
        let file = AsyncFile::new(&ctx, wrap(tmp.reopen()?));

        let (s1, set1) = capture::<io::Result<usize>>();
        let (s2, set2) = capture::<io::Result<usize>>();
        let (s3, set3) = capture::<io::Result<usize>>();
        unsafe {
            file.async_write_some_at(0, &[Buf::from_slice(b"Hello")], set1)?;
            file.async_write_some_at(5, &[Buf::from_slice(b" wor")], set2)?;
            file.async_write_some_at(9, &[Buf::from_slice(b"ld!")], set3)?;
        }

        assert_eq!(ctx.run()?, 3);
        assert_eq!(s1.lock().take().expect("first handler")?, 5);
        assert_eq!(s2.lock().take().expect("second handler")?, 4);
        assert_eq!(s3.lock().take().expect("third handler")?, 3);

        let mut contents = String::new();
        let mut check = tmp.reopen()?;
        check.seek(SeekFrom::Start(0))?;
        check.read_to_string(&mut contents)?;
        assert_eq!(contents, "Hello world!");
        Ok(())
    }

    #[test]
    fn test_vectored_read_spans_buffers() -> anyhow::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(b"abcdefgh")?;
        tmp.flush()?;

        let ctx = Proactor::new(32)?;
        let file = AsyncFile::new(&ctx, wrap(File::open(tmp.path())?));

        let mut a = [0u8; 3];
        let mut b = [0u8; 5];
        let (slot, set) = capture::<io::Result<usize>>();
        unsafe {
            file.async_read_some_at(
                0,
                &[BufMut::from_slice(&mut a), BufMut::from_slice(&mut b)],
                set,
            )?
        };

        assert_eq!(ctx.run()?, 1);
        assert_eq!(slot.lock().take().expect("handler ran")?, 8);
        assert_eq!(&a, b"abc");
        assert_eq!(&b, b"defgh");
        Ok(())
    }

    #[test]
    fn test_flush_both_flavors() -> anyhow::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(b"durable")?;
        tmp.flush()?;

        let ctx = Proactor::new(32)?;
        let file = AsyncFile::new(&ctx, wrap(tmp.reopen()?));

        let (full, set_full) = capture::<io::Result<()>>();
        file.async_flush(false, set_full)?;
        assert_eq!(ctx.run()?, 1);
        assert!(full.lock().take().expect("fsync handler").is_ok());

        let (data, set_data) = capture::<io::Result<()>>();
        file.async_flush(true, set_data)?;
        ctx.restart()?;
        assert_eq!(ctx.run()?, 1);
        assert!(data.lock().take().expect("fdatasync handler").is_ok());
        Ok(())
    }
}
