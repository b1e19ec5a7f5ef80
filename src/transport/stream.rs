//! Byte-stream transport abstraction.

use std::io;
use std::os::fd::{AsFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Readiness direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    pub(crate) fn poll_flags(self) -> PollFlags {
        match self {
            Interest::Readable => PollFlags::POLLIN,
            Interest::Writable => PollFlags::POLLOUT,
        }
    }
}

/// A connected, non-blocking byte stream.
///
/// `read` and `write` follow `std::io` conventions: `Ok(0)` from `read` is
/// end of stream and `WouldBlock` means "try again after [`wait`]".
///
/// [`wait`]: Transport::wait
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Block until the stream is ready in `interest`, or `timeout` passes.
    /// Returns `false` on timeout.
    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool>;

    /// Descriptor for reactor registration, if the transport has one.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Release the stream. Calling it again is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write all of `data`, waiting out `WouldBlock`.
    fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(Interest::Writable, None)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).wait(interest, timeout)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        (**self).raw_fd()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Convert an optional wait bound to a poll timeout, rounding up to whole
/// milliseconds so a short wait never degrades into a busy loop.
pub(crate) fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    }
}

/// Wait for one descriptor. `EINTR` counts as a timeout.
pub(crate) fn wait_fd<F: AsFd>(fd: &F, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd.as_fd(), interest.poll_flags())];
    match poll(&mut fds, poll_timeout(timeout)) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
        assert_eq!(
            poll_timeout(Some(Duration::from_micros(10))),
            PollTimeout::try_from(1i32).unwrap()
        );
        assert_eq!(
            poll_timeout(Some(Duration::ZERO)),
            PollTimeout::try_from(0i32).unwrap()
        );
    }

    #[test]
    fn test_wait_fd_readable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        assert!(!wait_fd(&a, Interest::Readable, Some(Duration::from_millis(5))).unwrap());
        b.write_all(b"x").unwrap();
        assert!(wait_fd(&a, Interest::Readable, Some(Duration::from_secs(1))).unwrap());
        assert!(wait_fd(&a, Interest::Writable, Some(Duration::ZERO)).unwrap());
    }
}
