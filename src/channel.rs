//! Duplex byte channel to the server.
//!
//! A connection only needs ordered bytes in both directions plus a way to
//! wait until the channel is readable or writable. TCP and Unix sockets are
//! provided; anything else (in-memory pipes in tests, proxies) can implement
//! [`Channel`] directly.

use std::io;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// I/O direction a caller is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// An opaque duplex byte channel with readiness notification.
pub trait Channel: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    /// Resolve once the channel is ready for `direction`.
    ///
    /// Readiness may be spurious; `try_read`/`try_write` then report
    /// [`io::ErrorKind::WouldBlock`].
    fn poll_ready(&self, cx: &mut Context<'_>, direction: Direction) -> Poll<io::Result<()>>;

    /// Non-blocking read. `Ok(0)` is end of stream.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl Channel for TcpStream {
    fn poll_ready(&self, cx: &mut Context<'_>, direction: Direction) -> Poll<io::Result<()>> {
        match direction {
            Direction::Read => self.poll_read_ready(cx),
            Direction::Write => self.poll_write_ready(cx),
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

#[cfg(unix)]
impl Channel for UnixStream {
    fn poll_ready(&self, cx: &mut Context<'_>, direction: Direction) -> Poll<io::Result<()>> {
        match direction {
            Direction::Read => self.poll_read_ready(cx),
            Direction::Write => self.poll_write_ready(cx),
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        UnixStream::try_write(self, buf)
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn poll_ready(&self, cx: &mut Context<'_>, direction: Direction) -> Poll<io::Result<()>> {
        (**self).poll_ready(cx, direction)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).try_read(buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }
}
