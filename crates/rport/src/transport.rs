//! Byte-stream transport.
//!
//! The channel only needs blocking reads from one thread and serialized
//! writes from others, so the trait works on `&self`. Stream sockets
//! implement it directly.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Blocking byte stream connecting two peers.
pub trait Transport: Send + Sync {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means the peer closed the stream.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes up to `buf.len()` bytes.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shuts both directions down, waking a blocked reader.
    fn shutdown(&self) -> io::Result<()>;

    /// Reads exactly `buf.len()` bytes.
    ///
    /// A stream closed before the buffer fills reports `UnexpectedEof`.
    fn recv_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match self.recv(&mut buf[done..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Writes all of `buf`.
    fn send_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match self.send(&buf[done..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, Shutdown::Both)
    }
}

impl Transport for TcpStream {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, Shutdown::Both)
    }
}
