//! Result channel between a worker and the pool.
//!
//! One unidirectional pipe per worker: the child owns the write end, the
//! parent owns the read end. Both ends are `OwnedFd`s so each is closed
//! exactly once, on drop.

use nix::errno::Errno;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Size of a single read from a result channel (64KB).
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A pipe end that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn into_inner(self) -> OwnedFd {
        self.fd
    }

    /// Append whatever one `read(2)` returns to `buf`.
    ///
    /// Returns the number of bytes appended; zero means EOF.
    pub fn read_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = self.read(&mut chunk)?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Create a result channel, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec, so programs a task executes never hold the
/// write end open past the worker's own exit.
pub fn channel() -> io::Result<(PipeFd, PipeFd)> {
    let (reader, writer) = io::pipe()?;
    Ok((
        PipeFd::new(OwnedFd::from(reader)),
        PipeFd::new(OwnedFd::from(writer)),
    ))
}
