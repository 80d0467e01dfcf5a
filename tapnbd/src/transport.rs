//! Non-blocking socket transport.
//!
//! Partial sends and receives over a caller-supplied buffer with an
//! explicit progress cursor. EAGAIN is reported as [`IoProgress::Partial`]
//! so the engine can resume when the scheduler says the socket is ready
//! again; a zero-byte transfer means the peer shut down mid-stream.
//!
//! The blocking helpers ([`wait_recv`], [`send_fully`]) are only used
//! during the handshake and the close-path disconnect flush.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recv, send, MsgFlags};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoProgress {
    /// The whole buffer has been transferred.
    Done,
    /// The socket would block; retry on the next readiness callback.
    Partial,
}

/// Send `buf[*so_far..]`, advancing the cursor.
pub fn write_some(fd: RawFd, buf: &[u8], so_far: &mut usize) -> Result<IoProgress, TransportError> {
    while *so_far < buf.len() {
        match send(fd, &buf[*so_far..], MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => return Err(TransportError::PeerClosed),
            Ok(n) => *so_far += n,
            Err(Errno::EAGAIN) => return Ok(IoProgress::Partial),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(TransportError::Os(e)),
        }
    }
    Ok(IoProgress::Done)
}

/// Receive into `buf[*so_far..]`, advancing the cursor.
pub fn read_some(
    fd: RawFd,
    buf: &mut [u8],
    so_far: &mut usize,
) -> Result<IoProgress, TransportError> {
    while *so_far < buf.len() {
        match recv(fd, &mut buf[*so_far..], MsgFlags::empty()) {
            Ok(0) => return Err(TransportError::PeerClosed),
            Ok(n) => *so_far += n,
            Err(Errno::EAGAIN) => return Ok(IoProgress::Partial),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(TransportError::Os(e)),
        }
    }
    Ok(IoProgress::Done)
}

/// Wait up to `timeout` for `fd` to become readable, then issue a single
/// `recv`. Returns the byte count from that one call; 0 means the peer
/// closed, and a count short of `buf.len()` is the caller's problem.
pub fn wait_recv(fd: RawFd, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
    wait_for(fd, PollFlags::POLLIN, timeout)?;
    loop {
        match recv(fd, buf, MsgFlags::empty()) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(TransportError::Os(e)),
        }
    }
}

/// Send the whole buffer, polling for writability between attempts.
/// Used where the dialog is sequential and a partial send cannot be
/// parked: handshake option negotiation.
pub fn send_fully(fd: RawFd, buf: &[u8], timeout: Duration) -> Result<(), TransportError> {
    let mut so_far = 0;
    loop {
        match write_some(fd, buf, &mut so_far)? {
            IoProgress::Done => return Ok(()),
            IoProgress::Partial => wait_for(fd, PollFlags::POLLOUT, timeout)?,
        }
    }
}

/// Block until `fd` reports `flags`, or fail with `TimedOut`.
pub fn wait_for(fd: RawFd, flags: PollFlags, timeout: Duration) -> Result<(), TransportError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, flags)];
    let poll_timeout = PollTimeout::from(timeout.as_millis().min(u16::MAX as u128) as u16);
    loop {
        match poll(&mut fds, poll_timeout) {
            Ok(0) => return Err(TransportError::TimedOut),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(TransportError::Os(e)),
        }
    }
}

/// Flip a socket to non-blocking mode (the transmission-phase default).
pub fn set_nonblocking(fd: RawFd) -> Result<(), TransportError> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
