//! Protocol negotiation.
//!
//! Runs exactly once per connection, with the socket still in blocking
//! mode; each receive is bounded by the configured timeout. The server's
//! second magic selects the oldstyle or newstyle dialog. On success the
//! export geometry is known and the socket has been flipped to
//! non-blocking for the transmission phase. On any failure the socket is
//! unusable and the caller closes it.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nbd::{
    ExportNameReply, NbdError, NbdOption, NBD_FLAG_C_FIXED_NEWSTYLE, NBD_FLAG_C_NO_ZEROES,
    NBD_HANDSHAKE_PAD_BYTES, NBD_MAGIC, NBD_OLDSTYLE_MAGIC, NBD_OPTS_MAGIC, NBD_OPT_EXPORT_NAME,
};
use tracing::{error, info};

use crate::error::{HandshakeError, TransportError};
use crate::transport::{send_fully, set_nonblocking, wait_recv};
use crate::types::{DiskInfo, SECTOR_SHIFT, SECTOR_SIZE};

const PAD_DRAIN_CHUNK: usize = 256;

/// Negotiate the export. Blocking-mode dialog; flips the socket to
/// non-blocking before returning the geometry.
pub fn negotiate(
    socket: &OwnedFd,
    export_name: &str,
    timeout: Duration,
) -> Result<DiskInfo, HandshakeError> {
    let fd = socket.as_raw_fd();

    let magic = recv_u64(fd, timeout)?;
    if magic != NBD_MAGIC {
        error!(actual = %format_args!("{magic:#x}"), "bad NBD greeting magic");
        return Err(NbdError::InvalidMagic {
            expected: NBD_MAGIC,
            actual: magic,
        }
        .into());
    }

    // The second magic tells us which protocol the server is offering.
    let style = recv_u64(fd, timeout)?;
    let info = match style {
        NBD_OLDSTYLE_MAGIC => negotiate_oldstyle(fd, timeout)?,
        NBD_OPTS_MAGIC => negotiate_newstyle(fd, export_name, timeout)?,
        other => {
            error!(
                actual = %format_args!("{other:#x}"),
                "unknown handshake variant magic"
            );
            return Err(NbdError::NegotiationFailed {
                reason: "unknown handshake variant magic",
            }
            .into());
        }
    };

    set_nonblocking(fd)?;
    Ok(info)
}

/// Oldstyle: the server sends size, flags, and 124 bytes of padding.
fn negotiate_oldstyle(fd: RawFd, timeout: Duration) -> Result<DiskInfo, HandshakeError> {
    let size = recv_u64(fd, timeout)?;
    let flags = recv_u32(fd, timeout)?;

    let mut scratch = [0u8; PAD_DRAIN_CHUNK];
    let mut remaining = NBD_HANDSHAKE_PAD_BYTES;
    while remaining > 0 {
        let chunk = remaining.min(PAD_DRAIN_CHUNK);
        let n = wait_recv(fd, &mut scratch[..chunk], timeout)?;
        if n == 0 {
            return Err(TransportError::PeerClosed.into());
        }
        remaining -= n;
    }

    info!(size, flags, "connected to oldstyle NBD server");
    Ok(DiskInfo {
        sectors: size >> SECTOR_SHIFT,
        sector_size: SECTOR_SIZE,
    })
}

/// Newstyle: exchange handshake flags, then request the export by name.
/// `NO_ZEROES` is always requested, so the finish is 10 bytes with no pad.
fn negotiate_newstyle(
    fd: RawFd,
    export_name: &str,
    timeout: Duration,
) -> Result<DiskInfo, HandshakeError> {
    let gflags = recv_u16(fd, timeout)?;

    let cflags = NBD_FLAG_C_FIXED_NEWSTYLE | NBD_FLAG_C_NO_ZEROES;
    send_fully(fd, &cflags.to_be_bytes(), timeout)?;

    let option = NbdOption {
        option: NBD_OPT_EXPORT_NAME,
        length: export_name.len() as u32,
    };
    send_fully(fd, &option.to_bytes(), timeout)?;
    send_fully(fd, export_name.as_bytes(), timeout)?;

    let mut finish = [0u8; ExportNameReply::SIZE_BYTES];
    recv_exact(fd, &mut finish, timeout)?;
    let reply = ExportNameReply::from_bytes(&finish);

    info!(
        gflags,
        size = reply.size_bytes,
        tflags = reply.transmission_flags,
        export = export_name,
        "connected to newstyle NBD server"
    );
    Ok(DiskInfo {
        sectors: reply.size_bytes >> SECTOR_SHIFT,
        sector_size: SECTOR_SIZE,
    })
}

/// One bounded recv; anything short of the full buffer fails the
/// handshake.
fn recv_exact(fd: RawFd, buf: &mut [u8], timeout: Duration) -> Result<(), HandshakeError> {
    let n = wait_recv(fd, buf, timeout)?;
    if n < buf.len() {
        return Err(HandshakeError::ShortRead {
            wanted: buf.len(),
            got: n,
        });
    }
    Ok(())
}

fn recv_u64(fd: RawFd, timeout: Duration) -> Result<u64, HandshakeError> {
    let mut buf = [0u8; 8];
    recv_exact(fd, &mut buf, timeout)?;
    Ok(u64::from_be_bytes(buf))
}

fn recv_u32(fd: RawFd, timeout: Duration) -> Result<u32, HandshakeError> {
    let mut buf = [0u8; 4];
    recv_exact(fd, &mut buf, timeout)?;
    Ok(u32::from_be_bytes(buf))
}

fn recv_u16(fd: RawFd, timeout: Duration) -> Result<u16, HandshakeError> {
    let mut buf = [0u8; 2];
    recv_exact(fd, &mut buf, timeout)?;
    Ok(u16::from_be_bytes(buf))
}
