//! Core types shared across the driver.

use bytes::{Bytes, BytesMut};
use nix::errno::Errno;

/// Sector size the upper block layer works in. Wire offsets and lengths
/// are byte quantities derived from it.
pub const SECTOR_SIZE: u32 = 512;
pub const SECTOR_SHIFT: u32 = 9;

const _: () = {
    assert!(SECTOR_SIZE == 1 << SECTOR_SHIFT);
    assert!(SECTOR_SIZE.is_power_of_two());
};

/// Geometry of the attached export, as negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    /// Export size in sectors.
    pub sectors: u64,
    pub sector_size: u32,
}

impl DiskInfo {
    pub fn size_bytes(&self) -> u64 {
        self.sectors * self.sector_size as u64
    }
}

/// Open flags recorded on the connection.
///
/// In secondary mode read requests are forwarded to the next driver in the
/// chain instead of being sent over NBD; writes still go to the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub secondary: bool,
}

/// A sector-range read from the upper block layer. The buffer must be
/// exactly `secs * SECTOR_SIZE` bytes; it is handed back, filled, in the
/// completion.
#[derive(Debug)]
pub struct ReadRequest {
    pub sector: u64,
    pub secs: u32,
    pub buf: BytesMut,
    pub token: u64,
}

/// A sector-range write from the upper block layer.
#[derive(Debug)]
pub struct WriteRequest {
    pub sector: u64,
    pub secs: u32,
    pub buf: Bytes,
    pub token: u64,
}

/// Completion of a queued request, delivered through [`CompletionSink`].
///
/// `buf` returns the read destination buffer to its owner (filled on
/// success, as-is on failure); writes complete without a buffer.
#[derive(Debug)]
pub struct Completion {
    pub token: u64,
    pub buf: Option<BytesMut>,
    pub status: Result<(), Errno>,
}

/// The upward interface: how the driver reports request outcomes to the
/// upper block layer, and where secondary-mode reads are forwarded.
pub trait CompletionSink {
    fn complete(&self, completion: Completion);

    /// Hand a read to the next driver in the chain (secondary mode).
    fn forward_read(&self, request: ReadRequest);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_info_size() {
        let info = DiskInfo {
            sectors: 16777216,
            sector_size: SECTOR_SIZE,
        };
        assert_eq!(info.size_bytes(), 8 * 1024 * 1024 * 1024);
    }
}
