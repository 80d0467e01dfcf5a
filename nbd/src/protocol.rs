//! NBD protocol constants and wire codecs.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Covers the subset a client driver needs: both handshake variants
//! (oldstyle and fixed-newstyle with `NBD_OPT_EXPORT_NAME`) and the
//! READ/WRITE/DISC transmission commands with simple replies. All
//! multi-byte integers are big-endian on the wire.

#![allow(dead_code)]

use thiserror::Error;

// Handshake magic. Every server opens with NBD_MAGIC ("NBDMAGIC"); the
// second magic selects the protocol variant.
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
pub const NBD_OLDSTYLE_MAGIC: u64 = 0x00420281861253;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"

// Transmission magic
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Handshake flags (server, u16)
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Client flags (u32)
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// Transmission flags (u16)
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;

// Option types
pub const NBD_OPT_EXPORT_NAME: u32 = 1;

// Commands (u32 in the pre-flags request layout this driver speaks)
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;

/// Trailing pad of the oldstyle greeting and of an `EXPORT_NAME` finish
/// when `NO_ZEROES` was not negotiated.
pub const NBD_HANDSHAKE_PAD_BYTES: usize = 124;

/// Opaque per-request correlation token, echoed verbatim by the server.
pub type Handle = [u8; 8];

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("protocol negotiation failed: {reason}")]
    NegotiationFailed { reason: &'static str },

    #[error("unsupported command: {command}")]
    UnsupportedCommand { command: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
}

impl NbdCommand {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISC => Some(Self::Disconnect),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISC,
        }
    }
}

/// NBD request header (28 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdRequest {
    pub command: NbdCommand,
    pub handle: Handle,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.command.to_u32().to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle);
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let cmd = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let command =
            NbdCommand::from_u32(cmd).ok_or(NbdError::UnsupportedCommand { command: cmd })?;
        let handle: Handle = buf[8..16].try_into().unwrap();
        let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());

        Ok(Self {
            command,
            handle,
            offset,
            length,
        })
    }
}

/// NBD simple reply (16 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdReply {
    pub error: u32,
    pub handle: Handle,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: Handle) -> Self {
        Self { error: 0, handle }
    }

    pub fn error(handle: Handle, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle);
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let error = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let handle: Handle = buf[8..16].try_into().unwrap();
        Ok(Self { error, handle })
    }
}

/// Oldstyle server greeting: both magics, export size, flags, 124-byte pad.
#[derive(Debug, Clone, Copy)]
pub struct OldstyleGreeting {
    pub size_bytes: u64,
    pub flags: u32,
}

impl OldstyleGreeting {
    pub const SIZE_BYTES: usize = 8 + 8 + 8 + 4 + NBD_HANDSHAKE_PAD_BYTES;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        buf[8..16].copy_from_slice(&NBD_OLDSTYLE_MAGIC.to_be_bytes());
        buf[16..24].copy_from_slice(&self.size_bytes.to_be_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }
}

/// Newstyle server greeting: both magics and the server handshake flags.
#[derive(Debug, Clone, Copy)]
pub struct NewstyleGreeting {
    pub gflags: u16,
}

impl NewstyleGreeting {
    pub const SIZE_BYTES: usize = 8 + 8 + 2;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        buf[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[16..18].copy_from_slice(&self.gflags.to_be_bytes());
        buf
    }
}

/// Newstyle option request header; option data follows on the wire.
#[derive(Debug, Clone, Copy)]
pub struct NbdOption {
    pub option: u32,
    pub length: u32,
}

impl NbdOption {
    pub const SIZE_BYTES: usize = 8 + 4 + 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_OPTS_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTS_MAGIC,
                actual: magic,
            });
        }

        let option = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let length = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        Ok(Self { option, length })
    }
}

/// `EXPORT_NAME` handshake finish with `NO_ZEROES` negotiated: export size
/// and transmission flags, no trailing pad.
#[derive(Debug, Clone, Copy)]
pub struct ExportNameReply {
    pub size_bytes: u64,
    pub transmission_flags: u16,
}

impl ExportNameReply {
    pub const SIZE_BYTES: usize = 8 + 2;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&self.size_bytes.to_be_bytes());
        buf[8..10].copy_from_slice(&self.transmission_flags.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Self {
        Self {
            size_bytes: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            transmission_flags: u16::from_be_bytes(buf[8..10].try_into().unwrap()),
        }
    }
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
    assert!(OldstyleGreeting::SIZE_BYTES == 152);
    assert!(NewstyleGreeting::SIZE_BYTES == 18);
    assert!(NbdOption::SIZE_BYTES == 16);
    assert!(ExportNameReply::SIZE_BYTES == 10);
};
