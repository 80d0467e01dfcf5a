//! NBD (Network Block Device) protocol wire formats.
//!
//! This crate provides the constants and fixed-layout codecs for the NBD
//! handshake (oldstyle and fixed-newstyle) and transmission phases, as
//! consumed by the `tapnbd` client driver and its test servers.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod protocol;

pub use protocol::*;
