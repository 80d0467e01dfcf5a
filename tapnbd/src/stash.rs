//! Stash for sockets handed in from a sibling process.
//!
//! A peer process can pass already-connected sockets to this daemon over a
//! local control socket, tagged with a string identifier; `open` then
//! consumes them by name. The stash is a small fixed table, process-wide.
//! `close` parks a connection's socket back here so a later `open` of the
//! same name reuses it.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{error, info};

/// Capacity of the passed-fd table.
pub const N_PASSED_FDS: usize = 10;

/// Identifiers compare equal on their first `MAX_ID_BYTES` bytes; longer
/// names are truncated when stored.
const MAX_ID_BYTES: usize = 39;

/// Prefix of the local socket the fd receiver listens on; the process id
/// is appended so each daemon instance gets its own endpoint.
pub const RECEIVER_SOCK_PREFIX: &str = "/var/run/tapnbd/nbdclient";

struct StashSlot {
    id: String,
    fd: Option<OwnedFd>,
}

/// Fixed-capacity table mapping identifier to a connected socket.
pub struct FdStash {
    slots: [StashSlot; N_PASSED_FDS],
}

impl Default for FdStash {
    fn default() -> Self {
        Self::new()
    }
}

impl FdStash {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| StashSlot {
                id: String::new(),
                fd: None,
            }),
        }
    }

    /// Store `fd` under `id`. A slot already holding this id is replaced
    /// (its old fd closed); otherwise the first empty slot is used. With
    /// no slot available the fd is closed and dropped.
    pub fn stash(&mut self, fd: OwnedFd, id: &str) {
        // Empty slots are checked first so an unused slot's id is never
        // compared against.
        let chosen = self
            .slots
            .iter()
            .position(|slot| slot.fd.is_none() || id_matches(&slot.id, id));
        let Some(index) = chosen else {
            error!(
                id,
                capacity = N_PASSED_FDS,
                "fd table full, cannot stash another passed fd"
            );
            return;
        };

        let slot = &mut self.slots[index];
        slot.id = truncate_id(id);
        // Replacing drops (closes) any fd still held in the slot.
        slot.fd = Some(fd);
    }

    /// Take the fd stored under `id`, leaving the slot empty.
    pub fn retrieve(&mut self, id: &str) -> Option<OwnedFd> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.fd.is_some() && id_matches(&slot.id, id))?;
        slot.fd.take()
    }

    /// Hand a connection's socket back at close time so a future `open`
    /// of the same name reuses it.
    pub fn park(&mut self, fd: OwnedFd, id: &str) {
        self.stash(fd, id);
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.fd.is_some()).count()
    }
}

fn id_matches(a: &str, b: &str) -> bool {
    let a = &a.as_bytes()[..a.len().min(MAX_ID_BYTES)];
    let b = &b.as_bytes()[..b.len().min(MAX_ID_BYTES)];
    a == b
}

fn truncate_id(id: &str) -> String {
    if id.len() <= MAX_ID_BYTES {
        return id.to_string();
    }
    let mut end = MAX_ID_BYTES;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    id[..end].to_string()
}

static STASH: OnceLock<Mutex<FdStash>> = OnceLock::new();

/// The process-wide stash.
pub fn global() -> &'static Mutex<FdStash> {
    STASH.get_or_init(|| Mutex::new(FdStash::new()))
}

/// Reset the table at daemon startup, before the fd receiver is wired up.
pub fn init() {
    *global().lock() = FdStash::new();
}

/// Drop (and close) everything still stashed, at daemon shutdown.
pub fn shutdown() {
    let remaining = {
        let mut stash = global().lock();
        let remaining = stash.occupied();
        *stash = FdStash::new();
        remaining
    };
    if remaining > 0 {
        info!(remaining, "closed stashed fds at shutdown");
    }
}

/// Delivery callback handed to the fd receiver.
pub fn stash_passed_fd(fd: OwnedFd, id: &str) {
    global().lock().stash(fd, id);
}

/// Where the fd receiver for this process listens.
pub fn receiver_socket_path() -> PathBuf {
    PathBuf::from(format!("{}{}", RECEIVER_SOCK_PREFIX, std::process::id()))
}
