//! Event scheduler interface and a `poll(2)` implementation.
//!
//! The driver never owns an event loop: the surrounding daemon registers
//! its interest in fd readiness and invokes the registered callbacks from
//! a single thread. [`Scheduler`] is that registration surface.
//! [`PollScheduler`] is a minimal implementation used by the tests and the
//! `nbdprobe` binary.

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    Read,
    Write,
}

/// Token identifying a registration, for later unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

impl EventId {
    /// Mint an id; schedulers must hand out distinct values per live
    /// registration.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Callbacks carry their own context (an owning handle to the connection
/// they drive); the scheduler just invokes them.
pub type EventCallback = Box<dyn FnMut()>;

pub trait Scheduler {
    /// Register interest in `fd` becoming readable or writable. The
    /// callback fires once per readiness notification until unregistered.
    fn register(&self, mode: EventMode, fd: RawFd, callback: EventCallback) -> EventId;

    fn unregister(&self, id: EventId);
}

struct Registration {
    id: EventId,
    fd: RawFd,
    mode: EventMode,
    // Taken out while the callback runs so it may re-enter the scheduler.
    callback: Option<EventCallback>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    registrations: Vec<Registration>,
}

/// Single-threaded, level-triggered `poll(2)` dispatcher.
#[derive(Default)]
pub struct PollScheduler {
    inner: RefCell<Inner>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> usize {
        self.inner.borrow().registrations.len()
    }

    /// Poll all registered fds once and fire the callbacks of those that
    /// are ready. Returns the number of callbacks fired. `None` blocks
    /// until something is ready.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize, Errno> {
        let snapshot: Vec<(EventId, RawFd, EventMode)> = self
            .inner
            .borrow()
            .registrations
            .iter()
            .map(|r| (r.id, r.fd, r.mode))
            .collect();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let mut pollfds: Vec<PollFd> = snapshot
            .iter()
            .map(|&(_, fd, mode)| {
                let flags = match mode {
                    EventMode::Read => PollFlags::POLLIN,
                    EventMode::Write => PollFlags::POLLOUT,
                };
                // Owners unregister before closing their fd, so every
                // registered fd is live for the duration of this call.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, flags)
            })
            .collect();

        let poll_timeout = match timeout {
            Some(t) => PollTimeout::from(t.as_millis().min(u16::MAX as u128) as u16),
            None => PollTimeout::NONE,
        };
        loop {
            match poll(&mut pollfds, poll_timeout) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }

        let ready: Vec<EventId> = snapshot
            .iter()
            .zip(pollfds.iter())
            .filter(|(_, pfd)| pfd.revents().is_some_and(|r| !r.is_empty()))
            .map(|(&(id, _, _), _)| id)
            .collect();

        let mut fired = 0;
        for id in ready {
            if let Some(mut callback) = self.take_callback(id) {
                callback();
                fired += 1;
                self.restore_callback(id, callback);
            }
        }
        Ok(fired)
    }

    fn take_callback(&self, id: EventId) -> Option<EventCallback> {
        let mut inner = self.inner.borrow_mut();
        inner
            .registrations
            .iter_mut()
            .find(|r| r.id == id)
            .and_then(|r| r.callback.take())
    }

    fn restore_callback(&self, id: EventId, callback: EventCallback) {
        let mut inner = self.inner.borrow_mut();
        // The callback may have unregistered itself; drop it in that case.
        if let Some(reg) = inner.registrations.iter_mut().find(|r| r.id == id) {
            reg.callback = Some(callback);
        }
    }
}

impl Scheduler for PollScheduler {
    fn register(&self, mode: EventMode, fd: RawFd, callback: EventCallback) -> EventId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = EventId::new(inner.next_id);
        inner.registrations.push(Registration {
            id,
            fd,
            mode,
            callback: Some(callback),
        });
        id
    }

    fn unregister(&self, id: EventId) {
        let mut inner = self.inner.borrow_mut();
        inner.registrations.retain(|r| r.id != id);
    }
}
