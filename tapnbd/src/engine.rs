//! The pipelined request engine.
//!
//! Owns a bounded pool of request slots and multiplexes them over one
//! non-blocking socket. Requests are transmitted in enqueue order; replies
//! arrive in whatever order the server chooses and are matched back by
//! handle. The writer callback is registered with the scheduler only while
//! something is pending; the reader callback stays registered for the life
//! of the connection.
//!
//! Everything here runs on a single event-loop thread. Entry points are
//! never re-entered while another is executing, so there is no locking;
//! completions are accumulated into a caller-provided vec and dispatched
//! by the driver layer after the engine borrow ends.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use nbd::{Handle, NbdCommand, NbdReply, NbdRequest};
use nix::errno::Errno;
use tracing::{error, info};

use crate::error::{QueueError, TransportError};
use crate::scheduler::{EventId, Scheduler};
use crate::slots::{SlotArena, SlotBody, SlotQueue};
use crate::transport::{read_some, write_some, IoProgress};
use crate::types::Completion;

/// Upper bound on simultaneously outstanding requests per connection.
pub const MAX_IN_FLIGHT: usize = 64;

/// Connection lifecycle. `DiscSent` covers the window between the
/// disconnect request leaving the send queue and the final disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Live,
    DiscSent,
    Dead,
}

// Handles must be unique among simultaneously in-flight requests; a
// process-wide counter truncated to 20 bits gives 2^20 ids against a few
// dozen outstanding slots.
static NEXT_HANDLE_ID: AtomicU32 = AtomicU32::new(0);

fn encode_handle(id: u32) -> Handle {
    let mut handle = [0u8; 8];
    let text = format!("td{:05x}", id & 0xf_ffff);
    handle[..7].copy_from_slice(text.as_bytes());
    handle
}

fn next_handle() -> Handle {
    encode_handle(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
}

fn display_handle(handle: &Handle) -> String {
    String::from_utf8_lossy(&handle[..7]).into_owned()
}

pub(crate) struct Engine {
    socket: Option<OwnedFd>,
    arena: SlotArena,
    writer_event: Option<EventId>,
    reader_event: Option<EventId>,

    // Staging area for the reply header currently being read, and the
    // sent-list slot it matched once parsed.
    reply_buf: [u8; NbdReply::SIZE_BYTES],
    reply_done: usize,
    reply_slot: Option<usize>,

    state: ConnState,
    // True only once the disconnect request is fully on the wire; a
    // connection that died with the DISC still queued never sets this.
    disc_sent: bool,
}

impl Engine {
    pub(crate) fn new(socket: OwnedFd) -> Self {
        Self {
            socket: Some(socket),
            arena: SlotArena::new(MAX_IN_FLIGHT),
            writer_event: None,
            reader_event: None,
            reply_buf: [0; NbdReply::SIZE_BYTES],
            reply_done: 0,
            reply_slot: None,
            state: ConnState::Live,
            disc_sent: false,
        }
    }

    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    pub(crate) fn take_socket(&mut self) -> Option<OwnedFd> {
        self.socket.take()
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn disc_sent(&self) -> bool {
        self.disc_sent
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.arena.len(SlotQueue::Free)
    }

    pub(crate) fn writer_registered(&self) -> bool {
        self.writer_event.is_some()
    }

    pub(crate) fn set_writer_event(&mut self, id: Option<EventId>) {
        self.writer_event = id;
    }

    pub(crate) fn set_reader_event(&mut self, id: Option<EventId>) {
        self.reader_event = id;
    }

    /// Enqueue a request. Returns whether the caller must register the
    /// writer callback. On a dead connection the request is completed
    /// with ETIMEDOUT before `Dead` is returned.
    pub(crate) fn queue(
        &mut self,
        command: NbdCommand,
        offset: u64,
        body: SlotBody,
        token: u64,
        completions: &mut Vec<Completion>,
    ) -> Result<bool, QueueError> {
        if self.arena.len(SlotQueue::Free) == 0 {
            return Err(QueueError::Busy);
        }
        if self.state == ConnState::Dead {
            let mut body = body;
            completions.push(Completion {
                token,
                buf: body.take_read_buf(),
                status: Err(Errno::ETIMEDOUT),
            });
            return Err(QueueError::Dead);
        }

        let Some(idx) = self.arena.head(SlotQueue::Free) else {
            return Err(QueueError::Busy);
        };
        let handle = next_handle();
        let length = body.len() as u32;

        let slot = self.arena.get_mut(idx);
        slot.token = token;
        slot.command = command;
        slot.handle = handle;
        slot.header = NbdRequest {
            command,
            handle,
            offset,
            length,
        }
        .to_bytes();
        slot.header_done = 0;
        slot.body = body;
        slot.body_done = 0;

        self.arena.move_to_tail(idx, SlotQueue::Pending);
        Ok(self.writer_event.is_none())
    }

    /// Writer callback: push pending requests onto the wire, in order,
    /// until the socket refuses more bytes. Once everything pending has
    /// been sent the writer is unregistered; if the disconnect request
    /// just left the queue the whole connection is torn down.
    pub(crate) fn writer_ready(&mut self, sched: &dyn Scheduler, completions: &mut Vec<Completion>) {
        let Some(fd) = self.fd() else { return };

        let mut cursor = self.arena.head(SlotQueue::Pending);
        while let Some(idx) = cursor {
            let next = self.arena.next(idx);

            match self.send_slot(fd, idx) {
                Ok(IoProgress::Partial) => return,
                Ok(IoProgress::Done) => {}
                Err(e) => {
                    error!(error = %e, "error sending request");
                    self.disable(sched, Errno::EIO, completions);
                    return;
                }
            }

            if self.arena.get(idx).command == NbdCommand::Disconnect {
                info!("sent disconnect request");
                // No reply follows a DISC; recycle the slot
                self.arena.move_to_tail(idx, SlotQueue::Free);
                self.state = ConnState::DiscSent;
                self.disc_sent = true;
            } else {
                self.arena.move_to_tail(idx, SlotQueue::Sent);
            }
            cursor = next;
        }

        self.unregister_writer(sched);

        if self.state == ConnState::DiscSent {
            self.disable(sched, Errno::EIO, completions);
        }
    }

    fn send_slot(&mut self, fd: RawFd, idx: usize) -> Result<IoProgress, TransportError> {
        let slot = self.arena.get_mut(idx);
        if write_some(fd, &slot.header, &mut slot.header_done)? == IoProgress::Partial {
            return Ok(IoProgress::Partial);
        }
        if let SlotBody::Write(buf) = &slot.body {
            if write_some(fd, buf, &mut slot.body_done)? == IoProgress::Partial {
                return Ok(IoProgress::Partial);
            }
        }
        Ok(IoProgress::Done)
    }

    /// Reader callback: stage the 16-byte reply header, match it to a
    /// sent request by handle, then consume the body for reads. Consumes
    /// at most one reply per invocation; a level-triggered scheduler
    /// fires it again while buffered replies remain.
    pub(crate) fn reader_ready(&mut self, sched: &dyn Scheduler, completions: &mut Vec<Completion>) {
        let Some(fd) = self.fd() else { return };

        if self.reply_slot.is_none() {
            match read_some(fd, &mut self.reply_buf, &mut self.reply_done) {
                Ok(IoProgress::Partial) => return, // need more data
                Ok(IoProgress::Done) => {}
                Err(e) => {
                    error!(error = %e, "error reading reply header");
                    self.disable(sched, Errno::EIO, completions);
                    return;
                }
            }

            let reply = match NbdReply::from_bytes(&self.reply_buf) {
                Ok(reply) => reply,
                Err(e) => {
                    error!(error = %e, "bad reply header");
                    self.disable(sched, Errno::EIO, completions);
                    return;
                }
            };
            if reply.error != 0 {
                error!(
                    code = reply.error,
                    handle = %display_handle(&reply.handle),
                    "server reported error in reply"
                );
                self.disable(sched, Errno::EIO, completions);
                return;
            }

            let matched = self
                .arena
                .find(SlotQueue::Sent, |slot| slot.handle == reply.handle);
            let Some(idx) = matched else {
                error!(
                    handle = %display_handle(&reply.handle),
                    "no sent request matches reply handle"
                );
                self.disable(sched, Errno::EIO, completions);
                return;
            };
            self.reply_slot = Some(idx);
        }

        let Some(idx) = self.reply_slot else { return };
        match self.arena.get(idx).command {
            NbdCommand::Read => {
                let progress = {
                    let slot = self.arena.get_mut(idx);
                    if let SlotBody::Read(buf) = &mut slot.body {
                        read_some(fd, buf, &mut slot.body_done)
                    } else {
                        Ok(IoProgress::Done)
                    }
                };
                match progress {
                    Ok(IoProgress::Partial) => return, // body still arriving
                    Ok(IoProgress::Done) => {}
                    Err(e) => {
                        error!(error = %e, "error reading reply body");
                        self.disable(sched, Errno::EIO, completions);
                        return;
                    }
                }
                let slot = self.arena.get_mut(idx);
                completions.push(Completion {
                    token: slot.token,
                    buf: slot.body.take_read_buf(),
                    status: Ok(()),
                });
            }
            NbdCommand::Write => {
                completions.push(Completion {
                    token: self.arena.get(idx).token,
                    buf: None,
                    status: Ok(()),
                });
            }
            NbdCommand::Disconnect => {
                // A DISC never reaches the sent list; a reply claiming to
                // match one means the peer is off the rails.
                error!("reply matched a disconnect request");
                self.disable(sched, Errno::EIO, completions);
                return;
            }
        }

        self.arena.move_to_tail(idx, SlotQueue::Free);
        self.reply_done = 0;
        self.reply_slot = None;
    }

    /// Connection-fatal teardown: unregister both callbacks and complete
    /// every outstanding request with `error`. Slots are not recycled;
    /// the connection is terminal and nothing here is touched again.
    pub(crate) fn disable(
        &mut self,
        sched: &dyn Scheduler,
        error: Errno,
        completions: &mut Vec<Completion>,
    ) {
        if self.state == ConnState::Dead {
            return;
        }

        info!("nbd client full disable");
        self.unregister_writer(sched);
        if let Some(id) = self.reader_event.take() {
            sched.unregister(id);
        }

        info!("cancelling sent requests");
        self.cancel_queue(SlotQueue::Sent, error, completions);
        info!("cancelling pending requests");
        self.cancel_queue(SlotQueue::Pending, error, completions);

        self.state = ConnState::Dead;
    }

    fn cancel_queue(
        &mut self,
        queue: SlotQueue,
        error: Errno,
        completions: &mut Vec<Completion>,
    ) {
        let mut cursor = self.arena.head(queue);
        while let Some(idx) = cursor {
            cursor = self.arena.next(idx);
            let slot = self.arena.get_mut(idx);
            info!(
                handle = %display_handle(&slot.handle),
                command = ?slot.command,
                length = slot.body.len(),
                error = %error,
                "cancelling request"
            );
            if slot.command == NbdCommand::Disconnect {
                continue;
            }
            completions.push(Completion {
                token: slot.token,
                buf: slot.body.take_read_buf(),
                status: Err(error),
            });
        }
    }

    fn unregister_writer(&mut self, sched: &dyn Scheduler) {
        if let Some(id) = self.writer_event.take() {
            sched.unregister(id);
        }
    }
}
