//! Driver facade: the narrow surface the upper block layer calls.
//!
//! `open` resolves the target name (filesystem socket path, `HOST:PORT`,
//! or a passed-fd identifier), connects, runs the handshake, and wires the
//! reader callback into the scheduler. `queue_read`/`queue_write` feed the
//! engine; `close` flushes a disconnect request under a deadline and parks
//! or closes the socket. This driver is a leaf: it has no parent image.

use std::cell::RefCell;
use std::net::{Ipv4Addr, TcpStream};
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::time::Instant;

use nbd::NbdCommand;
use nix::errno::Errno;
use nix::poll::PollFlags;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::engine::{ConnState, Engine};
use crate::error::{Error, QueueError, Result};
use crate::handshake;
use crate::scheduler::{EventCallback, EventMode, Scheduler};
use crate::slots::SlotBody;
use crate::stash;
use crate::transport::wait_for;
use crate::types::{
    Completion, CompletionSink, DiskInfo, OpenFlags, ReadRequest, WriteRequest, SECTOR_SIZE,
};

type SharedEngine = Rc<RefCell<Engine>>;

/// One open NBD connection, driven by an external event loop.
pub struct NbdDriver {
    engine: SharedEngine,
    sched: Rc<dyn Scheduler>,
    sink: Rc<dyn CompletionSink>,
    config: ClientConfig,
    info: DiskInfo,
    flags: OpenFlags,
    /// Set when the socket came out of the fd stash, so `close` can park
    /// it back under the same name.
    stash_name: Option<String>,
    closed: bool,
}

impl NbdDriver {
    pub fn open(
        name: &str,
        flags: OpenFlags,
        sched: Rc<dyn Scheduler>,
        sink: Rc<dyn CompletionSink>,
    ) -> Result<Self> {
        Self::open_with_config(name, flags, ClientConfig::default(), sched, sink)
    }

    pub fn open_with_config(
        name: &str,
        flags: OpenFlags,
        config: ClientConfig,
        sched: Rc<dyn Scheduler>,
        sink: Rc<dyn CompletionSink>,
    ) -> Result<Self> {
        config.validate()?;
        info!(name, secondary = flags.secondary, "opening nbd export");

        let (socket, stash_name) = connect_socket(name)?;
        // Any handshake failure leaves the socket to be closed on return
        let info = handshake::negotiate(&socket, &config.export_name, config.handshake_timeout())?;

        let driver = Self {
            engine: Rc::new(RefCell::new(Engine::new(socket))),
            sched,
            sink,
            config,
            info,
            flags,
            stash_name,
            closed: false,
        };
        driver.register_reader();

        if flags.secondary {
            info!("secondary mode: read requests will be forwarded");
        }
        Ok(driver)
    }

    pub fn info(&self) -> DiskInfo {
        self.info
    }

    pub fn state(&self) -> ConnState {
        self.engine.borrow().state()
    }

    pub fn free_slots(&self) -> usize {
        self.engine.borrow().free_slots()
    }

    pub fn queue_read(&self, request: ReadRequest) -> std::result::Result<(), QueueError> {
        if self.flags.secondary {
            self.sink.forward_read(request);
            return Ok(());
        }

        let expected = request.secs as usize * SECTOR_SIZE as usize;
        if request.buf.len() != expected {
            return Err(QueueError::BufferMismatch {
                expected,
                actual: request.buf.len(),
            });
        }
        let offset = request.sector * SECTOR_SIZE as u64;
        self.enqueue(
            NbdCommand::Read,
            offset,
            SlotBody::Read(request.buf),
            request.token,
        )
    }

    pub fn queue_write(&self, request: WriteRequest) -> std::result::Result<(), QueueError> {
        let expected = request.secs as usize * SECTOR_SIZE as usize;
        if request.buf.len() != expected {
            return Err(QueueError::BufferMismatch {
                expected,
                actual: request.buf.len(),
            });
        }
        let offset = request.sector * SECTOR_SIZE as u64;
        self.enqueue(
            NbdCommand::Write,
            offset,
            SlotBody::Write(request.buf),
            request.token,
        )
    }

    /// This driver is a leaf; it never has a parent image.
    pub fn parent_id(&self) -> Option<String> {
        None
    }

    pub fn validate_parent(&self, _parent: &NbdDriver) -> std::result::Result<(), Errno> {
        Err(Errno::EINVAL)
    }

    /// Send a disconnect request and release the connection. Outstanding
    /// requests complete with an error through the sink.
    pub fn close(mut self) -> Result<()> {
        self.close_inner();
        Ok(())
    }

    fn enqueue(
        &self,
        command: NbdCommand,
        offset: u64,
        body: SlotBody,
        token: u64,
    ) -> std::result::Result<(), QueueError> {
        let mut completions = Vec::new();
        let result = self
            .engine
            .borrow_mut()
            .queue(command, offset, body, token, &mut completions);
        deliver(&self.sink, completions);
        if result? {
            self.register_writer();
        }
        Ok(())
    }

    fn register_reader(&self) {
        let Some(fd) = self.engine.borrow().fd() else {
            return;
        };
        let callback = reader_callback(
            Rc::downgrade(&self.engine),
            Rc::clone(&self.sched),
            Rc::clone(&self.sink),
        );
        let id = self.sched.register(EventMode::Read, fd, callback);
        self.engine.borrow_mut().set_reader_event(Some(id));
    }

    fn register_writer(&self) {
        if self.engine.borrow().writer_registered() {
            return;
        }
        let Some(fd) = self.engine.borrow().fd() else {
            return;
        };
        let callback = writer_callback(
            Rc::downgrade(&self.engine),
            Rc::clone(&self.sched),
            Rc::clone(&self.sink),
        );
        let id = self.sched.register(EventMode::Write, fd, callback);
        self.engine.borrow_mut().set_writer_event(Some(id));
    }

    fn close_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.engine.borrow().state() == ConnState::Dead {
            info!("close: connection already dead");
            drop(self.engine.borrow_mut().take_socket());
            return;
        }

        info!("sending disconnect request");
        let mut completions = Vec::new();
        let queued = self.engine.borrow_mut().queue(
            NbdCommand::Disconnect,
            0,
            SlotBody::None,
            0,
            &mut completions,
        );
        deliver(&self.sink, completions);

        match queued {
            Ok(needs_writer) => {
                if needs_writer {
                    self.register_writer();
                }
                if !self.flush_disconnect() {
                    warn!("disconnect flush deadline exceeded");
                    self.force_disable(Errno::ETIMEDOUT);
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot queue disconnect request");
                self.force_disable(Errno::EIO);
            }
        }

        // Park only a socket whose disconnect request actually made it
        // onto the wire. One that died mid-flush, whether from the
        // deadline or a transport error, would poison a future open of
        // the same name.
        let disc_sent = self.engine.borrow().disc_sent();
        let socket = self.engine.borrow_mut().take_socket();
        match (socket, &self.stash_name, disc_sent) {
            (Some(socket), Some(name), true) => {
                stash::global().lock().park(socket, name);
                info!(name = %name, "parked nbd socket for reuse");
            }
            (Some(socket), _, _) => drop(socket),
            (None, _, _) => {}
        }
    }

    /// Drive the writer synchronously until the disconnect request has
    /// left the send queue, bounded by the configured deadline.
    fn flush_disconnect(&self) -> bool {
        let deadline = Instant::now() + self.config.disconnect_timeout();
        loop {
            pump_writer(&self.engine, &self.sched, &self.sink);
            if self.engine.borrow().state() != ConnState::Live {
                return true;
            }

            let Some(fd) = self.engine.borrow().fd() else {
                return false;
            };
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if wait_for(fd, PollFlags::POLLOUT, deadline - now).is_err() {
                return false;
            }
        }
    }

    fn force_disable(&self, error: Errno) {
        let mut completions = Vec::new();
        self.engine
            .borrow_mut()
            .disable(self.sched.as_ref(), error, &mut completions);
        deliver(&self.sink, completions);
    }
}

impl Drop for NbdDriver {
    fn drop(&mut self) {
        // Best effort disconnect if the caller never closed
        self.close_inner();
    }
}

/// Resolve an open target. Order: a filesystem path naming a stream
/// socket, then `HOST:PORT` with a dotted-quad IPv4 host, then a
/// passed-fd identifier. Returns the stash id alongside the socket when
/// the last form matched.
fn connect_socket(name: &str) -> Result<(OwnedFd, Option<String>)> {
    if let Ok(metadata) = std::fs::metadata(name) {
        if metadata.file_type().is_socket() {
            let stream = UnixStream::connect(name)?;
            info!(path = name, "connected to unix socket");
            return Ok((OwnedFd::from(stream), None));
        }
    }

    if let Some((host, port)) = name.split_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let addr: Ipv4Addr = host.parse().map_err(|_| Error::Open {
                name: name.to_string(),
                reason: "host is not a dotted-quad IPv4 address",
            })?;
            let stream = TcpStream::connect((addr, port))?;
            stream.set_nodelay(true)?;
            info!(peer = host, port, "connected to nbd server");
            return Ok((OwnedFd::from(stream), None));
        }
    }

    match stash::global().lock().retrieve(name) {
        Some(fd) => {
            info!(id = name, "using passed fd");
            Ok((fd, Some(name.to_string())))
        }
        None => Err(Error::Open {
            name: name.to_string(),
            reason: "no stashed fd with this name",
        }),
    }
}

fn writer_callback(
    engine: Weak<RefCell<Engine>>,
    sched: Rc<dyn Scheduler>,
    sink: Rc<dyn CompletionSink>,
) -> EventCallback {
    Box::new(move || {
        if let Some(engine) = engine.upgrade() {
            pump_writer(&engine, &sched, &sink);
        }
    })
}

fn reader_callback(
    engine: Weak<RefCell<Engine>>,
    sched: Rc<dyn Scheduler>,
    sink: Rc<dyn CompletionSink>,
) -> EventCallback {
    Box::new(move || {
        if let Some(engine) = engine.upgrade() {
            let mut completions = Vec::new();
            engine
                .borrow_mut()
                .reader_ready(sched.as_ref(), &mut completions);
            deliver(&sink, completions);
        }
    })
}

fn pump_writer(engine: &SharedEngine, sched: &Rc<dyn Scheduler>, sink: &Rc<dyn CompletionSink>) {
    let mut completions = Vec::new();
    engine
        .borrow_mut()
        .writer_ready(sched.as_ref(), &mut completions);
    deliver(sink, completions);
}

// Completions are dispatched only after the engine borrow has ended, so a
// sink that re-enters queue_read/queue_write does not trip the RefCell.
fn deliver(sink: &Rc<dyn CompletionSink>, completions: Vec<Completion>) {
    for completion in completions {
        sink.complete(completion);
    }
}
