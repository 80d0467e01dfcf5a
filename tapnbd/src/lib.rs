//! tapnbd: NBD client driver for a user-space virtual-disk daemon.
//!
//! Translates sector read/write requests from an upper block layer into
//! pipelined NBD commands over a single stream socket (TCP or local), and
//! delivers replies back to the originating requests by handle. The
//! driver owns no event loop of its own: it registers readiness callbacks
//! with an external single-threaded [`Scheduler`] and never blocks outside
//! the one-shot handshake and the bounded disconnect flush in `close`.
//!
//! # Library Usage
//!
//! ```ignore
//! use tapnbd::{NbdDriver, OpenFlags, PollScheduler};
//!
//! let sched = Rc::new(PollScheduler::new());
//! let driver = NbdDriver::open("10.0.0.2:10809", OpenFlags::default(), sched.clone(), sink)?;
//! driver.queue_read(request)?;
//! sched.run_once(None)?;
//! ```

pub mod config;
pub mod driver;
mod engine;
pub mod error;
pub mod handshake;
pub mod scheduler;
mod slots;
pub mod stash;
pub mod transport;
pub mod types;

pub use config::ClientConfig;
pub use driver::NbdDriver;
pub use engine::{ConnState, MAX_IN_FLIGHT};
pub use error::{Error, HandshakeError, NbdError, QueueError, Result, TransportError};
pub use scheduler::{EventCallback, EventId, EventMode, PollScheduler, Scheduler};
pub use types::{
    Completion, CompletionSink, DiskInfo, OpenFlags, ReadRequest, WriteRequest, SECTOR_SHIFT,
    SECTOR_SIZE,
};

pub use nbd;
