//! End-to-end scenarios: the full driver against in-process NBD servers,
//! driven through the poll scheduler.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use nbd::{
    ExportNameReply, NbdCommand, NbdOption, NbdReply, NbdRequest, NewstyleGreeting,
    OldstyleGreeting, NBD_OPT_EXPORT_NAME,
};
use nix::errno::Errno;
use tapnbd::{
    stash, ClientConfig, Completion, CompletionSink, ConnState, NbdDriver, OpenFlags,
    PollScheduler, QueueError, ReadRequest, WriteRequest, MAX_IN_FLIGHT,
};

#[derive(Default)]
struct TestSink {
    completions: RefCell<Vec<Completion>>,
    forwarded: RefCell<Vec<ReadRequest>>,
}

impl CompletionSink for TestSink {
    fn complete(&self, completion: Completion) {
        self.completions.borrow_mut().push(completion);
    }

    fn forward_read(&self, request: ReadRequest) {
        self.forwarded.borrow_mut().push(request);
    }
}

impl TestSink {
    fn count(&self) -> usize {
        self.completions.borrow().len()
    }

    fn take(&self) -> Vec<Completion> {
        std::mem::take(&mut self.completions.borrow_mut())
    }
}

fn pump(sched: &PollScheduler, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(
            Instant::now() < deadline,
            "timed out pumping the event loop"
        );
        sched.run_once(Some(Duration::from_millis(20))).unwrap();
    }
}

fn read_request(stream: &mut impl Read) -> Option<NbdRequest> {
    let mut header = [0u8; NbdRequest::SIZE_BYTES];
    stream.read_exact(&mut header).ok()?;
    Some(NbdRequest::from_bytes(&header).unwrap())
}

/// Oldstyle greeting followed by a loopback transmission phase over a
/// small in-memory disk. Unwritten bytes read back as 0xAB.
fn serve_loopback(mut stream: impl Read + Write, size_bytes: u64) {
    let greeting = OldstyleGreeting {
        size_bytes,
        flags: 0,
    };
    stream.write_all(&greeting.to_bytes()).unwrap();

    let mut disk = vec![0xABu8; size_bytes as usize];
    while let Some(request) = read_request(&mut stream) {
        let offset = request.offset as usize;
        let length = request.length as usize;
        match request.command {
            NbdCommand::Read => {
                stream
                    .write_all(&NbdReply::ok(request.handle).to_bytes())
                    .unwrap();
                stream.write_all(&disk[offset..offset + length]).unwrap();
            }
            NbdCommand::Write => {
                let mut body = vec![0u8; length];
                stream.read_exact(&mut body).unwrap();
                disk[offset..offset + length].copy_from_slice(&body);
                stream
                    .write_all(&NbdReply::ok(request.handle).to_bytes())
                    .unwrap();
            }
            NbdCommand::Disconnect => return,
        }
    }
}

fn spawn_unix_server<F>(serve: F) -> (PathBuf, tempfile::TempDir, JoinHandle<()>)
where
    F: FnOnce(UnixStream) + Send + 'static,
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nbd.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream);
    });
    (path, dir, handle)
}

fn open_driver(
    name: &str,
) -> (NbdDriver, Rc<PollScheduler>, Rc<TestSink>) {
    let sched = Rc::new(PollScheduler::new());
    let sink = Rc::new(TestSink::default());
    let driver = NbdDriver::open(
        name,
        OpenFlags::default(),
        sched.clone(),
        sink.clone(),
    )
    .unwrap();
    (driver, sched, sink)
}

#[test]
fn oldstyle_open_reports_geometry() {
    let (path, _dir, server) = spawn_unix_server(|mut stream| {
        let greeting = OldstyleGreeting {
            size_bytes: 0x2_0000_0000,
            flags: 0,
        };
        stream.write_all(&greeting.to_bytes()).unwrap();
        // Wait for the disconnect request
        while let Some(request) = read_request(&mut stream) {
            if request.command == NbdCommand::Disconnect {
                break;
            }
        }
    });

    let (driver, _sched, _sink) = open_driver(path.to_str().unwrap());
    let info = driver.info();
    assert_eq!(info.sectors, 16777216);
    assert_eq!(info.sector_size, 512);

    driver.close().unwrap();
    server.join().unwrap();
}

#[test]
fn newstyle_open_negotiates_export() {
    let (path, _dir, server) = spawn_unix_server(|mut stream| {
        stream
            .write_all(&NewstyleGreeting { gflags: 0x0003 }.to_bytes())
            .unwrap();

        let mut cflags = [0u8; 4];
        stream.read_exact(&mut cflags).unwrap();
        assert_eq!(u32::from_be_bytes(cflags), 0x0000_0003);

        let mut option = [0u8; NbdOption::SIZE_BYTES];
        stream.read_exact(&mut option).unwrap();
        let option = NbdOption::from_bytes(&option).unwrap();
        assert_eq!(option.option, NBD_OPT_EXPORT_NAME);

        let mut name = vec![0u8; option.length as usize];
        stream.read_exact(&mut name).unwrap();
        assert_eq!(name, b"vhd");

        let finish = ExportNameReply {
            size_bytes: 0x4000_0000,
            transmission_flags: 0x0001,
        };
        stream.write_all(&finish.to_bytes()).unwrap();

        while let Some(request) = read_request(&mut stream) {
            if request.command == NbdCommand::Disconnect {
                break;
            }
        }
    });

    let sched = Rc::new(PollScheduler::new());
    let sink = Rc::new(TestSink::default());
    let config = ClientConfig {
        export_name: "vhd".to_string(),
        ..Default::default()
    };
    let driver = NbdDriver::open_with_config(
        path.to_str().unwrap(),
        OpenFlags::default(),
        config,
        sched,
        sink,
    )
    .unwrap();

    assert_eq!(driver.info().sectors, 2097152);
    driver.close().unwrap();
    server.join().unwrap();
}

#[test]
fn read_roundtrip_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_nodelay(true).unwrap();
        serve_loopback(stream, 1024 * 1024);
    });

    let (driver, sched, sink) = open_driver(&format!("127.0.0.1:{port}"));
    assert_eq!(driver.info().sectors, 2048);

    driver
        .queue_read(ReadRequest {
            sector: 0,
            secs: 1,
            buf: BytesMut::zeroed(512),
            token: 1,
        })
        .unwrap();

    pump(&sched, || sink.count() == 1);
    let completion = sink.take().pop().unwrap();
    assert_eq!(completion.token, 1);
    assert_eq!(completion.status, Ok(()));
    let buf = completion.buf.unwrap();
    assert_eq!(buf.len(), 512);
    assert!(buf.iter().all(|&b| b == 0xAB));

    assert_eq!(driver.free_slots(), MAX_IN_FLIGHT);
    driver.close().unwrap();
    server.join().unwrap();
}

#[test]
fn written_sectors_read_back_per_sector() {
    let (path, _dir, server) =
        spawn_unix_server(|stream| serve_loopback(stream, 1024 * 1024));
    let (driver, sched, sink) = open_driver(path.to_str().unwrap());

    let pattern: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    driver
        .queue_write(WriteRequest {
            sector: 3,
            secs: 2,
            buf: Bytes::from(pattern.clone()),
            token: 1,
        })
        .unwrap();
    pump(&sched, || sink.count() == 1);
    assert_eq!(sink.take()[0].status, Ok(()));

    // Read both sectors back in one request
    driver
        .queue_read(ReadRequest {
            sector: 3,
            secs: 2,
            buf: BytesMut::zeroed(1024),
            token: 2,
        })
        .unwrap();
    pump(&sched, || sink.count() == 1);
    let completion = sink.take().pop().unwrap();
    assert_eq!(&completion.buf.unwrap()[..], &pattern[..]);

    // And the second sector alone
    driver
        .queue_read(ReadRequest {
            sector: 4,
            secs: 1,
            buf: BytesMut::zeroed(512),
            token: 3,
        })
        .unwrap();
    pump(&sched, || sink.count() == 1);
    let completion = sink.take().pop().unwrap();
    assert_eq!(&completion.buf.unwrap()[..], &pattern[512..]);

    assert_eq!(driver.free_slots(), MAX_IN_FLIGHT);
    driver.close().unwrap();
    server.join().unwrap();
}

#[test]
fn pipelined_reads_complete_out_of_order() {
    let (path, _dir, server) = spawn_unix_server(|mut stream| {
        let greeting = OldstyleGreeting {
            size_bytes: 1024 * 1024,
            flags: 0,
        };
        stream.write_all(&greeting.to_bytes()).unwrap();

        let first = read_request(&mut stream).unwrap();
        let second = read_request(&mut stream).unwrap();

        // Reply in reverse order
        stream
            .write_all(&NbdReply::ok(second.handle).to_bytes())
            .unwrap();
        stream
            .write_all(&vec![0x22u8; second.length as usize])
            .unwrap();
        stream
            .write_all(&NbdReply::ok(first.handle).to_bytes())
            .unwrap();
        stream
            .write_all(&vec![0x11u8; first.length as usize])
            .unwrap();

        while let Some(request) = read_request(&mut stream) {
            if request.command == NbdCommand::Disconnect {
                break;
            }
        }
    });

    let (driver, sched, sink) = open_driver(path.to_str().unwrap());
    for token in 1..=2 {
        driver
            .queue_read(ReadRequest {
                sector: token - 1,
                secs: 1,
                buf: BytesMut::zeroed(512),
                token,
            })
            .unwrap();
    }

    pump(&sched, || sink.count() == 2);
    let completions = sink.take();
    assert_eq!(completions[0].token, 2);
    assert!(completions[0].buf.as_ref().unwrap().iter().all(|&b| b == 0x22));
    assert_eq!(completions[1].token, 1);
    assert!(completions[1].buf.as_ref().unwrap().iter().all(|&b| b == 0x11));

    assert_eq!(driver.free_slots(), MAX_IN_FLIGHT);
    driver.close().unwrap();
    server.join().unwrap();
}

#[test]
fn peer_close_mid_reply_fails_the_connection() {
    let (path, _dir, server) = spawn_unix_server(|mut stream| {
        let greeting = OldstyleGreeting {
            size_bytes: 1024 * 1024,
            flags: 0,
        };
        stream.write_all(&greeting.to_bytes()).unwrap();

        let request = read_request(&mut stream).unwrap();
        // Half a reply header, then hang up
        let reply = NbdReply::ok(request.handle).to_bytes();
        stream.write_all(&reply[..8]).unwrap();
    });

    let (driver, sched, sink) = open_driver(path.to_str().unwrap());
    driver
        .queue_read(ReadRequest {
            sector: 0,
            secs: 1,
            buf: BytesMut::zeroed(512),
            token: 1,
        })
        .unwrap();

    pump(&sched, || sink.count() == 1);
    let completions = sink.take();
    assert_eq!(completions[0].token, 1);
    assert_eq!(completions[0].status, Err(Errno::EIO));
    assert_eq!(driver.state(), ConnState::Dead);

    // A dead connection rejects further work with an immediate timeout
    let result = driver.queue_read(ReadRequest {
        sector: 0,
        secs: 1,
        buf: BytesMut::zeroed(512),
        token: 2,
    });
    assert_eq!(result, Err(QueueError::Dead));
    let completions = sink.take();
    assert_eq!(completions[0].token, 2);
    assert_eq!(completions[0].status, Err(Errno::ETIMEDOUT));

    driver.close().unwrap();
    server.join().unwrap();
}

#[test]
fn close_flushes_disc_and_fails_outstanding_requests() {
    let (path, _dir, server) = spawn_unix_server(|mut stream| {
        let greeting = OldstyleGreeting {
            size_bytes: 1024 * 1024,
            flags: 0,
        };
        stream.write_all(&greeting.to_bytes()).unwrap();

        // Swallow the read without replying, then expect the disconnect
        let first = read_request(&mut stream).unwrap();
        assert_eq!(first.command, NbdCommand::Read);
        let second = read_request(&mut stream).unwrap();
        assert_eq!(second.command, NbdCommand::Disconnect);
        assert_eq!(second.length, 0);
    });

    let (driver, sched, sink) = open_driver(path.to_str().unwrap());
    driver
        .queue_read(ReadRequest {
            sector: 0,
            secs: 1,
            buf: BytesMut::zeroed(512),
            token: 5,
        })
        .unwrap();
    // Let the read reach the wire before closing
    sched.run_once(Some(Duration::from_millis(100))).unwrap();

    driver.close().unwrap();

    let completions = sink.take();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].token, 5);
    assert_eq!(completions[0].status, Err(Errno::EIO));
    // Disable tore down both event registrations
    assert_eq!(sched.registered(), 0);

    server.join().unwrap();
}

#[test]
fn stashed_fd_opens_and_parks_on_close() {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let server = thread::spawn(move || serve_loopback(theirs, 1024 * 1024));

    stash::stash_passed_fd(OwnedFd::from(ours), "e2e-conn");

    let (driver, sched, sink) = open_driver("e2e-conn");
    driver
        .queue_read(ReadRequest {
            sector: 1,
            secs: 1,
            buf: BytesMut::zeroed(512),
            token: 1,
        })
        .unwrap();
    pump(&sched, || sink.count() == 1);
    assert_eq!(sink.take()[0].status, Ok(()));

    driver.close().unwrap();
    server.join().unwrap();

    // The socket went back into the stash under the same name
    let parked = stash::global().lock().retrieve("e2e-conn");
    assert!(parked.is_some());
}

#[test]
fn dead_flush_never_parks_the_stashed_fd() {
    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let greeting = OldstyleGreeting {
        size_bytes: 1024 * 1024,
        flags: 0,
    };
    theirs.write_all(&greeting.to_bytes()).unwrap();

    stash::stash_passed_fd(OwnedFd::from(ours), "dead-park");
    let (driver, _sched, sink) = open_driver("dead-park");

    driver
        .queue_read(ReadRequest {
            sector: 0,
            secs: 1,
            buf: BytesMut::zeroed(512),
            token: 1,
        })
        .unwrap();

    // The peer vanishes before anything was transmitted, so the close
    // flush hits a send error with the DISC still queued behind the read.
    drop(theirs);
    driver.close().unwrap();

    let completions = sink.take();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].token, 1);
    assert_eq!(completions[0].status, Err(Errno::EIO));

    // The connection died mid-flush; its socket must not be offered up
    // for reuse by a later open of the same name.
    assert!(stash::global().lock().retrieve("dead-park").is_none());
}

#[test]
fn enqueue_beyond_capacity_reports_busy() {
    let (path, _dir, server) = spawn_unix_server(|mut stream| {
        let greeting = OldstyleGreeting {
            size_bytes: 64 * 1024 * 1024,
            flags: 0,
        };
        stream.write_all(&greeting.to_bytes()).unwrap();

        // Drain requests without ever replying
        while let Some(request) = read_request(&mut stream) {
            if request.command == NbdCommand::Disconnect {
                break;
            }
        }
    });

    let (driver, _sched, sink) = open_driver(path.to_str().unwrap());
    for token in 0..MAX_IN_FLIGHT as u64 {
        driver
            .queue_read(ReadRequest {
                sector: token,
                secs: 1,
                buf: BytesMut::zeroed(512),
                token,
            })
            .unwrap();
    }
    assert_eq!(driver.free_slots(), 0);

    let result = driver.queue_read(ReadRequest {
        sector: 0,
        secs: 1,
        buf: BytesMut::zeroed(512),
        token: 999,
    });
    assert_eq!(result, Err(QueueError::Busy));
    assert_eq!(sink.count(), 0);

    // With every slot occupied the DISC cannot even be queued; close
    // disables the connection and fails all outstanding requests.
    driver.close().unwrap();
    assert_eq!(sink.count(), MAX_IN_FLIGHT);
    assert!(sink
        .take()
        .iter()
        .all(|c| c.status == Err(Errno::EIO)));
    server.join().unwrap();
}
