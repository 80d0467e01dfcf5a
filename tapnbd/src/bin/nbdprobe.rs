//! nbdprobe - connect to an NBD export, report its geometry, read a sector.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use tapnbd::{
    ClientConfig, Completion, CompletionSink, NbdDriver, OpenFlags, PollScheduler, ReadRequest,
    SECTOR_SIZE,
};

#[derive(Parser)]
#[command(
    name = "nbdprobe",
    about = "Probe an NBD export: geometry plus a sample sector"
)]
struct Cli {
    /// Target: a unix socket path, HOST:PORT, or a passed-fd name.
    target: String,

    /// Export name for newstyle servers.
    #[arg(long, default_value = "")]
    export: String,

    /// Sector to read back.
    #[arg(long, default_value_t = 0)]
    sector: u64,

    /// Give up on the read after this many seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

#[derive(Default)]
struct ProbeSink {
    completions: RefCell<Vec<Completion>>,
}

impl CompletionSink for ProbeSink {
    fn complete(&self, completion: Completion) {
        self.completions.borrow_mut().push(completion);
    }

    fn forward_read(&self, _request: ReadRequest) {
        // The probe never opens in secondary mode
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let sched = Rc::new(PollScheduler::new());
    let sink = Rc::new(ProbeSink::default());

    let config = ClientConfig {
        export_name: cli.export.clone(),
        ..Default::default()
    };
    let driver = NbdDriver::open_with_config(
        &cli.target,
        OpenFlags::default(),
        config,
        sched.clone(),
        sink.clone(),
    )
    .with_context(|| format!("failed to open {}", cli.target))?;

    let info = driver.info();
    println!(
        "export: {} sectors of {} bytes ({} MiB)",
        info.sectors,
        info.sector_size,
        info.size_bytes() >> 20
    );

    if cli.sector >= info.sectors {
        bail!(
            "sector {} is beyond the export ({} sectors)",
            cli.sector,
            info.sectors
        );
    }

    driver
        .queue_read(ReadRequest {
            sector: cli.sector,
            secs: 1,
            buf: BytesMut::zeroed(SECTOR_SIZE as usize),
            token: 0,
        })
        .context("queue_read failed")?;

    let deadline = Instant::now() + Duration::from_secs(cli.timeout_secs);
    while sink.completions.borrow().is_empty() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for the read to complete");
        }
        sched
            .run_once(Some(Duration::from_millis(100)))
            .context("event loop error")?;
    }

    let completion = sink.completions.borrow_mut().remove(0);
    match completion.status {
        Ok(()) => {
            let buf = completion.buf.unwrap_or_default();
            println!("sector {}:", cli.sector);
            print_hex(&buf[..buf.len().min(64)]);
        }
        Err(errno) => bail!("read failed: {errno}"),
    }

    driver.close().context("close failed")?;
    Ok(())
}

fn print_hex(bytes: &[u8]) {
    for row in bytes.chunks(16) {
        let hex: Vec<String> = row.iter().map(|b| format!("{b:02x}")).collect();
        println!("  {}", hex.join(" "));
    }
}
