use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use crossbeam_channel::{Receiver, bounded};
use dotenvy::dotenv;
use feed_sim::error::LogError;
use feed_sim::{
    ClientApi, CsvFeed, DataSource, EndpointConfig, EndpointId, Event, EventCapture, EventLog, LogFormat,
    SimulatedEndpoint, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    /// One length byte per record (.evt)
    Framed,
    /// Self-describing container with CRC per record (.evl)
    Container,
    /// One feed line per record, replayable with --feed (.csv)
    Csv,
}

impl From<Format> for LogFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Framed => LogFormat::Framed,
            Format::Container => LogFormat::Container,
            Format::Csv => LogFormat::Csv,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Replay recorded feeds through a simulated endpoint and record the callbacks")]
struct Args {
    /// CSV feeds to replay, in order (timestamp,method,args...)
    #[arg(long = "feed", env = "FEEDS", value_delimiter = ',', required = true)]
    feeds: Vec<PathBuf>,

    /// Directory for the event log
    #[arg(long, env = "OUT_DIR", default_value = "captures")]
    out_dir: PathBuf,

    /// Root name of the event log files
    #[arg(long, env = "LOG_ROOT", default_value = "feed")]
    root: String,

    /// On-disk format of the event log
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = Format::Container)]
    format: Format,

    /// Fixed delay before every replayed event, in milliseconds
    #[arg(long, env = "EVENT_LATENCY_MS", default_value_t = 0)]
    latency_ms: u64,

    /// Connection profile of the simulated endpoint
    #[arg(long, env = "PROFILE", default_value = "sim")]
    profile: String,

    /// Connection id of the simulated endpoint
    #[arg(long, env = "CONNECTION_ID", default_value_t = 0)]
    connection_id: u32,

    /// Client id passed to connect
    #[arg(long, env = "CLIENT_ID", default_value_t = 0)]
    client_id: i32,

    /// Bound on undelivered events; unbounded when not set
    #[arg(long, env = "INBOUND_CAPACITY")]
    inbound_capacity: Option<usize>,
}

fn writer_thread(mut log: EventLog, rx: Receiver<Event>) -> Result<u64> {
    let mut written = 0u64;
    for event in rx {
        match log.write(&event) {
            Ok(true) => written += 1,
            Ok(false) => warn!(method = %event.method(), "log writer closed, event dropped"),
            Err(LogError::RecordTooLarge { size, limit }) => {
                warn!(method = %event.method(), size, limit, "record too large for the log format, skipped")
            }
            Err(e @ LogError::NotCsv { .. }) => warn!(error = %e, "record skipped"),
            Err(e) => return Err(e).context("write event log"),
        }
    }
    log.close();
    for path in log.files()? {
        info!(path = %path.display(), "log file");
    }
    Ok(written)
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    // Still single-threaded here, so the local offset can be read.
    let clock = Arc::new(SystemClock::local());
    info!(offset = %clock.offset(), "log files are partitioned by date at this offset");

    let log = EventLog::new(&args.out_dir, &args.root, args.format.into()).with_clock(clock);
    let (tx, rx) = bounded::<Event>(8192);
    let writer = thread::Builder::new()
        .name("log-writer".into())
        .spawn(move || writer_thread(log, rx))
        .context("spawn log writer")?;

    let config = EndpointConfig { inbound_capacity: args.inbound_capacity, ..EndpointConfig::default() };
    let endpoint = SimulatedEndpoint::with_config(EndpointId::new(&args.profile, args.connection_id), config)
        .context("create simulated endpoint")?;
    let mut client = endpoint.create(EventCapture::new(&args.root, tx)).context("install capture listener")?;
    client.connect("localhost", 0, args.client_id);

    let latency = Duration::from_millis(args.latency_ms);
    let mut sources: Vec<DataSource> = Vec::with_capacity(args.feeds.len());
    for path in &args.feeds {
        let ds = CsvFeed::source(path)
            .with_context(|| format!("open feed {}", path.display()))?
            .with_latency(latency);
        if !endpoint.add_data_source(&ds) {
            bail!("endpoint {} refused feed {}", endpoint.id(), path.display());
        }
        sources.push(ds);
    }
    endpoint.run().context("start dispatch")?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)).context("install Ctrl+C handler")?;
    }

    for ds in &sources {
        ds.start();
    }
    loop {
        if stop.load(Ordering::SeqCst) {
            info!("interrupted");
            break;
        }
        if !endpoint.is_running() {
            warn!(endpoint = %endpoint.id(), "endpoint stopped before the feeds were drained");
            break;
        }
        if sources.iter().all(DataSource::finished) && endpoint.is_event_queue_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    client.disconnect();
    // Joining the dispatcher drops the listener, which ends the writer.
    endpoint.shutdown();
    drop(client);
    let written = writer
        .join()
        .map_err(|_| anyhow::anyhow!("log writer panicked"))??;

    let replayed: u64 = sources.iter().map(DataSource::events_pushed).sum();
    info!(
        replayed,
        delivered = endpoint.invocations(),
        written,
        sources = endpoint.sources_processed(),
        "done"
    );
    Ok(())
}
