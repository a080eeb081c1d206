use anyhow::{Context, Result, bail};
use clap::Parser;
use feed_sim::{Event, EventLog, LogFormat, Method, Reader};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Print the records of an event log")]
struct Args {
    /// Log file to read, or a directory together with --root
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Read every file of this root in the input directory, oldest first
    #[arg(long)]
    root: Option<String>,

    /// Print records as feed lines (timestamp,method,args...)
    #[arg(long, default_value_t = false)]
    csv: bool,

    /// Only print records of this method (e.g. tickPrice)
    #[arg(long)]
    method: Option<String>,

    /// Count records without printing them
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn files(args: &Args) -> Result<Vec<PathBuf>> {
    if !args.input.is_dir() {
        return Ok(vec![args.input.clone()]);
    }
    let Some(root) = &args.root else {
        bail!("{} is a directory; pass --root", args.input.display());
    };
    let mut all = Vec::new();
    for format in [LogFormat::Framed, LogFormat::Container, LogFormat::Csv] {
        all.extend(EventLog::new(&args.input, root.as_str(), format).files()?);
    }
    all.sort();
    Ok(all)
}

fn print(event: &Event, csv: bool) {
    if csv {
        println!("{}", event.to_csv());
    } else {
        let args: Vec<String> = event.fields().iter().map(ToString::to_string).collect();
        println!(
            "{:>16} {:<20} {:<12} {}",
            event.timestamp_micros(),
            event.method(),
            event.source(),
            args.join(" ")
        );
    }
}

fn play(path: &Path, args: &Args, only: Option<Method>) -> Result<u64> {
    let reader = Reader::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut shown = 0u64;
    for event in reader.read_all() {
        if only.is_some_and(|m| m != event.method()) {
            continue;
        }
        shown += 1;
        if !args.quiet {
            print(&event, args.csv);
        }
    }
    Ok(shown)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let only = match &args.method {
        Some(name) => Some(Method::from_name(name).with_context(|| format!("unknown method {name}"))?),
        None => None,
    };

    let files = files(&args)?;
    if files.is_empty() {
        bail!("no log files found in {}", args.input.display());
    }
    let mut total = 0u64;
    for path in &files {
        let n = play(path, &args, only)?;
        eprintln!("{}: {} records", path.display(), n);
        total += n;
    }
    eprintln!("Read {} records from {} file(s).", total, files.len());
    Ok(())
}
