//! Day-partitioned event log.
//!
//! An [`EventLog`] names one stream of events by `(directory, root)` and
//! hands out the [`Writer`] for the current day, rotating lazily: the date is
//! only checked when a writer is asked for. Files are named
//! `{dir}/{yyyy-mm-dd}-{root}.{ext}`.
//!
//! Three on-disk formats share the same writer/reader contract:
//!
//! - [`LogFormat::Framed`] (`.evt`): one unsigned length byte followed by the
//!   bincode payload. Files are appended to across runs. A record that
//!   encodes to more than 255 bytes is refused.
//! - [`LogFormat::Container`] (`.evl`): a magic tag and a header carrying the
//!   method schema, then frames of `u32` length, CRC32 and payload. Existing
//!   files are never reopened; a `-{n}` suffix picks a fresh name instead.
//! - [`LogFormat::Csv`] (`.csv`): one `timestamp,method,args...` line per
//!   record, readable by [`CsvFeed`](crate::feeds::CsvFeed). Appended to
//!   across runs. Records read back carry the file path as their source.
//!
//! Readers are forward-only. They stop at end of file (including a record
//! cut short by a crash) and on I/O errors, and skip records that fail to
//! decode.
mod container;
mod csv;
mod framed;

use crate::error::LogError;
use crate::record::Event;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::{Date, Duration as DateDuration, OffsetDateTime, UtcOffset};
use tracing::{debug, error, info, warn};

/// Source of "today" for rotation.
pub trait Clock: Send + Sync {
    fn today(&self) -> Date;
}

/// Wall-clock date at a fixed UTC offset. The default is UTC.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn utc() -> Self {
        SystemClock { offset: UtcOffset::UTC }
    }

    pub fn fixed(offset: UtcOffset) -> Self {
        SystemClock { offset }
    }

    /// Reads the local offset once. On Unix the offset is only available
    /// while the process is single-threaded, so call this before spawning
    /// threads; otherwise it falls back to UTC.
    pub fn local() -> Self {
        let offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
            warn!(error = %e, "local UTC offset unavailable, partitioning logs by UTC date");
            UtcOffset::UTC
        });
        SystemClock { offset }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl Clock for SystemClock {
    fn today(&self) -> Date {
        OffsetDateTime::now_utc().to_offset(self.offset).date()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    date: Mutex<Date>,
}

impl ManualClock {
    pub fn new(date: Date) -> Self {
        ManualClock { date: Mutex::new(date) }
    }

    pub fn set(&self, date: Date) {
        *self.date.lock() = date;
    }

    pub fn advance_days(&self, days: i64) {
        let mut date = self.date.lock();
        *date = date.saturating_add(DateDuration::days(days));
    }
}

impl Clock for ManualClock {
    fn today(&self) -> Date {
        *self.date.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Framed,
    Container,
    Csv,
}

impl LogFormat {
    pub fn extension(self) -> &'static str {
        match self {
            LogFormat::Framed => "evt",
            LogFormat::Container => "evl",
            LogFormat::Csv => "csv",
        }
    }

    pub fn from_path(path: &Path) -> Option<LogFormat> {
        match path.extension()?.to_str()? {
            "evt" => Some(LogFormat::Framed),
            "evl" => Some(LogFormat::Container),
            "csv" => Some(LogFormat::Csv),
            _ => None,
        }
    }

    /// Whether an existing file of this format can safely take more records.
    fn appendable(self) -> bool {
        matches!(self, LogFormat::Framed | LogFormat::Csv)
    }
}

fn date_stamp(date: Date) -> String {
    format!("{}-{:02}-{:02}", date.year(), date.month() as u8, date.day())
}

/// One `(directory, root)` event stream.
///
/// Owns the only live [`Writer`] for its stream.
pub struct EventLog {
    dir: PathBuf,
    root: String,
    format: LogFormat,
    clock: Arc<dyn Clock>,
    last_date: Option<Date>,
    current: Option<Writer>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>, root: impl Into<String>, format: LogFormat) -> Self {
        EventLog {
            dir: dir.into(),
            root: root.into(),
            format,
            clock: Arc::new(SystemClock::utc()),
            last_date: None,
            current: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Base file name for `date`, without any collision suffix.
    pub fn file_name(&self, date: Date) -> PathBuf {
        self.dir
            .join(format!("{}-{}.{}", date_stamp(date), self.root, self.format.extension()))
    }

    fn fresh_file_name(&self, date: Date) -> PathBuf {
        let base = self.file_name(date);
        if self.format.appendable() || !base.exists() {
            return base;
        }
        (1u32..)
            .map(|n| {
                self.dir.join(format!(
                    "{}-{}-{}.{}",
                    date_stamp(date),
                    self.root,
                    n,
                    self.format.extension()
                ))
            })
            .find(|p| !p.exists())
            .unwrap_or(base)
    }

    /// The writer for today, opening a new file when the day changed or the
    /// current writer was closed.
    pub fn writer(&mut self) -> Result<&mut Writer, LogError> {
        let today = self.clock.today();
        let new_day = self.last_date != Some(today);
        let closed = self.current.as_ref().is_none_or(Writer::is_closed);
        if new_day || closed {
            if let Some(mut old) = self.current.take() {
                if new_day {
                    info!(root = %self.root, path = %old.path().display(), "new day, closing log file");
                }
                old.close();
            }
            let path = self.fresh_file_name(today);
            let writer = Writer::create(path, self.format)?;
            info!(root = %self.root, path = %writer.path().display(), "writing to log file");
            self.last_date = Some(today);
            self.current = Some(writer);
        }
        self.current.as_mut().ok_or_else(|| {
            LogError::io(&self.dir, std::io::Error::other("log writer unavailable"))
        })
    }

    /// Append one event to today's file.
    pub fn write(&mut self, event: &Event) -> Result<bool, LogError> {
        self.writer()?.write(event)
    }

    /// Reader over today's base file.
    pub fn reader(&self) -> Result<Reader, LogError> {
        Reader::open(self.file_name(self.clock.today()))
    }

    /// All files of this stream in `dir`, oldest first.
    pub fn files(&self) -> Result<Vec<PathBuf>, LogError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| LogError::io(&self.dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| LogError::io(&self.dir, e))?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.owns(name) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn owns(&self, name: &str) -> bool {
        let Some(stem) = name.strip_suffix(self.format.extension()).and_then(|s| s.strip_suffix('.')) else {
            return false;
        };
        // yyyy-mm-dd-
        let Some(rest) = stem.get(11..) else {
            return false;
        };
        match rest.strip_prefix(self.root.as_str()) {
            Some("") => true,
            Some(suffix) => suffix
                .strip_prefix('-')
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
            None => false,
        }
    }

    /// Close the current writer, if any.
    pub fn close(&mut self) {
        if let Some(w) = self.current.as_mut() {
            w.close();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Ready,
    Closed,
}

pub struct Writer {
    path: PathBuf,
    format: LogFormat,
    out: BufWriter<File>,
    state: LogState,
    written: u64,
}

impl Writer {
    /// Open `path` for writing. Framed and CSV files are appended to;
    /// container files must not exist yet.
    pub fn create(path: impl Into<PathBuf>, format: LogFormat) -> Result<Writer, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| LogError::io(parent, e))?;
            }
        }
        let file = match format {
            LogFormat::Framed | LogFormat::Csv => OpenOptions::new().create(true).append(true).open(&path),
            LogFormat::Container => OpenOptions::new().write(true).create_new(true).open(&path),
        }
        .map_err(|e| LogError::io(&path, e))?;
        let fresh = file.metadata().map_err(|e| LogError::io(&path, e))?.len() == 0;
        let mut out = BufWriter::with_capacity(1 << 16, file);
        let header = match format {
            LogFormat::Container => container::write_header(&mut out),
            LogFormat::Csv if fresh => csv::write_header(&mut out),
            _ => Ok(()),
        };
        header.map_err(|e| LogError::io(&path, e))?;
        Ok(Writer { path, format, out, state: LogState::Ready, written: 0 })
    }

    /// Append one record. Returns `Ok(false)` once the writer is closed.
    ///
    /// An I/O failure closes the writer. A record the format cannot hold is
    /// refused without touching the file.
    pub fn write(&mut self, event: &Event) -> Result<bool, LogError> {
        if self.state != LogState::Ready {
            return Ok(false);
        }
        let res = match self.format {
            LogFormat::Framed => framed::write_record(&mut self.out, &bincode::serialize(event)?)?,
            LogFormat::Container => container::write_record(&mut self.out, &bincode::serialize(event)?)?,
            LogFormat::Csv => csv::write_record(&mut self.out, event)?,
        };
        if let Err(e) = res {
            error!(path = %self.path.display(), error = %e, "write failed, closing log file");
            self.close();
            return Err(LogError::io(&self.path, e));
        }
        self.written += 1;
        Ok(true)
    }

    pub fn flush(&mut self) -> Result<(), LogError> {
        self.out.flush().map_err(|e| LogError::io(&self.path, e))
    }

    pub fn count_written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == LogState::Closed
    }

    /// Flush and close. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == LogState::Closed {
            return;
        }
        if let Err(e) = self.out.flush().and_then(|_| self.out.get_ref().sync_data()) {
            warn!(path = %self.path.display(), error = %e, "flush on close failed");
        }
        self.state = LogState::Closed;
        debug!(path = %self.path.display(), written = self.written, "closed log writer");
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared view of whether a reader has closed.
#[derive(Debug, Clone, Default)]
pub struct ReaderStatus(Arc<AtomicBool>);

impl ReaderStatus {
    pub fn is_finished(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Outcome of reading one frame.
enum Frame {
    Record(Event),
    /// Frame read but unusable; reading goes on.
    Corrupt(String),
    /// Nothing was decoded; ends the stream.
    Empty,
}

pub struct Reader {
    path: PathBuf,
    // Source stamped on CSV records.
    name: String,
    format: LogFormat,
    input: Option<BufReader<File>>,
    status: ReaderStatus,
    read: u64,
}

impl Reader {
    /// Open a log file, picking the format from its extension.
    pub fn open(path: impl Into<PathBuf>) -> Result<Reader, LogError> {
        let path = path.into();
        let format = LogFormat::from_path(&path).ok_or_else(|| LogError::UnknownFormat(path.clone()))?;
        let file = File::open(&path).map_err(|e| LogError::io(&path, e))?;
        let mut input = BufReader::new(file);
        if format == LogFormat::Container {
            container::read_header(&mut input, &path)?;
        }
        debug!(path = %path.display(), ?format, "opened log reader");
        let name = path.display().to_string();
        Ok(Reader { path, name, format, input: Some(input), status: ReaderStatus::default(), read: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> ReaderStatus {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Records read so far.
    pub fn count_read(&self) -> u64 {
        self.read
    }

    /// Lazily read every remaining record. To read again, open a new reader.
    pub fn read_all(self) -> Records {
        Records { reader: self }
    }

    /// Like [`Reader::read_all`], mapping each record through `transform`.
    pub fn read_all_with<V, F>(self, transform: F) -> std::iter::Map<Records, F>
    where
        F: FnMut(Event) -> V,
    {
        self.read_all().map(transform)
    }

    pub fn close(&mut self) {
        if self.input.take().is_some() {
            info!(path = %self.path.display(), records = self.read, "closed log reader");
        }
        self.status.close();
    }

    fn next_frame(&mut self) -> std::io::Result<Frame> {
        let Some(input) = self.input.as_mut() else {
            return Err(ErrorKind::UnexpectedEof.into());
        };
        match self.format {
            LogFormat::Framed => framed::read_record(input),
            LogFormat::Container => container::read_record(input),
            LogFormat::Csv => csv::read_record(input, &self.name),
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forward-only iterator over a log file's records.
pub struct Records {
    reader: Reader,
}

impl Records {
    pub fn status(&self) -> ReaderStatus {
        self.reader.status()
    }
}

impl Iterator for Records {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        while !self.reader.is_finished() {
            let at = self.reader.read;
            match self.reader.next_frame() {
                Ok(Frame::Record(event)) => match event.validate() {
                    Ok(()) => {
                        self.reader.read += 1;
                        return Some(event);
                    }
                    Err(e) => warn!(path = %self.reader.path.display(), record = at, error = %e, "skipping record"),
                },
                Ok(Frame::Corrupt(reason)) => {
                    warn!(path = %self.reader.path.display(), record = at, %reason, "skipping record")
                }
                Ok(Frame::Empty) => {
                    debug!(path = %self.reader.path.display(), record = at, "empty frame, end of records");
                    self.reader.close();
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => self.reader.close(),
                Err(e) => {
                    error!(path = %self.reader.path.display(), record = at, error = %e, "read failed");
                    self.reader.close();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Method;
    use time::macros::date;

    fn tick(n: i32) -> Event {
        Event::new(Method::TickPrice, "test", 1_000 + n as i64, vec![100.into(), 1.into(), (20.0 + n as f64).into(), 1.into()])
            .unwrap()
    }

    #[test]
    fn file_names_follow_the_day() {
        let log = EventLog::new("/data/logs", "acct", LogFormat::Framed);
        assert_eq!(log.file_name(date!(2010 - 01 - 04)), PathBuf::from("/data/logs/2010-01-04-acct.evt"));
        let log = EventLog::new("/data/logs", "acct", LogFormat::Container);
        assert_eq!(log.file_name(date!(2010 - 01 - 04)), PathBuf::from("/data/logs/2010-01-04-acct.evl"));
    }

    #[test]
    fn owns_only_its_root() {
        let log = EventLog::new(".", "acct", LogFormat::Container);
        assert!(log.owns("2010-01-04-acct.evl"));
        assert!(log.owns("2010-01-04-acct-2.evl"));
        assert!(!log.owns("2010-01-04-acct2.evl"));
        assert!(!log.owns("2010-01-04-acct.evt"));
        assert!(!log.owns("2010-01-04-other.evl"));
    }

    #[test]
    fn round_trip_both_formats() {
        for format in [LogFormat::Framed, LogFormat::Container] {
            let dir = tempfile::tempdir().unwrap();
            let clock = Arc::new(ManualClock::new(date!(2010 - 01 - 04)));
            let mut log = EventLog::new(dir.path(), "rt", format).with_clock(clock);
            let sent: Vec<Event> = (0..50).map(tick).collect();
            for e in &sent {
                assert!(log.write(e).unwrap());
            }
            assert_eq!(log.writer().unwrap().count_written(), 50);
            log.close();
            let got: Vec<Event> = log.reader().unwrap().read_all().collect();
            assert_eq!(got, sent, "{format:?}");
        }
    }

    #[test]
    fn closed_writer_refuses_and_log_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(date!(2010 - 01 - 04)));
        let mut log = EventLog::new(dir.path(), "reopen", LogFormat::Framed).with_clock(clock);
        let w = log.writer().unwrap();
        w.write(&tick(0)).unwrap();
        w.close();
        w.close();
        assert!(!w.write(&tick(1)).unwrap());
        assert_eq!(w.state(), LogState::Closed);

        // A closed writer is replaced; framed files are appended to.
        let w = log.writer().unwrap();
        assert!(!w.is_closed());
        w.write(&tick(2)).unwrap();
        log.close();
        let got: Vec<i64> = log.reader().unwrap().read_all_with(|e| e.timestamp_micros()).collect();
        assert_eq!(got, vec![1_000, 1_002]);
        assert_eq!(log.files().unwrap().len(), 1);
    }

    #[test]
    fn container_never_clobbers_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let day = date!(2010 - 01 - 04);
        let clock = Arc::new(ManualClock::new(day));
        for run in 0..3 {
            let mut log = EventLog::new(dir.path(), "acct", LogFormat::Container).with_clock(clock.clone());
            log.write(&tick(run)).unwrap();
            log.close();
        }
        let log = EventLog::new(dir.path(), "acct", LogFormat::Container);
        let names: Vec<String> = log
            .files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["2010-01-04-acct-1.evl", "2010-01-04-acct-2.evl", "2010-01-04-acct.evl"]);
    }

    #[test]
    fn oversized_framed_record_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = Writer::create(dir.path().join("big.evt"), LogFormat::Framed).unwrap();
        let big = Event::new(Method::TickString, "test", 1, vec![1.into(), 45.into(), "x".repeat(300).into()]).unwrap();
        let err = w.write(&big).unwrap_err();
        assert!(matches!(err, LogError::RecordTooLarge { size, limit: 255 } if size > 255));
        // Still usable for records that fit.
        assert!(w.write(&tick(0)).unwrap());
        assert_eq!(w.count_written(), 1);
        w.close();
        assert_eq!(Reader::open(dir.path().join("big.evt")).unwrap().read_all().count(), 1);

        // The container format has no such limit.
        let mut w = Writer::create(dir.path().join("big.evl"), LogFormat::Container).unwrap();
        assert!(w.write(&big).unwrap());
        w.close();
        let got: Vec<Event> = Reader::open(dir.path().join("big.evl")).unwrap().read_all().collect();
        assert_eq!(got, vec![big]);
    }

    #[test]
    fn csv_log_rotates_and_replays_as_a_feed() {
        use crate::feeds::CsvFeed;
        use crossbeam_channel::unbounded;

        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(date!(2010 - 01 - 04)));
        let mut log = EventLog::new(dir.path(), "ticks", LogFormat::Csv).with_clock(clock.clone());
        let sent: Vec<Event> = (0..6).map(tick).collect();
        for (n, e) in sent.iter().enumerate() {
            if n == 4 {
                clock.advance_days(1);
            }
            assert!(log.write(e).unwrap());
        }
        log.close();
        let files = log.files().unwrap();
        assert_eq!(files, vec![log.file_name(date!(2010 - 01 - 04)), log.file_name(date!(2010 - 01 - 05))]);

        let (tx, rx) = unbounded();
        let feed = CsvFeed::source(&files[0]).unwrap();
        feed.set_sink(tx);
        feed.start();
        feed.run().unwrap();
        let replayed: Vec<Event> = rx.try_iter().collect();
        assert_eq!(replayed.len(), 4);
        for (got, want) in replayed.iter().zip(&sent) {
            assert_eq!(got.method(), want.method());
            assert_eq!(got.timestamp_micros(), want.timestamp_micros());
            assert_eq!(got.fields(), want.fields());
        }

        // Appending keeps a single header line.
        clock.set(date!(2010 - 01 - 05));
        let mut again = EventLog::new(dir.path(), "ticks", LogFormat::Csv).with_clock(clock);
        again.write(&tick(9)).unwrap();
        again.close();
        let text = std::fs::read_to_string(&files[1]).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with('#')).count(), 1);
        let read: Vec<i64> = again.reader().unwrap().read_all_with(|e| e.timestamp_micros()).collect();
        assert_eq!(read, vec![1_004, 1_005, 1_009]);
    }

    #[test]
    fn system_clock_dates_follow_its_offset() {
        assert_eq!(SystemClock::default().offset(), UtcOffset::UTC);
        assert_eq!(SystemClock::utc().today(), OffsetDateTime::now_utc().date());
        let east = time::macros::offset!(+14);
        let expected = OffsetDateTime::now_utc().to_offset(east).date();
        assert_eq!(SystemClock::fixed(east).today(), expected);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(Reader::open(&path), Err(LogError::UnknownFormat(_))));
        assert_eq!(LogFormat::from_path(Path::new("2010-01-04-acct.csv")), Some(LogFormat::Csv));
        assert!(matches!(Reader::open(dir.path().join("missing.evt")), Err(LogError::Io { .. })));
    }
}
