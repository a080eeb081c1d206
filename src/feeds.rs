//! Concrete event producers: recorded CSV feeds, event log replays, live
//! relays and in-memory scripts.
use crate::capture::EventCapture;
use crate::error::{LogError, SourceError};
use crate::event_log::{Reader, ReaderStatus};
use crate::record::Event;
use crate::source::{DataSource, EventSink, Generate};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Replays a recorded feed of `timestamp,method,args...` lines.
///
/// Lines starting with `#` and methods outside the schema are skipped;
/// malformed lines are logged and skipped.
pub struct CsvFeed {
    path: PathBuf,
    lines: Option<BufReader<File>>,
}

impl CsvFeed {
    /// Fails right away when the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| SourceError::Open { path: path.clone(), source: e.into() })?;
        info!(path = %path.display(), "reading feed");
        Ok(CsvFeed { path, lines: Some(BufReader::new(file)) })
    }

    /// A ready-to-register source named after the file.
    pub fn source(path: impl AsRef<Path>) -> Result<DataSource, SourceError> {
        let feed = Self::open(path)?;
        Ok(DataSource::new(feed.path.display().to_string(), feed))
    }
}

impl Generate for CsvFeed {
    fn generate(&mut self, sink: &EventSink) -> anyhow::Result<()> {
        // Dropping the reader at the end closes the file.
        let Some(lines) = self.lines.take() else {
            return Ok(());
        };
        // Split on raw bytes so one undecodable line is skipped, not fatal.
        for (n, raw) in lines.split(b'\n').enumerate() {
            let raw = raw?;
            let Ok(line) = std::str::from_utf8(&raw) else {
                warn!(path = %self.path.display(), line = n + 1, "skipping line that is not UTF-8");
                continue;
            };
            match Event::from_csv(sink.resource(), line.strip_suffix('\r').unwrap_or(line)) {
                Ok(Some(event)) => sink.push(event)?,
                Ok(None) => {}
                Err(e) => warn!(path = %self.path.display(), line = n + 1, error = %e, "skipping malformed line"),
            }
        }
        Ok(())
    }
}

/// Replays an event log file.
pub struct LogReplay {
    reader: Option<Reader>,
    status: ReaderStatus,
}

impl LogReplay {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let reader = Reader::open(path)?;
        info!(path = %reader.path().display(), "replaying log");
        Ok(LogReplay { status: reader.status(), reader: Some(reader) })
    }

    /// A ready-to-register source named after the file.
    pub fn source(path: impl Into<PathBuf>) -> Result<DataSource, SourceError> {
        let path = path.into();
        let replay = Self::open(&path).map_err(|e| SourceError::Open { path: path.clone(), source: e.into() })?;
        Ok(DataSource::new(path.display().to_string(), replay))
    }

    /// True once the underlying reader has closed.
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

impl Generate for LogReplay {
    fn generate(&mut self, sink: &EventSink) -> anyhow::Result<()> {
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        for event in reader.read_all() {
            sink.push(event)?;
        }
        Ok(())
    }
}

/// Replays a fixed list of events.
pub struct StaticEvents {
    events: std::vec::IntoIter<Event>,
}

impl StaticEvents {
    pub fn new(events: Vec<Event>) -> Self {
        StaticEvents { events: events.into_iter() }
    }

    pub fn source(name: impl Into<String>, events: Vec<Event>) -> DataSource {
        DataSource::new(name, StaticEvents::new(events))
    }
}

impl Generate for StaticEvents {
    fn generate(&mut self, sink: &EventSink) -> anyhow::Result<()> {
        for event in self.events.by_ref() {
            sink.push(event)?;
        }
        Ok(())
    }
}

/// Push side of a [`Relay`]: a [`Listener`](crate::listener::Listener)
/// that turns live callbacks into relayed events.
pub type RelayHandle = EventCapture;

/// Forwards events handed to its [`RelayHandle`] as they arrive.
///
/// Ends once the disconnect notice has been relayed and nothing is left
/// queued, or when every handle is gone.
pub struct Relay {
    rx: Receiver<Event>,
}

const RELAY_POLL: Duration = Duration::from_millis(100);

impl Relay {
    pub fn new(name: impl Into<String>) -> (DataSource, RelayHandle) {
        let name: String = name.into();
        let (handle, rx) = EventCapture::channel(&name);
        (DataSource::new(name, Relay { rx }), handle)
    }
}

impl Generate for Relay {
    fn generate(&mut self, sink: &EventSink) -> anyhow::Result<()> {
        loop {
            match self.rx.recv_timeout(RELAY_POLL) {
                Ok(event) => sink.push(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
            if sink.terminal_seen() && self.rx.is_empty() {
                return Ok(());
            }
        }
    }

    fn terminal_condition(&self) -> Option<fn(&Event) -> bool> {
        Some(Event::is_disconnect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use crate::record::{DISCONNECT_CODE, Method};
    use crossbeam_channel::unbounded;
    use std::io::Write;
    use std::thread;

    #[test]
    fn csv_feed_skips_comments_and_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "# timestamp,method,args").unwrap();
        writeln!(f, "1,tickPrice,100,1,20.5,1").unwrap();
        writeln!(f, "2,tickSize,100,0,oops").unwrap();
        writeln!(f, "3,tickOptionComputation,1,2,3").unwrap();
        writeln!(f, "4,tickSize,100,0,300").unwrap();
        drop(f);

        let (tx, rx) = unbounded();
        let ds = CsvFeed::source(&path).unwrap();
        ds.set_sink(tx);
        ds.start();
        ds.run().unwrap();
        let got: Vec<(Method, i64)> = rx.try_iter().map(|e| (e.method(), e.timestamp_micros())).collect();
        assert_eq!(got, vec![(Method::TickPrice, 1), (Method::TickSize, 4)]);
    }

    #[test]
    fn csv_feed_skips_lines_that_are_not_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin1.csv");
        std::fs::write(&path, b"1,nextValidId,1\r\n2,tickString,5,45,caf\xe9\n3,nextValidId,3\n").unwrap();

        let (tx, rx) = unbounded();
        let ds = CsvFeed::source(&path).unwrap();
        ds.set_sink(tx);
        ds.start();
        ds.run().unwrap();
        let got: Vec<i64> = rx.try_iter().map(|e| e.timestamp_micros()).collect();
        assert_eq!(got, vec![1, 3]);
        assert!(ds.finished());
    }

    #[test]
    fn missing_feed_fails_at_construction() {
        let err = CsvFeed::open("/definitely/not/here.csv").err().unwrap();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[test]
    fn relay_finishes_after_disconnect_is_drained() {
        let (ds, mut handle) = Relay::new("live");
        let (tx, rx) = unbounded();
        ds.set_sink(tx);
        ds.start();
        let runner = {
            let ds = ds.clone();
            thread::spawn(move || ds.run())
        };
        handle.tick_price(1, 1, 10.0, 0);
        handle.tick_size(1, 0, 5);
        assert!(!ds.finished());
        handle.error(-1, DISCONNECT_CODE, "Connectivity between IB and TWS has been lost");
        runner.join().unwrap().unwrap();

        assert!(ds.finished());
        let got: Vec<Event> = rx.try_iter().collect();
        let methods: Vec<Method> = got.iter().map(Event::method).collect();
        assert_eq!(methods, vec![Method::TickPrice, Method::TickSize, Method::Error]);
        assert!(got.last().is_some_and(Event::is_disconnect));
        assert!(got.iter().all(|e| e.source() == "live"));
    }

    #[test]
    fn relay_ends_when_handles_are_dropped() {
        let (ds, handle) = Relay::new("short lived");
        let (tx, rx) = unbounded();
        ds.set_sink(tx);
        ds.start();
        let ev = Event::new(Method::NextValidId, "short lived", 1, vec![7.into()]).unwrap();
        assert!(handle.send(ev.clone()));
        drop(handle);
        ds.run().unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![ev]);
    }
}
