//! Text records: one `timestamp,method,args...` line per event, the layout
//! [`CsvFeed`](crate::feeds::CsvFeed) replays.
use super::Frame;
use crate::error::LogError;
use crate::record::{Event, FieldValue};
use std::io::{self, BufRead, ErrorKind, Write};

pub(super) const HEADER: &str = "# timestamp_micros,method,args...";

pub(super) fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    writeln!(w, "{HEADER}")
}

/// Refuses records whose string fields would split or end the line; the
/// inner result carries I/O failures.
pub(super) fn write_record<W: Write>(w: &mut W, event: &Event) -> Result<io::Result<()>, LogError> {
    let breaks_line = event
        .fields()
        .iter()
        .any(|f| matches!(f, FieldValue::Str(s) if s.contains([',', '\n', '\r'])));
    if breaks_line {
        return Err(LogError::NotCsv { method: event.method() });
    }
    Ok(writeln!(w, "{}", event.to_csv()))
}

/// Next record line, stamped with `source`. Comments and blank lines are
/// passed over. A last line without its newline was cut short and ends the
/// file.
pub(super) fn read_record<R: BufRead>(r: &mut R, source: &str) -> io::Result<Frame> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if r.read_until(b'\n', &mut line)? == 0 || line.last() != Some(&b'\n') {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        let Ok(text) = std::str::from_utf8(&line) else {
            return Ok(Frame::Corrupt("line is not UTF-8".to_string()));
        };
        match Event::from_csv(source, text) {
            Ok(Some(event)) => return Ok(Frame::Record(event)),
            Ok(None) => {}
            Err(e) => return Ok(Frame::Corrupt(e.to_string())),
        }
    }
}
